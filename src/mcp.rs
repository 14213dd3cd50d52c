//! MCP server implementation using rmcp.
//!
//! Exposes the execution supervisor as MCP tools and encodes its results as
//! tagged text.

use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::service::RequestContext;
use rmcp::transport::stdio;
use rmcp::{
    tool, tool_handler, tool_router, ErrorData as McpError, RoleServer, ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::runner::ProcessRunner;
use crate::stager::{ExecutionUnit, DEFAULT_ENTRY_POINT};
use crate::supervisor::{ExecutionResult, ExecutionSupervisor, Status};

/// MCP server for dependency-resolving code execution.
#[derive(Clone)]
pub struct RunnerServer<R: Clone> {
    supervisor: Arc<ExecutionSupervisor<R>>,
    tool_router: ToolRouter<Self>,
}

/// An extra source file staged next to the entry point.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SourceFile {
    #[schemars(description = "Plain file name, e.g. 'helpers.py'")]
    pub name: String,

    #[schemars(description = "File contents")]
    pub content: String,
}

/// Parameters for the `execute_code` tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteCodeParams {
    #[schemars(description = "The code to execute. Paths under the mounted prefixes may be used as-is")]
    pub code: String,

    #[serde(default)]
    #[schemars(description = "Additional source files importable from the code")]
    pub files: Vec<SourceFile>,
}

/// Parameters for the `execute_file` tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteFileParams {
    #[schemars(description = "Virtual path of the file to execute, e.g. '/working/script.py'")]
    pub path: String,
}

/// Parameters for the `install_dependency` tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct InstallDependencyParams {
    #[schemars(description = "Package name, optionally with a version specifier")]
    pub name: String,
}

#[tool_router]
impl<R: ProcessRunner + Clone + 'static> RunnerServer<R> {
    /// Create a new server around a supervisor.
    pub fn new(supervisor: ExecutionSupervisor<R>) -> Self {
        Self {
            supervisor: Arc::new(supervisor),
            tool_router: Self::tool_router(),
        }
    }

    /// Execute a code string, installing missing dependencies as needed.
    #[tool(
        description = "Execute code. Missing modules are installed automatically and the code is re-run"
    )]
    async fn execute_code(
        &self,
        Parameters(params): Parameters<ExecuteCodeParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        Ok(self.handle_execute_code(params, &ctx.ct).await)
    }

    /// Execute a file from a mounted directory.
    #[tool(description = "Execute a file addressed by its virtual path")]
    async fn execute_file(
        &self,
        Parameters(params): Parameters<ExecuteFileParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        Ok(self.handle_execute_file(params, &ctx.ct).await)
    }

    /// Install a dependency without running any code.
    #[tool(description = "Install a package into the execution environment")]
    async fn install_dependency(
        &self,
        Parameters(params): Parameters<InstallDependencyParams>,
        ctx: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        Ok(self.handle_install_dependency(params, &ctx.ct).await)
    }

    /// Describe the virtual namespace.
    #[tool(description = "List the mounted virtual directories")]
    async fn list_mounts(&self) -> Result<CallToolResult, McpError> {
        Ok(CallToolResult::success(vec![Content::text(
            self.describe_mounts(),
        )]))
    }
}

impl<R: ProcessRunner + Clone + 'static> RunnerServer<R> {
    async fn handle_execute_code(
        &self,
        params: ExecuteCodeParams,
        cancel: &CancellationToken,
    ) -> CallToolResult {
        info!(
            code_len = params.code.len(),
            files = params.files.len(),
            "Executing code"
        );

        let result = if params.files.is_empty() {
            self.supervisor.execute_code(&params.code, cancel).await
        } else {
            let mut units = vec![ExecutionUnit::entry_point(DEFAULT_ENTRY_POINT, params.code)];
            units.extend(
                params
                    .files
                    .into_iter()
                    .map(|f| ExecutionUnit::support(f.name, f.content)),
            );
            self.supervisor.execute_units(&units, cancel).await
        };
        to_tool_result(&result)
    }

    async fn handle_execute_file(
        &self,
        params: ExecuteFileParams,
        cancel: &CancellationToken,
    ) -> CallToolResult {
        info!(path = %params.path, "Executing file");
        let result = self.supervisor.execute_file(&params.path, cancel).await;
        to_tool_result(&result)
    }

    async fn handle_install_dependency(
        &self,
        params: InstallDependencyParams,
        cancel: &CancellationToken,
    ) -> CallToolResult {
        info!(dependency = %params.name, "Installing dependency on request");
        let result = self
            .supervisor
            .install_dependency(&params.name, cancel)
            .await;
        to_tool_result(&result)
    }

    fn describe_mounts(&self) -> String {
        let mounts = self.supervisor.mounts();
        if mounts.is_empty() {
            return "No directories are mounted.".to_string();
        }
        mounts
            .entries()
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let primary = if i == 0 { " (working directory)" } else { "" };
                format!("{}{primary}", m.virtual_prefix)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[tool_handler]
impl<R: ProcessRunner + Clone + 'static> ServerHandler for RunnerServer<R> {
    fn get_info(&self) -> ServerInfo {
        let mounts = self.describe_mounts();

        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "code-runner-mcp".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Execute code with automatic installation of missing modules.\n\
                 Mounted directories:\n{mounts}\n\
                 \n\
                 Tools:\n\
                 - execute_code: run a code string (optionally with extra files)\n\
                 - execute_file: run a file by its virtual path\n\
                 - install_dependency: install a package\n\
                 - list_mounts: show the mounted directories"
            )),
        }
    }
}

/// Encode a result as tagged text.
pub fn encode_result(result: &ExecutionResult) -> String {
    let status = match result.status {
        Status::Success => "success",
        Status::Failure => "failure",
    };

    let mut out = format!(
        "<status>{status}</status>\n<output>{}</output>\n",
        escape(&result.output.join("\n"))
    );
    if let Some(error) = &result.error {
        out.push_str(&format!("<error>{}</error>\n", escape(error)));
    }
    out.push_str(&format!(
        "<resolved_dependencies>{}</resolved_dependencies>",
        escape(&result.resolved_dependencies.join(", "))
    ));
    out
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn to_tool_result(result: &ExecutionResult) -> CallToolResult {
    let content = vec![Content::text(encode_result(result))];
    if result.is_success() {
        CallToolResult::success(content)
    } else {
        CallToolResult::error(content)
    }
}

/// Serve the runner over stdio.
pub async fn serve_stdio<R: ProcessRunner + Clone + 'static>(
    supervisor: ExecutionSupervisor<R>,
) -> anyhow::Result<()> {
    let server = RunnerServer::new(supervisor);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}
