//! Request orchestration.
//!
//! One request moves through a bounded state machine:
//!
//! ```text
//! Staging -> Running -> Succeeded
//!                    -> Classifying -> Installing -> Running
//!                                   -> Failed
//! ```
//!
//! The loop terminates because every pass through `Installing` consumes a
//! run attempt (bounded by `max_attempts`) and a dependency name that is
//! never retried. The workspace and any ephemeral environment are released
//! exactly once on the way out, whatever the terminal state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::environment::{Environment, EnvironmentManager, EnvironmentSettings};
use crate::error::ExecError;
use crate::mounts::MountTable;
use crate::resolver::{Classification, DependencyResolver, InstallOutcome};
use crate::runner::{ExecutionAttempt, Invocation, ProcessRunner};
use crate::stager::{CodeStager, ExecutionUnit, Workspace, DEFAULT_ENTRY_POINT};

/// Terminal status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failure,
}

/// What a request hands back to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub status: Status,
    /// Stdout of the last run, one entry per line.
    pub output: Vec<String>,
    pub error: Option<String>,
    /// Dependencies attempted during the request, in the order tried.
    pub resolved_dependencies: Vec<String>,
}

impl ExecutionResult {
    pub const fn is_success(&self) -> bool {
        matches!(self.status, Status::Success)
    }
}

/// Limits applied to every request.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    /// Maximum interpreter runs per request.
    pub max_attempts: u32,
    /// Wall-clock bound of a single run.
    pub run_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            run_timeout: Duration::from_secs(30),
        }
    }
}

enum State {
    Running,
    Classifying(ExecutionAttempt),
    Installing {
        dependency: String,
        attempt: ExecutionAttempt,
    },
    Succeeded(ExecutionAttempt),
    Failed(ExecError),
}

/// Terminal state plus what was gathered on the way.
struct Outcome {
    result: Result<ExecutionAttempt, ExecError>,
    last_stdout: Option<String>,
    attempted: Vec<String>,
}

enum Request<'a> {
    Units(&'a [ExecutionUnit]),
    File(&'a str),
}

/// Runs requests end to end against one immutable configuration.
pub struct ExecutionSupervisor<R> {
    stager: CodeStager,
    environments: EnvironmentManager,
    resolver: DependencyResolver,
    runner: Arc<R>,
    settings: SupervisorSettings,
}

impl<R: ProcessRunner> ExecutionSupervisor<R> {
    pub fn new(
        stager: CodeStager,
        environments: EnvironmentManager,
        resolver: DependencyResolver,
        runner: R,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            stager,
            environments,
            resolver,
            runner: Arc::new(runner),
            settings,
        }
    }

    /// Build a supervisor from validated configuration.
    pub fn from_config(config: &Config, runner: R) -> anyhow::Result<Self> {
        let mounts = Arc::new(config.mount_table()?);
        let scratch_dir = config.scratch_dir();

        let stager = CodeStager::new(mounts, scratch_dir.clone());
        let environments = EnvironmentManager::new(EnvironmentSettings {
            environment_path: config.environment_path.clone(),
            ephemeral: config.ephemeral,
            interpreter: config.interpreter.clone(),
            package_manager: config.package_manager.clone(),
            scratch_dir,
            create_timeout: Duration::from_secs(config.install_timeout_seconds),
        });
        let resolver = DependencyResolver::new(
            config.package_aliases.clone(),
            Duration::from_secs(config.install_timeout_seconds),
        );
        let settings = SupervisorSettings {
            max_attempts: config.max_attempts,
            run_timeout: Duration::from_secs(config.timeout_seconds),
        };

        Ok(Self::new(stager, environments, resolver, runner, settings))
    }

    pub fn mounts(&self) -> &MountTable {
        self.stager.mounts()
    }

    /// Run a code string as the entry point.
    #[instrument(skip_all, fields(code_len = source.len()))]
    pub async fn execute_code(&self, source: &str, cancel: &CancellationToken) -> ExecutionResult {
        let units = [ExecutionUnit::entry_point(DEFAULT_ENTRY_POINT, source)];
        self.run_request(Request::Units(&units), cancel).await
    }

    /// Run a set of units; exactly one must be the entry point.
    #[instrument(skip_all, fields(files = units.len()))]
    pub async fn execute_units(
        &self,
        units: &[ExecutionUnit],
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        self.run_request(Request::Units(units), cancel).await
    }

    /// Run an existing file addressed by its virtual path.
    #[instrument(skip(self, cancel))]
    pub async fn execute_file(
        &self,
        virtual_path: &str,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        self.run_request(Request::File(virtual_path), cancel).await
    }

    /// Install one dependency into the configured environment, without running code.
    #[instrument(skip(self, cancel))]
    pub async fn install_dependency(&self, name: &str, cancel: &CancellationToken) -> ExecutionResult {
        let env = match self.environments.acquire(&*self.runner, cancel).await {
            Ok(env) => env,
            Err(e) => return self.failure(None, &e, None, Vec::new()),
        };

        let cwd = self.environments.settings().scratch_dir.clone();
        let outcome = self
            .resolver
            .install(&*self.runner, &env, name, &cwd, cancel)
            .await;
        self.environments.release(env);

        match outcome {
            Ok(InstallOutcome::Installed { output }) => ExecutionResult {
                status: Status::Success,
                output: split_lines(&self.stager.to_virtual_text(None, &output)),
                error: None,
                resolved_dependencies: vec![name.to_string()],
            },
            Ok(InstallOutcome::Failed { diagnostic }) => ExecutionResult {
                status: Status::Failure,
                output: Vec::new(),
                error: Some(self.stager.to_virtual_text(None, &diagnostic)),
                resolved_dependencies: vec![name.to_string()],
            },
            Err(e) => self.failure(None, &e, None, Vec::new()),
        }
    }

    async fn run_request(&self, request: Request<'_>, cancel: &CancellationToken) -> ExecutionResult {
        // Staging
        let staged = match request {
            Request::Units(units) => self.stager.stage(units),
            Request::File(path) => self.stager.stage_file(path),
        };
        let workspace = match staged {
            Ok(ws) => ws,
            Err(e) => {
                warn!(error = %e, "Staging failed");
                return self.failure(None, &e, None, Vec::new());
            }
        };

        let env = match self.environments.acquire(&*self.runner, cancel).await {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "Environment unavailable");
                let result = self.failure(Some(&workspace), &e, None, Vec::new());
                workspace.close();
                return result;
            }
        };

        let outcome = self.drive(&workspace, &env, cancel).await;

        let result = match outcome.result {
            Ok(attempt) => ExecutionResult {
                status: Status::Success,
                output: split_lines(&self.stager.to_virtual_text(Some(&workspace), &attempt.stdout)),
                error: None,
                resolved_dependencies: outcome.attempted,
            },
            Err(e) => self.failure(
                Some(&workspace),
                &e,
                outcome.last_stdout.as_deref(),
                outcome.attempted,
            ),
        };

        self.environments.release(env);
        workspace.close();
        result
    }

    async fn drive(
        &self,
        workspace: &Workspace,
        env: &Environment,
        cancel: &CancellationToken,
    ) -> Outcome {
        let mut attempted: Vec<String> = Vec::new();
        let mut last_stdout = None;
        let mut runs: u32 = 0;
        let mut state = State::Running;

        loop {
            state = match state {
                State::Running => {
                    if cancel.is_cancelled() {
                        State::Failed(ExecError::Cancelled)
                    } else {
                        runs += 1;
                        info!(
                            attempt = runs,
                            interpreter = %env.interpreter.display(),
                            "Running code"
                        );
                        match self.runner.run(&self.invocation(workspace, env), cancel).await {
                            Ok(attempt) => {
                                last_stdout = Some(attempt.stdout.clone());
                                if attempt.succeeded() {
                                    State::Succeeded(attempt)
                                } else {
                                    State::Classifying(attempt)
                                }
                            }
                            Err(e) => State::Failed(e.into()),
                        }
                    }
                }

                State::Classifying(attempt) => match self.resolver.classify(&attempt.stderr) {
                    Classification::MissingDependency(dependency)
                        if attempted.contains(&dependency) =>
                    {
                        info!(dependency = %dependency, "Dependency already attempted, giving up");
                        State::Failed(ExecError::MissingDependencyUnresolved {
                            dependency,
                            diagnostic: attempt.stderr,
                        })
                    }
                    Classification::MissingDependency(dependency)
                        if runs >= self.settings.max_attempts =>
                    {
                        info!(
                            dependency = %dependency,
                            max_attempts = self.settings.max_attempts,
                            "Retry ceiling reached"
                        );
                        State::Failed(ExecError::MissingDependencyUnresolved {
                            dependency,
                            diagnostic: attempt.stderr,
                        })
                    }
                    Classification::MissingDependency(dependency) => {
                        info!(dependency = %dependency, "Missing dependency detected");
                        State::Installing {
                            dependency,
                            attempt,
                        }
                    }
                    Classification::OtherFailure => State::Failed(ExecError::OtherFailure {
                        diagnostic: attempt.stderr,
                    }),
                },

                State::Installing {
                    dependency,
                    attempt,
                } => {
                    // Recorded before the attempt so a failing install is never retried
                    attempted.push(dependency.clone());
                    let installed = self
                        .resolver
                        .install(&*self.runner, env, &dependency, workspace.path(), cancel)
                        .await;
                    match installed {
                        Ok(InstallOutcome::Installed { .. }) => State::Running,
                        Ok(InstallOutcome::Failed { diagnostic }) => {
                            State::Failed(ExecError::MissingDependencyUnresolved {
                                dependency,
                                diagnostic: join_diagnostics(&attempt.stderr, &diagnostic),
                            })
                        }
                        Err(ExecError::Cancelled) => State::Failed(ExecError::Cancelled),
                        Err(e) => State::Failed(ExecError::MissingDependencyUnresolved {
                            dependency,
                            diagnostic: join_diagnostics(&attempt.stderr, &e.to_string()),
                        }),
                    }
                }

                State::Succeeded(attempt) => {
                    return Outcome {
                        result: Ok(attempt),
                        last_stdout,
                        attempted,
                    };
                }

                State::Failed(e) => {
                    return Outcome {
                        result: Err(e),
                        last_stdout,
                        attempted,
                    };
                }
            };
        }
    }

    fn invocation(&self, workspace: &Workspace, env: &Environment) -> Invocation {
        let cwd: PathBuf = self
            .stager
            .mounts()
            .primary()
            .map_or_else(|| workspace.path().to_path_buf(), |m| m.host_path.clone());

        let mut invocation = Invocation::new(&env.interpreter, cwd, self.settings.run_timeout)
            .arg(workspace.entry_point().as_os_str());
        invocation.envs.extend(env.activation_vars());
        invocation
    }

    fn failure(
        &self,
        workspace: Option<&Workspace>,
        error: &ExecError,
        stdout: Option<&str>,
        attempted: Vec<String>,
    ) -> ExecutionResult {
        ExecutionResult {
            status: Status::Failure,
            output: stdout
                .map(|s| split_lines(&self.stager.to_virtual_text(workspace, s)))
                .unwrap_or_default(),
            error: Some(self.stager.to_virtual_text(workspace, &error.to_string())),
            resolved_dependencies: attempted,
        }
    }
}

fn split_lines(text: &str) -> Vec<String> {
    text.split('\n').map(str::to_string).collect()
}

fn join_diagnostics(run_stderr: &str, install_output: &str) -> String {
    format!("{}\n{}", run_stderr.trim_end(), install_output.trim_end())
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::environment::env_binaries;
    use crate::error::RunError;
    use crate::mounts::MountEntry;
    use crate::runner::testing::{exited, FakeRunner};

    fn is_install(inv: &Invocation) -> bool {
        inv.args.first().is_some_and(|a| a == "install")
    }

    fn is_venv(inv: &Invocation) -> bool {
        inv.args.first().is_some_and(|a| a == "-m")
    }

    fn is_run(inv: &Invocation) -> bool {
        !is_install(inv) && !is_venv(inv)
    }

    /// Lay out a venv's interpreter the way `-m venv <root>` would.
    fn create_venv(inv: &Invocation) {
        let root = PathBuf::from(inv.args.last().unwrap());
        let (interpreter, _) = env_binaries(&root);
        std::fs::create_dir_all(interpreter.parent().unwrap()).unwrap();
        std::fs::write(&interpreter, "").unwrap();
    }

    fn missing(name: &str) -> String {
        format!(
            "Traceback (most recent call last):\n  File \"main.py\", line 1, in <module>\nModuleNotFoundError: No module named '{name}'\n"
        )
    }

    struct Fixture {
        scratch: tempfile::TempDir,
        mounts: Vec<MountEntry>,
        ephemeral: bool,
        max_attempts: u32,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                scratch: tempfile::tempdir().unwrap(),
                mounts: Vec::new(),
                ephemeral: false,
                max_attempts: 5,
            }
        }

        fn supervisor<R: ProcessRunner>(&self, runner: R) -> ExecutionSupervisor<R> {
            let mounts = Arc::new(MountTable::new(self.mounts.clone()));
            let scratch = self.scratch.path().to_path_buf();
            ExecutionSupervisor::new(
                CodeStager::new(mounts, scratch.clone()),
                EnvironmentManager::new(EnvironmentSettings {
                    environment_path: None,
                    ephemeral: self.ephemeral,
                    interpreter: PathBuf::from("python3"),
                    package_manager: PathBuf::from("pip3"),
                    scratch_dir: scratch,
                    create_timeout: Duration::from_secs(60),
                }),
                DependencyResolver::new(Default::default(), Duration::from_secs(60)),
                runner,
                SupervisorSettings {
                    max_attempts: self.max_attempts,
                    run_timeout: Duration::from_secs(5),
                },
            )
        }

        fn assert_clean(&self) {
            let leftovers: Vec<_> = std::fs::read_dir(self.scratch.path())
                .unwrap()
                .map(|e| e.unwrap().path())
                .collect();
            assert!(leftovers.is_empty(), "left behind: {leftovers:?}");
        }
    }

    /// Interpreter fails until the named package has been installed.
    fn needs(package: &'static str) -> FakeRunner {
        let installed = Arc::new(Mutex::new(Vec::<String>::new()));
        FakeRunner::new(move |inv| {
            if is_install(inv) {
                let name = inv.args[1].to_string_lossy().into_owned();
                installed.lock().unwrap().push(name);
                exited(0, "Successfully installed\n", "")
            } else if installed.lock().unwrap().iter().any(|n| n == package) {
                exited(0, "ok\n", "")
            } else {
                exited(1, "", &missing(package))
            }
        })
    }

    #[tokio::test]
    async fn hello_world_succeeds_without_dependencies() {
        let fx = Fixture::new();
        let runner = FakeRunner::new(|_| exited(0, "hello\n", ""));
        let supervisor = fx.supervisor(runner);

        let result = supervisor
            .execute_code("print(\"hello\")", &CancellationToken::new())
            .await;

        assert_eq!(
            result,
            ExecutionResult {
                status: Status::Success,
                output: vec!["hello".into(), String::new()],
                error: None,
                resolved_dependencies: Vec::new(),
            }
        );
        fx.assert_clean();
    }

    #[tokio::test]
    async fn missing_dependency_is_installed_then_retried() {
        let fx = Fixture::new();
        let supervisor = fx.supervisor(needs("requests"));

        let result = supervisor
            .execute_code("import requests", &CancellationToken::new())
            .await;

        assert!(result.is_success(), "{result:?}");
        assert_eq!(result.resolved_dependencies, vec!["requests".to_string()]);
        assert_eq!(supervisor.runner.installs(), vec!["requests".to_string()]);
        assert_eq!(supervisor.runner.calls().iter().filter(|c| is_run(c)).count(), 2);
        fx.assert_clean();
    }

    #[tokio::test]
    async fn same_dependency_is_never_installed_twice() {
        let fx = Fixture::new();
        let runner = FakeRunner::new(|inv| {
            if is_install(inv) {
                exited(0, "Successfully installed ghost\n", "")
            } else {
                exited(1, "", &missing("ghost"))
            }
        });
        let supervisor = fx.supervisor(runner);

        let result = supervisor
            .execute_code("import ghost", &CancellationToken::new())
            .await;

        assert_eq!(result.status, Status::Failure);
        assert_eq!(supervisor.runner.installs(), vec!["ghost".to_string()]);
        assert_eq!(result.resolved_dependencies, vec!["ghost".to_string()]);
        assert!(result.error.unwrap().contains("No module named 'ghost'"));
        fx.assert_clean();
    }

    #[tokio::test]
    async fn run_attempts_never_exceed_ceiling() {
        let fx = Fixture::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let runner = FakeRunner::new(move |inv| {
            if is_install(inv) {
                exited(0, "", "")
            } else {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                exited(1, "", &missing(&format!("dep{n}")))
            }
        });
        let supervisor = fx.supervisor(runner);

        let result = supervisor
            .execute_code("import everything", &CancellationToken::new())
            .await;

        assert_eq!(result.status, Status::Failure);
        let runs = supervisor.runner.calls().iter().filter(|c| is_run(c)).count();
        assert_eq!(runs, 5);
        assert_eq!(supervisor.runner.installs().len(), 4);
        assert_eq!(result.resolved_dependencies, vec!["dep0", "dep1", "dep2", "dep3"]);
        fx.assert_clean();
    }

    #[tokio::test]
    async fn ceiling_of_one_never_installs() {
        let mut fx = Fixture::new();
        fx.max_attempts = 1;
        let supervisor = fx.supervisor(needs("requests"));

        let result = supervisor
            .execute_code("import requests", &CancellationToken::new())
            .await;

        assert_eq!(result.status, Status::Failure);
        assert!(supervisor.runner.installs().is_empty());
        assert!(result.resolved_dependencies.is_empty());
    }

    #[tokio::test]
    async fn uninstallable_dependency_is_attempted_once() {
        let fx = Fixture::new();
        let runner = FakeRunner::new(|inv| {
            if is_install(inv) {
                exited(
                    1,
                    "",
                    "ERROR: No matching distribution found for not_a_real_pkg\n",
                )
            } else {
                exited(1, "", &missing("not_a_real_pkg"))
            }
        });
        let supervisor = fx.supervisor(runner);

        let result = supervisor
            .execute_code("import not_a_real_pkg", &CancellationToken::new())
            .await;

        assert_eq!(result.status, Status::Failure);
        assert_eq!(result.resolved_dependencies, vec!["not_a_real_pkg".to_string()]);
        let error = result.error.unwrap();
        assert!(error.contains("No module named 'not_a_real_pkg'"));
        assert!(error.contains("No matching distribution"));
        assert_eq!(supervisor.runner.calls().iter().filter(|c| is_run(c)).count(), 1);
        fx.assert_clean();
    }

    #[tokio::test]
    async fn other_failures_are_not_retried() {
        let fx = Fixture::new();
        let runner = FakeRunner::new(|_| {
            exited(1, "partial\n", "NameError: name 'x' is not defined\n")
        });
        let supervisor = fx.supervisor(runner);

        let result = supervisor.execute_code("x", &CancellationToken::new()).await;

        assert_eq!(result.status, Status::Failure);
        assert_eq!(result.output, vec!["partial".to_string(), String::new()]);
        assert_eq!(
            result.error.as_deref(),
            Some("NameError: name 'x' is not defined\n")
        );
        assert_eq!(supervisor.runner.calls().len(), 1);
        fx.assert_clean();
    }

    #[tokio::test]
    async fn timeout_is_terminal() {
        let fx = Fixture::new();
        let runner = FakeRunner::new(|inv| Err(RunError::TimedOut(inv.timeout)));
        let supervisor = fx.supervisor(runner);

        let result = supervisor
            .execute_code("while True: pass", &CancellationToken::new())
            .await;

        assert_eq!(result.status, Status::Failure);
        assert!(result.error.unwrap().contains("timed out"));
        assert_eq!(supervisor.runner.calls().len(), 1);
        fx.assert_clean();
    }

    /// Blocks every run until the request is cancelled.
    struct HangingRunner;

    #[async_trait]
    impl ProcessRunner for HangingRunner {
        async fn run(
            &self,
            _invocation: &Invocation,
            cancel: &CancellationToken,
        ) -> Result<ExecutionAttempt, RunError> {
            cancel.cancelled().await;
            Err(RunError::Cancelled)
        }
    }

    #[tokio::test]
    async fn cancellation_still_cleans_up() {
        let fx = Fixture::new();
        let supervisor = fx.supervisor(HangingRunner);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let result = supervisor.execute_code("import time", &cancel).await;

        assert_eq!(result.status, Status::Failure);
        assert_eq!(result.error.as_deref(), Some("Execution was cancelled"));
        fx.assert_clean();
    }

    #[tokio::test]
    async fn dropped_request_still_cleans_up() {
        let fx = Fixture::new();
        let supervisor = fx.supervisor(HangingRunner);
        let cancel = CancellationToken::new();

        let timed = tokio::time::timeout(
            Duration::from_millis(50),
            supervisor.execute_code("import time", &cancel),
        )
        .await;

        assert!(timed.is_err());
        fx.assert_clean();
    }

    #[tokio::test]
    async fn ephemeral_environment_is_removed_after_success_and_failure() {
        let mut fx = Fixture::new();
        fx.ephemeral = true;
        let runner = FakeRunner::new(|inv| {
            if is_venv(inv) {
                create_venv(inv);
                exited(0, "", "")
            } else if is_install(inv) {
                exited(1, "", "ERROR: nope\n")
            } else if Path::new(&inv.args[0]).file_name() == Some(std::ffi::OsStr::new("fail.py")) {
                exited(1, "", &missing("nope"))
            } else {
                exited(0, "done\n", "")
            }
        });
        let supervisor = fx.supervisor(runner);

        let ok = supervisor.execute_code("print(1)", &CancellationToken::new()).await;
        assert!(ok.is_success());
        fx.assert_clean();

        let units = [ExecutionUnit::entry_point("fail.py", "import nope")];
        let failed = supervisor
            .execute_units(&units, &CancellationToken::new())
            .await;
        assert_eq!(failed.status, Status::Failure);
        fx.assert_clean();

        // Every run used the ephemeral interpreter and activated it
        for call in supervisor.runner.calls().iter().filter(|c| is_run(c)) {
            assert!(call.program.ends_with(Path::new("bin/python")) || cfg!(windows));
            assert!(call.envs.iter().any(|(k, _)| k == "VIRTUAL_ENV"));
        }
    }

    /// Builds ephemeral environments, then blocks until cancelled, either
    /// inside environment creation or on the first run.
    struct HangingVenvRunner {
        hang_in_create: bool,
    }

    #[async_trait]
    impl ProcessRunner for HangingVenvRunner {
        async fn run(
            &self,
            invocation: &Invocation,
            cancel: &CancellationToken,
        ) -> Result<ExecutionAttempt, RunError> {
            if is_venv(invocation) {
                create_venv(invocation);
                if !self.hang_in_create {
                    return exited(0, "", "");
                }
            }
            cancel.cancelled().await;
            Err(RunError::Cancelled)
        }
    }

    #[tokio::test]
    async fn cancelled_ephemeral_request_removes_environment() {
        let mut fx = Fixture::new();
        fx.ephemeral = true;

        for hang_in_create in [true, false] {
            let supervisor = fx.supervisor(HangingVenvRunner { hang_in_create });
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                trigger.cancel();
            });

            let result = supervisor.execute_code("import time", &cancel).await;

            assert_eq!(result.status, Status::Failure);
            assert_eq!(result.error.as_deref(), Some("Execution was cancelled"));
            fx.assert_clean();
        }
    }

    #[tokio::test]
    async fn dropped_ephemeral_request_removes_environment() {
        let mut fx = Fixture::new();
        fx.ephemeral = true;

        for hang_in_create in [true, false] {
            let supervisor = fx.supervisor(HangingVenvRunner { hang_in_create });
            let cancel = CancellationToken::new();

            let timed = tokio::time::timeout(
                Duration::from_millis(50),
                supervisor.execute_code("import time", &cancel),
            )
            .await;

            assert!(timed.is_err());
            fx.assert_clean();
        }
    }

    #[tokio::test]
    async fn environment_create_failure_is_reported() {
        let mut fx = Fixture::new();
        fx.ephemeral = true;
        let runner = FakeRunner::new(|_| exited(1, "", "No module named venv"));
        let supervisor = fx.supervisor(runner);

        let result = supervisor.execute_code("print(1)", &CancellationToken::new()).await;

        assert_eq!(result.status, Status::Failure);
        assert!(result.error.unwrap().contains("Failed to create isolated environment"));
        assert_eq!(supervisor.runner.calls().len(), 1);
        fx.assert_clean();
    }

    #[tokio::test]
    async fn staging_failure_runs_nothing() {
        let fx = Fixture::new();
        let supervisor = fx.supervisor(FakeRunner::new(|_| exited(0, "", "")));
        let units = [
            ExecutionUnit::entry_point("a.py", ""),
            ExecutionUnit::entry_point("b.py", ""),
        ];

        let result = supervisor.execute_units(&units, &CancellationToken::new()).await;

        assert_eq!(result.status, Status::Failure);
        assert!(result.error.unwrap().starts_with("Failed to stage code"));
        assert!(supervisor.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn file_requests_run_in_primary_mount_with_virtual_output() {
        let host = tempfile::tempdir().unwrap();
        std::fs::write(host.path().join("job.py"), "print(open('/working/in.txt').read())").unwrap();
        let mut fx = Fixture::new();
        fx.mounts = vec![MountEntry::new(host.path(), "/working")];

        let host_dir = host.path().to_path_buf();
        let runner = FakeRunner::new(move |inv| {
            let staged = std::fs::read_to_string(&inv.args[0]).unwrap();
            assert!(staged.contains(&format!("{}/in.txt", host_dir.display())));
            assert_eq!(inv.cwd, host_dir);
            exited(
                1,
                &format!("reading {}/in.txt\n", host_dir.display()),
                &format!(
                    "  File \"{}\", line 1\nFileNotFoundError: '{}/in.txt'\n",
                    inv.args[0].to_string_lossy(),
                    host_dir.display()
                ),
            )
        });
        let supervisor = fx.supervisor(runner);

        let result = supervisor
            .execute_file("/working/job.py", &CancellationToken::new())
            .await;

        assert_eq!(result.status, Status::Failure);
        assert_eq!(result.output[0], "reading /working/in.txt");
        assert_eq!(
            result.error.as_deref(),
            Some("  File \"/working/job.py\", line 1\nFileNotFoundError: '/working/in.txt'\n")
        );
        fx.assert_clean();
    }

    #[tokio::test]
    async fn file_outside_mounts_is_rejected() {
        let host = tempfile::tempdir().unwrap();
        let mut fx = Fixture::new();
        fx.mounts = vec![MountEntry::new(host.path(), "/working")];
        let supervisor = fx.supervisor(FakeRunner::new(|_| exited(0, "", "")));

        let result = supervisor
            .execute_file("/etc/passwd", &CancellationToken::new())
            .await;

        assert_eq!(result.status, Status::Failure);
        assert_eq!(
            result.error.as_deref(),
            Some("Path '/etc/passwd' is outside all mounted directories")
        );
        assert!(supervisor.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn install_dependency_bypasses_the_retry_loop() {
        let fx = Fixture::new();
        let supervisor = fx.supervisor(FakeRunner::new(|_| {
            exited(0, "Successfully installed numpy-2.0.0\n", "")
        }));

        let result = supervisor
            .install_dependency("numpy", &CancellationToken::new())
            .await;
        assert!(result.is_success());
        assert_eq!(result.resolved_dependencies, vec!["numpy".to_string()]);
        assert_eq!(result.output[0], "Successfully installed numpy-2.0.0");
        assert_eq!(supervisor.runner.installs(), vec!["numpy".to_string()]);

        let rejected = supervisor
            .install_dependency("--pre", &CancellationToken::new())
            .await;
        assert_eq!(rejected.status, Status::Failure);
        assert!(rejected.resolved_dependencies.is_empty());
        assert_eq!(supervisor.runner.calls().len(), 1);
    }

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    #[tokio::test]
    async fn real_interpreter_round_trip() {
        // Needs a python3 on PATH
        if !python_available() {
            return;
        }

        let host = tempfile::tempdir().unwrap();
        std::fs::write(host.path().join("in.txt"), "from the mount\n").unwrap();
        let mut fx = Fixture::new();
        fx.mounts = vec![MountEntry::new(host.path().canonicalize().unwrap(), "/working")];
        let supervisor = fx.supervisor(crate::runner::LocalRunner::new());

        let hello = supervisor
            .execute_code("print(\"hello\")", &CancellationToken::new())
            .await;
        assert_eq!(hello.status, Status::Success, "{hello:?}");
        assert_eq!(hello.output, vec!["hello", ""]);
        assert!(hello.resolved_dependencies.is_empty());

        let read = supervisor
            .execute_code(
                "import os\nprint(open('/working/in.txt').read().strip())\nprint(os.getcwd())",
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(read.output, vec!["from the mount", "/working", ""], "{read:?}");

        let failed = supervisor
            .execute_code("raise ValueError('boom')", &CancellationToken::new())
            .await;
        assert_eq!(failed.status, Status::Failure);
        let error = failed.error.unwrap();
        assert!(error.contains("ValueError: boom"));
        assert!(!error.contains(&fx.scratch.path().display().to_string()));
        fx.assert_clean();
    }
}
