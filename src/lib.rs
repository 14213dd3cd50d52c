//! code-runner-mcp library
//!
//! Runs code for remote callers against a virtual view of host directories:
//! - Mount table resolving virtual paths to host paths
//! - Workspace staging with virtual/host path rewriting
//! - Ambient, supplied or per-request ephemeral environments
//! - Missing-dependency detection, install and bounded retry
//! - MCP server exposing it all as tools

pub mod config;
pub mod environment;
pub mod error;
pub mod mcp;
pub mod mounts;
pub mod resolver;
pub mod runner;
pub mod stager;
pub mod supervisor;
