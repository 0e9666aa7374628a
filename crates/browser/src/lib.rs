//! Browser automation - drives one test case through a child automation server.
//!
//! The server is a node process rendered from a bundled script and
//! controlled over a small HTTP API. Both the process launcher and the
//! control API are traits so the executor can run against fakes.

#![warn(missing_docs)]

pub mod error;
pub mod api;
pub mod script;
pub mod server;
pub mod executor;

pub use error::{ExecutorError, Result};
pub use api::{ActionReply, ActionRequest, BatchReply, ControlApi, Endpoint, HealthReply, HttpControlClient};
pub use script::render_server_script;
pub use server::{LaunchSpec, NodeServerLauncher, ServerLauncher, ServerProcess};
pub use executor::{CloudExecutor, ExecutorState, RunProfile, TestRunner};
