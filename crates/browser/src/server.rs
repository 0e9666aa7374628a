//! Automation server process lifecycle.

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use probekit_core::{AiSettings, OptimizationConfig};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::api::Endpoint;
use crate::error::{ExecutorError, Result};
use crate::script::render_server_script;

/// Everything needed to start one automation server.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Where the control API listens
    pub endpoint: Endpoint,
    /// Launch the browser without a window
    pub headless: bool,
    /// Heap cap passed to the runtime
    pub memory_cap_mb: u64,
    /// Browser tuning applied at launch
    pub optimization: OptimizationConfig,
    /// Vision model credentials
    pub ai: AiSettings,
}

/// A running automation server.
#[async_trait]
pub trait ServerProcess: Send {
    /// OS process id, if still known.
    fn id(&self) -> Option<u32>;

    /// Ask the process to exit, killing it if it outlives `grace`.
    async fn terminate(&mut self, grace: Duration) -> Result<()>;
}

/// Starts automation servers.
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    /// Spawn a server. Readiness is checked by the caller.
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ServerProcess>>;
}

/// Launches the bundled script under node.
pub struct NodeServerLauncher {
    node_binary: String,
    script_dir: Option<PathBuf>,
}

impl NodeServerLauncher {
    /// Create a launcher for the given node binary.
    pub fn new(node_binary: impl Into<String>) -> Self {
        Self {
            node_binary: node_binary.into(),
            script_dir: None,
        }
    }

    /// Write scripts under `dir` so node resolves modules from there.
    pub fn with_script_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.script_dir = Some(dir.into());
        self
    }

    fn workdir(&self) -> std::io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("probekit-server-");
        match &self.script_dir {
            Some(dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        }
    }
}

#[async_trait]
impl ServerLauncher for NodeServerLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ServerProcess>> {
        let script = render_server_script(spec)?;
        let workdir = self.workdir()?;
        let script_path = workdir.path().join("server.js");
        tokio::fs::write(&script_path, script).await?;

        let mut cmd = Command::new(&self.node_binary);
        cmd.arg(format!("--max-old-space-size={}", spec.memory_cap_mb))
            .arg(&script_path)
            .current_dir(workdir.path())
            .env("OPENAI_BASE_URL", &spec.ai.base_url)
            .env("MIDSCENE_MODEL_NAME", &spec.ai.model_name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(key) = &spec.ai.api_key {
            cmd.env("OPENAI_API_KEY", key);
        }

        let child = cmd.spawn().map_err(|e| {
            ExecutorError::Startup(format!("failed to spawn {}: {}", self.node_binary, e))
        })?;
        info!(
            "Automation server started on {} (pid {:?}, heap cap {}MB)",
            spec.endpoint,
            child.id(),
            spec.memory_cap_mb
        );

        Ok(Box::new(NodeServerProcess {
            child,
            _workdir: workdir,
        }))
    }
}

/// A node child process and the directory holding its script.
pub struct NodeServerProcess {
    child: Child,
    _workdir: TempDir,
}

#[async_trait]
impl ServerProcess for NodeServerProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn terminate(&mut self, grace: Duration) -> Result<()> {
        // id() is None once the child has been reaped
        let Some(pid) = self.child.id() else {
            return Ok(());
        };

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            warn!("SIGTERM to automation server {} failed: {}", pid, e);
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Automation server {} exited: {}", pid, status);
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                warn!("Automation server {} ignored SIGTERM, killing", pid);
                self.child.kill().await?;
                Ok(())
            }
        }
    }
}
