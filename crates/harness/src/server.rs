//! Server management - spawning, health checking and terminating the application under test

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::{HarnessError, HarnessResult};

/// Starts the application server for server-dependent phases
#[async_trait]
pub trait ServerLauncher: Send + Sync {
    async fn launch(&self) -> HarnessResult<Box<dyn RunningServer>>;
}

/// A started server. Dropping it without `shutdown` still kills the process.
#[async_trait]
pub trait RunningServer: Send {
    fn base_url(&self) -> &str;

    async fn shutdown(&mut self) -> HarnessResult<()>;
}

/// Configuration for spawning a server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Program to run, e.g. `npm`
    pub command: String,

    pub args: Vec<String>,

    pub cwd: Option<PathBuf>,

    /// Extra environment; `PORT` and `BASE_URL` are always set
    pub env: BTreeMap<String, String>,

    pub host: String,

    /// Port to listen on (0 = find a free port)
    pub port: u16,

    /// Path polled until it answers 2xx
    pub health_path: String,

    /// Timeout for server startup
    pub startup_timeout: Duration,

    /// Delay between health checks
    pub poll_interval: Duration,

    /// How long SIGTERM gets before the process group is killed
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: "npm".to_string(),
            args: vec!["run".to_string(), "preview".to_string()],
            cwd: None,
            env: BTreeMap::new(),
            host: "127.0.0.1".to_string(),
            port: 0,
            health_path: "/".to_string(),
            startup_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

/// Handle to a running server process
pub struct ServerHandle {
    child: Child,
    pid: Option<u32>,
    base_url: String,
    shutdown_grace: Duration,
    stopped: bool,
}

impl ServerHandle {
    /// Spawn the server and wait until it is healthy. On any startup failure
    /// the process is terminated before the error is returned.
    pub async fn spawn(config: ServerConfig) -> HarnessResult<Self> {
        let port = if config.port == 0 { find_free_port()? } else { config.port };
        let base_url = format!("http://{}:{}", config.host, port);

        info!("Spawning server `{} {}` on port {}", config.command, config.args.join(" "), port);

        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .env("PORT", port.to_string())
            .env("BASE_URL", &base_url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        // Own process group so wrappers like `npm` take their children down with them
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            HarnessError::ServerStartup(format!("Failed to spawn {}: {}", config.command, e))
        })?;

        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, "stderr");
        }

        let mut handle = ServerHandle {
            pid: child.id(),
            child,
            base_url,
            shutdown_grace: config.shutdown_grace,
            stopped: false,
        };

        if let Err(e) = handle.wait_for_healthy(&config).await {
            if let Err(stop_err) = handle.stop().await {
                warn!("Failed to stop server after startup failure: {}", stop_err);
            }
            return Err(e);
        }

        info!("Server is healthy at {}", handle.base_url);
        Ok(handle)
    }

    /// Poll the health URL until it answers 2xx, the process exits, or time runs out
    async fn wait_for_healthy(&mut self, config: &ServerConfig) -> HarnessResult<()> {
        let health_url = format!("{}{}", self.base_url, config.health_path);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;

        let start = Instant::now();
        let deadline = start + config.startup_timeout;
        let mut attempts = 0;

        loop {
            if let Some(status) = self.child.try_wait()? {
                return Err(HarnessError::ServerStartup(format!(
                    "process exited before becoming healthy ({})",
                    status
                )));
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            attempts += 1;

            match timeout(deadline - now, client.get(&health_url).send()).await {
                Ok(Ok(resp)) if resp.status().is_success() => return Ok(()),
                Ok(Ok(resp)) => {
                    debug!("Health check returned {}", resp.status());
                }
                Ok(Err(e)) => {
                    if attempts == 1 {
                        info!("Waiting for server to start...");
                    }
                    // Connection refused is expected while server is starting
                    if !e.is_connect() {
                        warn!("Health check error: {}", e);
                    }
                }
                Err(_) => break,
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            sleep(config.poll_interval.min(remaining)).await;
        }

        Err(HarnessError::ServerTimeout {
            waited_ms: start.elapsed().as_millis() as u64,
            attempts,
        })
    }

    /// Get the base URL for this server
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Stop the server: SIGTERM to the group, then SIGKILL after the grace period
    pub async fn stop(&mut self) -> HarnessResult<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        if self.child.try_wait()?.is_some() {
            self.signal_group(true);
            return Ok(());
        }

        info!("Stopping server (pid: {:?})", self.pid);
        self.signal_group(false);

        match timeout(self.shutdown_grace, self.child.wait()).await {
            Ok(status) => {
                debug!("Server exited: {}", status?);
            }
            Err(_) => {
                warn!("Server ignored SIGTERM for {:?}, killing", self.shutdown_grace);
                self.signal_group(true);
                let _ = self.child.start_kill();
                self.child.wait().await?;
            }
        }

        // Catch stragglers that outlived the group leader
        self.signal_group(true);
        Ok(())
    }

    #[cfg(unix)]
    fn signal_group(&mut self, force: bool) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.pid {
            let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
            // ESRCH just means the group is already gone
            let _ = killpg(Pid::from_raw(pid as i32), signal);
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self, force: bool) {
        if force {
            let _ = self.child.start_kill();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if !self.stopped {
            warn!("Server handle dropped without shutdown, killing pid {:?}", self.pid);
            self.signal_group(true);
            let _ = self.child.start_kill();
        }
    }
}

#[async_trait]
impl RunningServer for ServerHandle {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn shutdown(&mut self) -> HarnessResult<()> {
        self.stop().await
    }
}

/// Launches the configured command as a child process
pub struct ProcessLauncher {
    config: ServerConfig,
}

impl ProcessLauncher {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ServerLauncher for ProcessLauncher {
    async fn launch(&self) -> HarnessResult<Box<dyn RunningServer>> {
        let handle = ServerHandle::spawn(self.config.clone()).await?;
        Ok(Box::new(handle))
    }
}

fn forward_output<R>(stream: R, name: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "server", "[{}] {}", name, line);
        }
    });
}

/// Find a free port to use
pub fn find_free_port() -> std::io::Result<u16> {
    use std::net::TcpListener;

    Ok(TcpListener::bind("127.0.0.1:0")?.local_addr()?.port())
}
