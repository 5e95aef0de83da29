//! Subprocess-backed SNMP forwarder
//!
//! Runs an external SNMP-over-SSH forwarding program for one device and
//! exposes it to the tunnel manager through [`ProxyController`]. The device
//! password is handed to the program through an environment variable, never
//! on the command line.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use snmptun_lease::{ProxyController, ProxyError, Target};

/// Lines of forwarder output kept for startup diagnostics
const OUTPUT_TAIL_LINES: usize = 20;

/// How long to wait for output readers after an early exit
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// How to launch the forwarder program
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    /// Forwarder executable
    #[serde(default = "default_program")]
    pub program: PathBuf,

    /// Arguments; `{device_ip}`, `{username}`, `{listen_host}` and
    /// `{listen_port}` are substituted
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Environment variable that carries the device password
    #[serde(default = "default_password_env")]
    pub password_env: String,

    /// The forwarder counts as started once it survives this long
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,

    /// Hard limit for the whole start sequence
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
}

fn default_program() -> PathBuf {
    PathBuf::from("snmp-ssh-forwarder")
}

fn default_args() -> Vec<String> {
    [
        "--device",
        "{device_ip}",
        "--username",
        "{username}",
        "--listen",
        "{listen_host}:{listen_port}",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_password_env() -> String {
    "SNMPTUN_DEVICE_PASSWORD".to_string()
}

fn default_startup_grace_ms() -> u64 {
    1500
}

fn default_startup_timeout_secs() -> u64 {
    15
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: default_args(),
            password_env: default_password_env(),
            startup_grace_ms: default_startup_grace_ms(),
            startup_timeout_secs: default_startup_timeout_secs(),
        }
    }
}

impl ForwarderConfig {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Substitute placeholders in the argument templates
    pub fn render_args(&self, target: &Target, listen: SocketAddr) -> Vec<String> {
        let host = listen.ip().to_string();
        let port = listen.port().to_string();

        self.args
            .iter()
            .map(|arg| {
                arg.replace("{device_ip}", &target.device_ip)
                    .replace("{username}", &target.username)
                    .replace("{listen_host}", &host)
                    .replace("{listen_port}", &port)
            })
            .collect()
    }
}

type OutputTail = Arc<Mutex<VecDeque<String>>>;

struct RunningForwarder {
    child: Child,
    listen: SocketAddr,
}

pub struct ProcessProxyController {
    config: ForwarderConfig,
    running: Mutex<Option<RunningForwarder>>,
}

impl ProcessProxyController {
    pub fn new(config: ForwarderConfig) -> Self {
        Self {
            config,
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    /// Address of the running forwarder, if any
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .ok()
            .and_then(|running| running.as_ref().map(|r| r.listen))
    }

    fn spawn(&self, target: &Target, listen: SocketAddr) -> Result<Child, ProxyError> {
        let args = self.config.render_args(target, listen);
        debug!(
            "Spawning forwarder {:?} with args {:?}",
            self.config.program, args
        );

        Command::new(&self.config.program)
            .args(&args)
            .env(&self.config.password_env, target.password())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ProxyError::Spawn)
    }

    /// Wait until the forwarder either survives the grace period or exits
    async fn await_startup(
        &self,
        child: &mut Child,
        listen: SocketAddr,
        tail: &OutputTail,
        pumps: Vec<JoinHandle<()>>,
    ) -> Result<(), ProxyError> {
        let status = tokio::select! {
            status = child.wait() => status.map_err(ProxyError::Spawn)?,
            _ = tokio::time::sleep(self.config.startup_grace()) => return Ok(()),
        };

        // Let the readers drain what the process printed before exiting
        for pump in pumps {
            let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, pump).await;
        }

        let output = tail
            .lock()
            .map(|lines| lines.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default();

        if is_addr_in_use(&output) {
            return Err(ProxyError::AddrInUse { addr: listen });
        }

        Err(ProxyError::Exited {
            status: status.to_string(),
            output,
        })
    }
}

fn is_addr_in_use(output: &str) -> bool {
    let output = output.to_ascii_lowercase();
    output.contains("address already in use") || output.contains("eaddrinuse")
}

/// Forward each output line to tracing and keep the last few for diagnostics
fn pump_output<R>(stream: R, name: &'static str, tail: OutputTail) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(target: "snmptun::forwarder", stream = name, "{}", line);
            if let Ok(mut tail) = tail.lock() {
                if tail.len() == OUTPUT_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
    })
}

#[async_trait]
impl ProxyController for ProcessProxyController {
    async fn start(&self, target: &Target, listen: SocketAddr) -> Result<(), ProxyError> {
        self.close().await;

        let mut child = self.spawn(target, listen)?;
        let tail: OutputTail = Arc::new(Mutex::new(VecDeque::with_capacity(OUTPUT_TAIL_LINES)));

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(pump_output(stdout, "stdout", tail.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(pump_output(stderr, "stderr", tail.clone()));
        }

        let startup = self.await_startup(&mut child, listen, &tail, pumps);
        match tokio::time::timeout(self.config.startup_timeout(), startup).await {
            Ok(Ok(())) => {
                info!(
                    "Forwarder for {} listening on {} (pid {:?})",
                    target.describe(),
                    listen,
                    child.id()
                );
                let orphan = match self.running.lock() {
                    Ok(mut running) => {
                        *running = Some(RunningForwarder { child, listen });
                        None
                    }
                    Err(_) => Some(child),
                };

                if let Some(mut child) = orphan {
                    warn!("Forwarder state lock is poisoned, stopping the new forwarder");
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill forwarder: {}", e);
                    }
                    return Err(ProxyError::StateUnavailable);
                }
                Ok(())
            }
            Ok(Err(e)) => {
                warn!("Forwarder for {} failed to start: {}", target.describe(), e);
                Err(e)
            }
            Err(_) => {
                warn!(
                    "Forwarder for {} did not start within {:?}",
                    target.describe(),
                    self.config.startup_timeout()
                );
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill stalled forwarder: {}", e);
                }
                Err(ProxyError::StartupTimeout)
            }
        }
    }

    async fn close(&self) {
        let running = self.running.lock().ok().and_then(|mut running| running.take());

        if let Some(mut running) = running {
            info!("Stopping forwarder on {}", running.listen);
            if let Err(e) = running.child.kill().await {
                warn!("Failed to stop forwarder on {}: {}", running.listen, e);
            }
        }
    }

    fn is_alive(&self) -> bool {
        let Ok(mut running) = self.running.lock() else {
            return false;
        };

        match running.as_mut().map(|r| r.child.try_wait()) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                debug!("Forwarder exited with {}", status);
                false
            }
            Some(Err(e)) => {
                warn!("Failed to poll forwarder status: {}", e);
                false
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> Target {
        Target::new("10.0.0.5", "admin", "x")
    }

    fn listen() -> SocketAddr {
        "127.0.0.1:1161".parse().unwrap()
    }

    fn shell(script: &str) -> ForwarderConfig {
        ForwarderConfig {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            startup_grace_ms: 300,
            startup_timeout_secs: 5,
            ..ForwarderConfig::default()
        }
    }

    #[test]
    fn test_render_args() {
        let config = ForwarderConfig::default();
        let args = config.render_args(&target(), listen());
        assert_eq!(
            args,
            vec![
                "--device",
                "10.0.0.5",
                "--username",
                "admin",
                "--listen",
                "127.0.0.1:1161"
            ]
        );
    }

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config: ForwarderConfig =
            serde_json::from_str(r#"{"program": "/opt/fwd/bin/fwd"}"#).unwrap();
        assert_eq!(config.program, PathBuf::from("/opt/fwd/bin/fwd"));
        assert_eq!(config.password_env, "SNMPTUN_DEVICE_PASSWORD");
        assert_eq!(config.startup_grace(), Duration::from_millis(1500));
    }

    #[test]
    fn test_addr_in_use_detection() {
        assert!(is_addr_in_use("bind: Address already in use"));
        assert!(is_addr_in_use("error: EADDRINUSE"));
        assert!(!is_addr_in_use("authentication failed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_and_close() {
        let controller = ProcessProxyController::new(shell(
            "test \"$SNMPTUN_DEVICE_PASSWORD\" = x && exec sleep 30",
        ));

        controller.start(&target(), listen()).await.unwrap();
        assert!(controller.is_alive());
        assert_eq!(controller.listen_addr(), Some(listen()));

        controller.close().await;
        controller.close().await;
        assert!(!controller.is_alive());
        assert_eq!(controller.listen_addr(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_early_exit_reported() {
        let controller = ProcessProxyController::new(shell("echo 'auth failed' >&2; exit 3"));

        match controller.start(&target(), listen()).await {
            Err(ProxyError::Exited { output, .. }) => assert!(output.contains("auth failed")),
            other => panic!("expected Exited, got {:?}", other),
        }
        assert!(!controller.is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bind_failure_reported_as_addr_in_use() {
        let controller = ProcessProxyController::new(shell(
            "echo 'bind 127.0.0.1:1161: Address already in use' >&2; exit 1",
        ));

        let err = controller.start(&target(), listen()).await.unwrap_err();
        assert!(matches!(err, ProxyError::AddrInUse { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_startup_timeout() {
        let mut config = shell("exec sleep 30");
        config.startup_grace_ms = 5_000;
        config.startup_timeout_secs = 1;
        let controller = ProcessProxyController::new(config);

        let err = controller.start(&target(), listen()).await.unwrap_err();
        assert!(matches!(err, ProxyError::StartupTimeout));
        assert!(!controller.is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_poisoned_state_fails_start() {
        let controller = Arc::new(ProcessProxyController::new(shell("exec sleep 30")));

        let poisoner = controller.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.running.lock().unwrap();
            panic!("poison the forwarder state");
        })
        .join();
        assert!(controller.running.is_poisoned());

        let err = controller.start(&target(), listen()).await.unwrap_err();
        assert!(matches!(err, ProxyError::StateUnavailable));
        assert!(!controller.is_alive());
    }

    #[tokio::test]
    async fn test_missing_program() {
        let controller = ProcessProxyController::new(ForwarderConfig {
            program: PathBuf::from("/nonexistent/snmp-forwarder"),
            ..ForwarderConfig::default()
        });

        let err = controller.start(&target(), listen()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Spawn(_)));
    }
}
