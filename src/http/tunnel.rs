//! Supervised `oc port-forward` to the document store.

use std::{
    net::{SocketAddr, TcpStream},
    process::{Child, Command, Stdio},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    config::TunnelConfig,
    error::{RepairError, Result},
};

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// Keeps a port-forward process alive until dropped. Whenever the process exits it is
/// started again, so a dropped tunnel heals without the callers noticing.
pub struct PortForward {
    local_port: u16,
    stop: Arc<AtomicBool>,
    starts: Arc<AtomicU32>,
    child: Arc<Mutex<Option<Child>>>,
    supervisor: Option<JoinHandle<()>>,
}

impl PortForward {
    pub fn start(config: &TunnelConfig) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let starts = Arc::new(AtomicU32::new(0));
        let child: Arc<Mutex<Option<Child>>> = Arc::new(Mutex::new(None));

        let supervisor = {
            let config = config.clone();
            let stop = Arc::clone(&stop);
            let starts = Arc::clone(&starts);
            let child = Arc::clone(&child);
            thread::Builder::new()
                .name("port-forward".to_string())
                .spawn(move || supervise(&config, &stop, &starts, &child))
                .map_err(|e| RepairError::Internal {
                    message: format!("cannot start port-forward supervisor: {e}"),
                })?
        };
        info!(
            service = %config.service,
            local_port = config.local_port,
            remote_port = config.remote_port,
            "starting document store tunnel"
        );
        Ok(PortForward {
            local_port: config.local_port,
            stop,
            starts,
            child,
            supervisor: Some(supervisor),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// How many times the port-forward process has been launched.
    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    /// Block until the local end accepts connections.
    pub fn wait_ready(&self, timeout: Duration) -> Result<()> {
        wait_for_port(self.local_port, timeout)
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(mut child) = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.join();
        }
        debug!(local_port = self.local_port, "document store tunnel stopped");
    }
}

fn port_forward_command(config: &TunnelConfig) -> Command {
    let mut cmd = Command::new(&config.oc_path);
    cmd.arg("-n")
        .arg(&config.namespace)
        .arg("port-forward")
        .arg(&config.service)
        .arg("--pod-running-timeout=4h")
        .arg("--address")
        .arg("127.0.0.1")
        .arg(format!("{}:{}", config.local_port, config.remote_port))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd
}

fn supervise(
    config: &TunnelConfig,
    stop: &AtomicBool,
    starts: &AtomicU32,
    slot: &Mutex<Option<Child>>,
) {
    while !stop.load(Ordering::SeqCst) {
        match port_forward_command(config).spawn() {
            Ok(child) => {
                starts.fetch_add(1, Ordering::SeqCst);
                *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(child);
            }
            Err(err) => {
                warn!(oc = %config.oc_path.display(), error = %err, "cannot start port-forward");
                thread::sleep(RESTART_DELAY);
                continue;
            }
        }

        loop {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            let exited = match guard.as_mut() {
                Some(child) => match child.try_wait() {
                    Ok(Some(status)) => Some(status.to_string()),
                    Ok(None) => None,
                    Err(err) => Some(err.to_string()),
                },
                // taken by Drop
                None => return,
            };
            if let Some(status) = exited {
                guard.take();
                drop(guard);
                if !stop.load(Ordering::SeqCst) {
                    warn!(local_port = config.local_port, "port-forward exited ({status}), restarting");
                    thread::sleep(RESTART_DELAY);
                }
                break;
            }
            drop(guard);
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Poll a loopback port until it accepts a TCP connection.
pub fn wait_for_port(port: u16, timeout: Duration) -> Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let deadline = Instant::now() + timeout;
    loop {
        if TcpStream::connect_timeout(&addr, POLL_INTERVAL).is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(RepairError::config(format!(
                "local port {port} did not accept connections within {}s",
                timeout.as_secs()
            )));
        }
        thread::sleep(POLL_INTERVAL);
    }
}
