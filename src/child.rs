// Child process supervision
//
// Owns the wrapped tool's process exclusively: spawning with piped stdio,
// relaying INT/TERM/HUP from the parent, watching for exit, and escalating
// TERM to KILL when a graceful window runs out. Stream errors surface on
// the error channel but never change process state by themselves.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to launch {binary}: {source}")]
    Launch {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("a child is already being supervised")]
    AlreadySpawned,
}

#[derive(Debug, thiserror::Error)]
#[error("child did not exit within {0:?}")]
pub struct ShutdownTimeout(pub Duration);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    Idle,
    Spawned,
    Running,
    Exiting,
    Exited,
}

/// Exit observation: code for normal exits, signal when killed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Signals the supervisor can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSignal {
    Interrupt,
    Terminate,
    Hangup,
    Kill,
}

/// Streams handed to the splitter. The process handle itself stays inside
/// the supervisor.
#[derive(Debug)]
pub struct ChildStreams {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    pub pid: u32,
}

pub struct ChildSupervisor {
    child: AsyncMutex<Option<Child>>,
    pid: Mutex<Option<u32>>,
    state: Mutex<ChildState>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    error_tx: watch::Sender<Option<String>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChildSupervisor {
    pub fn new() -> std::sync::Arc<Self> {
        let (exit_tx, _) = watch::channel(None);
        let (error_tx, _) = watch::channel(None);
        std::sync::Arc::new(ChildSupervisor {
            child: AsyncMutex::new(None),
            pid: Mutex::new(None),
            state: Mutex::new(ChildState::Idle),
            exit_tx,
            error_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> ChildState {
        *self.state.lock().unwrap()
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap()
    }

    /// Observed exit status; `None` until the child exits.
    pub fn on_exit(&self) -> watch::Receiver<Option<ExitInfo>> {
        self.exit_tx.subscribe()
    }

    /// Supervision errors (wait failures, signal delivery problems).
    pub fn on_error(&self) -> watch::Receiver<Option<String>> {
        self.error_tx.subscribe()
    }

    pub async fn spawn(
        self: &std::sync::Arc<Self>,
        binary: &str,
        args: &[String],
        env_overlay: Option<&HashMap<String, String>>,
    ) -> Result<ChildStreams, SpawnError> {
        let mut guard = self.child.lock().await;
        if guard.is_some() {
            return Err(SpawnError::AlreadySpawned);
        }
        *self.state.lock().unwrap() = ChildState::Spawned;

        let mut command = Command::new(binary);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(overlay) = env_overlay {
            command.envs(overlay);
        }

        let mut child = command.spawn().map_err(|source| {
            *self.state.lock().unwrap() = ChildState::Idle;
            SpawnError::Launch {
                binary: binary.to_string(),
                source,
            }
        })?;

        let pid = child.id().unwrap_or_default();
        let streams = ChildStreams {
            stdin: child.stdin.take().expect("stdin piped"),
            stdout: child.stdout.take().expect("stdout piped"),
            stderr: child.stderr.take().expect("stderr piped"),
            pid,
        };
        *self.pid.lock().unwrap() = Some(pid);
        *guard = Some(child);
        drop(guard);
        *self.state.lock().unwrap() = ChildState::Running;
        tracing::debug!(pid, binary, "child spawned");

        // Exit watcher: polls rather than consuming the handle, so kill can
        // still reach the process.
        let supervisor = std::sync::Arc::clone(self);
        let watcher = tokio::spawn(async move {
            loop {
                {
                    let mut guard = supervisor.child.lock().await;
                    match guard.as_mut() {
                        None => return,
                        Some(child) => match child.try_wait() {
                            Ok(Some(status)) => {
                                let info = exit_info(status);
                                guard.take();
                                drop(guard);
                                *supervisor.pid.lock().unwrap() = None;
                                *supervisor.state.lock().unwrap() = ChildState::Exited;
                                tracing::debug!(?info, "child exited");
                                let _ = supervisor.exit_tx.send(Some(info));
                                return;
                            }
                            Ok(None) => {}
                            Err(err) => {
                                let _ = supervisor
                                    .error_tx
                                    .send(Some(format!("waiting on child: {err}")));
                            }
                        },
                    }
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });
        self.tasks.lock().unwrap().push(watcher);

        Ok(streams)
    }

    /// Relay INT, TERM, and HUP from the parent process to the child.
    #[cfg(unix)]
    pub fn forward_signals(self: &std::sync::Arc<Self>) {
        use tokio::signal::unix::{signal, SignalKind};

        let kinds = [
            (SignalKind::interrupt(), ChildSignal::Interrupt),
            (SignalKind::terminate(), ChildSignal::Terminate),
            (SignalKind::hangup(), ChildSignal::Hangup),
        ];
        for (kind, relay) in kinds {
            let supervisor = std::sync::Arc::clone(self);
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(err) => {
                    tracing::warn!("installing signal handler: {err}");
                    continue;
                }
            };
            let task = tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    tracing::debug!(?relay, "relaying signal to child");
                    if let Err(err) = supervisor.signal_child(relay) {
                        let _ = supervisor
                            .error_tx
                            .send(Some(format!("relaying signal: {err}")));
                    }
                }
            });
            self.tasks.lock().unwrap().push(task);
        }
    }

    #[cfg(not(unix))]
    pub fn forward_signals(self: &std::sync::Arc<Self>) {}

    /// Deliver a signal by pid without touching the process handle.
    pub fn signal_child(&self, signal: ChildSignal) -> anyhow::Result<()> {
        let Some(pid) = self.pid() else {
            return Ok(());
        };
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let signal = match signal {
                ChildSignal::Interrupt => Signal::SIGINT,
                ChildSignal::Terminate => Signal::SIGTERM,
                ChildSignal::Hangup => Signal::SIGHUP,
                ChildSignal::Kill => Signal::SIGKILL,
            };
            kill(Pid::from_raw(pid as i32), signal)
                .map_err(|err| anyhow::anyhow!("kill({pid}, {signal:?}): {err}"))?;
        }
        #[cfg(not(unix))]
        {
            let _ = (pid, signal);
        }
        Ok(())
    }

    /// Send `signal`; when `force_timeout` elapses without exit, send a
    /// non-catchable kill. A second kill while exiting upgrades the same
    /// way.
    pub async fn kill(
        self: &std::sync::Arc<Self>,
        signal: ChildSignal,
        force_timeout: Option<Duration>,
    ) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ChildState::Exited || *state == ChildState::Idle {
                return Ok(());
            }
            *state = ChildState::Exiting;
        }
        self.signal_child(signal)?;

        if let Some(window) = force_timeout {
            let supervisor = std::sync::Arc::clone(self);
            let task = tokio::spawn(async move {
                let mut exited = supervisor.exit_tx.subscribe();
                let deadline = tokio::time::sleep(window);
                tokio::pin!(deadline);
                loop {
                    if exited.borrow().is_some() {
                        return;
                    }
                    tokio::select! {
                        _ = exited.changed() => {}
                        _ = &mut deadline => {
                            tracing::warn!("graceful window elapsed; sending KILL");
                            let _ = supervisor.signal_child(ChildSignal::Kill);
                            return;
                        }
                    }
                }
            });
            self.tasks.lock().unwrap().push(task);
        }
        Ok(())
    }

    /// TERM the child and await its exit within `timeout`.
    pub async fn graceful_shutdown(
        self: &std::sync::Arc<Self>,
        timeout: Duration,
    ) -> Result<ExitInfo, ShutdownTimeout> {
        if let Some(info) = *self.exit_tx.subscribe().borrow() {
            return Ok(info);
        }
        let _ = self.kill(ChildSignal::Terminate, None).await;
        self.wait_for_exit(timeout).await
    }

    /// Await the exit observation without sending anything.
    pub async fn wait_for_exit(&self, timeout: Duration) -> Result<ExitInfo, ShutdownTimeout> {
        let mut exited = self.exit_tx.subscribe();
        let result = tokio::time::timeout(timeout, async {
            loop {
                if let Some(info) = *exited.borrow() {
                    return info;
                }
                if exited.changed().await.is_err() {
                    return ExitInfo::default();
                }
            }
        })
        .await;
        result.map_err(|_| ShutdownTimeout(timeout))
    }

    /// Remove signal handlers and, if the child is still alive, TERM it.
    /// Safe to call more than once.
    pub async fn cleanup(self: &std::sync::Arc<Self>) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        let alive = matches!(self.state(), ChildState::Running | ChildState::Exiting);
        if alive {
            let _ = self.signal_child(ChildSignal::Terminate);
        }
    }
}

fn exit_info(status: std::process::ExitStatus) -> ExitInfo {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;
    ExitInfo {
        code: status.code(),
        signal,
    }
}
