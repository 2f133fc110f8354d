use super::Result;

use eyre::{eyre, WrapErr};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Interval between non-blocking exit checks
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Command line of the target server
#[derive(Debug, Clone, Default)]
pub struct ProcessConfig {
    /// Command to execute
    pub command: String,
    /// Arguments for the command
    pub args: Vec<String>,
}

impl ProcessConfig {
    /// Builds a configuration from an argv vector, `None` if it is empty
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (command, args) = argv.split_first()?;
        Some(Self {
            command: command.clone(),
            args: args.to_vec(),
        })
    }
}

/// How a supervised process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReport {
    /// Exited on its own with a status code
    Code(i32),
    /// Terminated by a signal
    Signaled(i32),
}

impl From<ExitStatus> for ExitReport {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitReport::Code(code),
            (None, Some(signal)) => ExitReport::Signaled(signal),
            // Stopped/continued states are never returned by wait
            (None, None) => ExitReport::Code(-1),
        }
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReport::Code(code) => write!(f, "exit code {}", code),
            ExitReport::Signaled(signal) => match Signal::try_from(*signal) {
                Ok(signal) => write!(f, "terminated by signal {}", signal),
                Err(_) => write!(f, "terminated by signal {}", signal),
            },
        }
    }
}

/// Stdout and stderr gathered from the supervised process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Result of the background exit poller
type PollOutcome = std::io::Result<(Child, Option<ExitStatus>)>;

/// A target server started and owned by the tool.
///
/// The child is handed to a background task that polls for its exit with a
/// non-blocking wait and publishes the status once over a one-shot channel.
/// [`Supervisor::wait_final`] takes the child back and reaps it, unless the
/// poller already did.
pub struct Supervisor {
    pid: Pid,
    exit_rx: Option<oneshot::Receiver<ExitStatus>>,
    stop_tx: Option<oneshot::Sender<()>>,
    poller: Option<JoinHandle<PollOutcome>>,
    child: Option<Child>,
    status: Option<ExitStatus>,
    stdout: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
    stderr: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
}

impl Supervisor {
    /// Spawns the process with piped stdout/stderr and starts exit polling.
    ///
    /// # Arguments
    /// * `config` - Command line of the process
    ///
    /// # Returns
    /// * `Result<Self>` - The running supervisor, or an error if the process
    ///   or its pipes could not be set up
    pub fn start(config: &ProcessConfig) -> Result<Self> {
        info!("Spawning process: {} {:?}", config.command, config.args);

        let mut command = Command::new(&config.command);
        command.args(&config.args);
        command.kill_on_drop(true);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .wrap_err_with(|| format!("Failed to start {}", config.command))?;

        let pid = match child.id() {
            Some(pid) => Pid::from_raw(pid.try_into()?),
            None => return Err(eyre!("Failed to get process ID")),
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| eyre!("Failed to attach to stdout of process {}", pid))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| eyre!("Failed to attach to stderr of process {}", pid))?;

        let (exit_tx, exit_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let poller = tokio::spawn(poll_exit(child, exit_tx, stop_rx));

        info!("Process spawned with PID: {}", pid);
        Ok(Self {
            pid,
            exit_rx: Some(exit_rx),
            stop_tx: Some(stop_tx),
            poller: Some(poller),
            child: None,
            status: None,
            stdout: Some(tokio::spawn(read_pipe(stdout))),
            stderr: Some(tokio::spawn(read_pipe(stderr))),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Takes the one-shot exit channel. Only the first call gets it.
    pub fn exit_signal(&mut self) -> Option<oneshot::Receiver<ExitStatus>> {
        self.exit_rx.take()
    }

    /// Delivers `signal` to the process. A process that is already gone is
    /// not an error.
    ///
    /// Once the process has been reaped its PID may belong to someone else,
    /// so nothing is sent at all.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        if self.is_reaped() {
            debug!("Process {} already reaped, {} not delivered", self.pid, signal);
            return Ok(());
        }

        debug!("Sending signal {:?} to process {}", signal, self.pid);
        match kill(self.pid, signal) {
            Ok(()) => Ok(()),
            Err(nix::Error::ESRCH) => {
                debug!("Process {} already exited, {} not delivered", self.pid, signal);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// True once the status is known or the poller is done with the child
    fn is_reaped(&self) -> bool {
        self.status.is_some()
            || self
                .poller
                .as_ref()
                .is_some_and(|poller| poller.is_finished())
    }

    /// Collects everything the process wrote to stdout and stderr.
    ///
    /// Completes once the process has closed both pipes. Read errors are
    /// logged and leave the corresponding buffer empty. Later calls return
    /// empty output.
    pub async fn capture_output(&mut self) -> CapturedOutput {
        CapturedOutput {
            stdout: collect_pipe(self.stdout.take(), "stdout").await,
            stderr: collect_pipe(self.stderr.take(), "stderr").await,
        }
    }

    /// Blocks until the process has been reaped and returns its status.
    ///
    /// If the background poller already observed the exit its status is
    /// reused; the process is never waited on twice. A polling failure is
    /// surfaced here as a fatal error.
    pub async fn wait_final(&mut self) -> Result<ExitReport> {
        if let Some(status) = self.status {
            return Ok(status.into());
        }

        if let Some(poller) = self.poller.take() {
            if let Some(stop_tx) = self.stop_tx.take() {
                // The poller may have finished already
                let _ = stop_tx.send(());
            }
            let (child, status) = poller
                .await
                .wrap_err("Exit poller panicked")?
                .wrap_err_with(|| format!("Failed to poll process {} for exit", self.pid))?;
            self.child = Some(child);
            if let Some(status) = status {
                self.status = Some(status);
                return Ok(status.into());
            }
        }

        let child = self
            .child
            .as_mut()
            .ok_or_else(|| eyre!("Process {} is no longer supervised", self.pid))?;
        let status = child.wait().await?;
        info!("Process {} reaped with status: {:?}", self.pid, status);
        self.status = Some(status);
        Ok(status.into())
    }
}

/// Polls `child` for exit until it is reaped or `stop_rx` fires.
///
/// Returns the child so the owner can reap it if polling was stopped early.
async fn poll_exit(
    mut child: Child,
    exit_tx: oneshot::Sender<ExitStatus>,
    mut stop_rx: oneshot::Receiver<()>,
) -> PollOutcome {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Poller observed exit: {:?}", status);
                // Nobody listening just means the race is already over
                let _ = exit_tx.send(status);
                return Ok((child, Some(status)));
            }
            Ok(None) => {}
            Err(e) => {
                error!("Error polling process for exit: {}", e);
                return Err(e);
            }
        }

        tokio::select! {
            _ = &mut stop_rx => return Ok((child, None)),
            _ = sleep(POLL_INTERVAL) => {}
        }
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(mut pipe: R) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf).await?;
    Ok(buf)
}

async fn collect_pipe(
    reader: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
    name: &str,
) -> Vec<u8> {
    let Some(reader) = reader else {
        return Vec::new();
    };
    match reader.await {
        Ok(Ok(buf)) => buf,
        Ok(Err(e)) => {
            warn!("Failed to read process {}: {}", name, e);
            Vec::new()
        }
        Err(e) => {
            warn!("Reader for process {} failed: {}", name, e);
            Vec::new()
        }
    }
}
