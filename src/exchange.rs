use super::Result;
use crate::connector::connect;
use crate::messages::Message;
use crate::receiver::{receive, ReadMode};
use crate::supervisor::{CapturedOutput, ExitReport, Supervisor};

use nix::sys::signal::Signal;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Run parameters of a scripted exchange
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    /// Target `host:port`
    pub address: String,
    /// Overall budget for connection retries
    pub connect_timeout: Duration,
    /// Read a reply after each send
    pub read: bool,
    pub read_mode: ReadMode,
    /// Deadline of every single read attempt
    pub read_timeout: Duration,
    /// Deadline of each send; a target that stops reading cannot stall the run
    pub write_timeout: Duration,
    /// Read once right after connecting (e.g. a banner)
    pub init_read: bool,
    pub init_sleep: Duration,
    /// Sleep after each send
    pub sleep: Duration,
    /// Final sleep, or the time the process gets to exit on its own
    pub fin_sleep: Duration,
    /// Close the connection before the final wait
    pub early_close: bool,
    /// Signal delivered to a process that outlives `fin_sleep`
    pub signal: Signal,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:21".to_string(),
            connect_timeout: Duration::from_secs(6),
            read: false,
            read_mode: ReadMode::Drain,
            read_timeout: Duration::from_millis(30),
            write_timeout: Duration::from_secs(1),
            init_read: false,
            init_sleep: Duration::from_millis(10),
            sleep: Duration::from_millis(1),
            fin_sleep: Duration::from_secs(3),
            early_close: false,
            signal: Signal::SIGTERM,
        }
    }
}

/// Point of the script a reply was read at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Right after connecting
    Initial,
    /// After sending the message with this index
    Message(usize),
}

/// Bytes read at one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub step: Step,
    pub bytes: Vec<u8>,
}

/// Which event ended the wait for the supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The process exited on its own
    ProcessExit,
    /// The final timeout fired first
    Timeout,
}

/// How the supervised process finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessReport {
    pub resolution: Resolution,
    pub signal_delivered: bool,
    pub exit: ExitReport,
    pub output: CapturedOutput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Finish {
    /// No process: the final sleep elapsed
    Slept,
    Process(ProcessReport),
}

/// Everything observed during one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub sent: usize,
    pub short_writes: usize,
    pub replies: Vec<Reply>,
    pub finish: Finish,
}

/// Drives one connection through the scripted send/receive sequence.
///
/// Connect, optional initial read, then for each message: send, sleep,
/// optional read. After the last message the connection is optionally
/// closed and the run finishes either with a plain sleep or, when a process
/// is supervised, with a race between its exit and the final timeout.
pub struct Exchange {
    config: ExchangeConfig,
    messages: Vec<Message>,
    supervisor: Option<Supervisor>,
    conn: Option<TcpStream>,
    replies: Vec<Reply>,
}

impl Exchange {
    /// Creates an engine for `messages`, sent in order.
    ///
    /// The supervisor, if any, must already be started so the target is
    /// listening by the time we connect.
    pub fn new(
        config: ExchangeConfig,
        messages: Vec<Message>,
        supervisor: Option<Supervisor>,
    ) -> Self {
        Self {
            config,
            messages,
            supervisor,
            conn: None,
            replies: Vec::new(),
        }
    }

    /// Runs the whole script and reports what happened.
    ///
    /// Only setup failures (connect timeout, poller failure) are errors;
    /// short writes and failed reads are logged and the script goes on.
    pub async fn run(mut self) -> Result<RunReport> {
        info!("Connecting to {}...", self.config.address);
        self.conn = Some(connect(&self.config.address, self.config.connect_timeout).await?);

        sleep(self.config.init_sleep).await;

        if self.config.read && self.config.init_read {
            info!("Doing initial read");
            self.read_reply(Step::Initial).await;
        }

        let mut sent = 0;
        let mut short_writes = 0;
        let messages = std::mem::take(&mut self.messages);
        for (i, message) in messages.iter().enumerate() {
            match self.send(i, message).await {
                Some(n) if n < message.len() => {
                    warn!(
                        "Sent less bytes than expected: {} instead of {}",
                        n,
                        message.len()
                    );
                    short_writes += 1;
                    sent += 1;
                }
                Some(_) => sent += 1,
                None => {}
            }

            sleep(self.config.sleep).await;

            if self.config.read {
                self.read_reply(Step::Message(i)).await;
            }
        }

        if self.config.early_close {
            info!("Closing connection early");
            self.close().await;
        }

        let finish = match self.supervisor.take() {
            None => {
                debug!("No process to wait for, sleeping {:?}", self.config.fin_sleep);
                sleep(self.config.fin_sleep).await;
                Finish::Slept
            }
            Some(supervisor) => Finish::Process(self.finish_process(supervisor).await?),
        };

        self.close().await;

        Ok(RunReport {
            sent,
            short_writes,
            replies: self.replies,
            finish,
        })
    }

    /// Writes `message` with a single write call bounded by `write_timeout`.
    ///
    /// Returns the number of bytes accepted (zero if the deadline passed
    /// before the target took anything), or `None` if the write failed.
    async fn send(&mut self, index: usize, message: &Message) -> Option<usize> {
        let write_timeout = self.config.write_timeout;
        let conn = self.conn.as_mut()?;
        info!("Sending {}: {}", index, message);

        match timeout(write_timeout, conn.write(&message.data)).await {
            Ok(Ok(n)) => {
                debug!("Wrote {} of {} bytes", n, message.len());
                Some(n)
            }
            Ok(Err(e)) => {
                warn!("Failed to send message {}: {}", index, e);
                None
            }
            Err(_) => {
                warn!("Send of message {} timed out after {:?}", index, write_timeout);
                Some(0)
            }
        }
    }

    async fn read_reply(&mut self, step: Step) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };

        match receive(conn, self.config.read_timeout, self.config.read_mode).await {
            Ok(bytes) => {
                info!("Read: {}", bytes.escape_ascii());
                self.replies.push(Reply { step, bytes });
            }
            Err(e) => warn!("Error receiving: {}", e),
        }
    }

    /// Shuts the connection down. Later calls do nothing.
    async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = conn.shutdown().await {
                debug!("Error shutting down connection: {}", e);
            }
        }
    }

    /// Races the process exit against the final timeout, signals the process
    /// if it is still around, then collects its output and exit status.
    async fn finish_process(&mut self, mut supervisor: Supervisor) -> Result<ProcessReport> {
        let pid = supervisor.pid();
        let exit_rx = supervisor.exit_signal();

        let resolution = match exit_rx {
            Some(exit_rx) => {
                tokio::select! {
                    status = exit_rx => {
                        match status {
                            Ok(status) => info!("Process {} exited: {:?}", pid, status),
                            // Poller stopped without a status; wait_final reports why
                            Err(_) => warn!("Lost track of process {}", pid),
                        }
                        Resolution::ProcessExit
                    }
                    _ = sleep(self.config.fin_sleep) => Resolution::Timeout,
                }
            }
            None => Resolution::Timeout,
        };

        let mut signal_delivered = false;
        if resolution == Resolution::Timeout {
            warn!(
                "Process {} did not exit within {:?}, sending {}",
                pid, self.config.fin_sleep, self.config.signal
            );
            match supervisor.signal(self.config.signal) {
                Ok(()) => signal_delivered = true,
                Err(e) => warn!("Failed to signal process {}: {}", pid, e),
            }
        }

        let output = supervisor.capture_output().await;
        if !output.stdout.is_empty() {
            info!("Process stdout:\n{}", String::from_utf8_lossy(&output.stdout));
        }
        if !output.stderr.is_empty() {
            info!("Process stderr:\n{}", String::from_utf8_lossy(&output.stderr));
        }

        let exit = supervisor.wait_final().await?;
        info!("Process {} finished with {}", pid, exit);

        Ok(ProcessReport {
            resolution,
            signal_delivered,
            exit,
            output,
        })
    }
}
