use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::timeout;

/// Runs the msgbounds binary against test targets
pub struct ProcessTestHarness {
    binary: PathBuf,
    temp_dir: TempDir,
}

impl ProcessTestHarness {
    pub fn new() -> Result<Self> {
        let temp_dir = TempDir::new().context("Failed to create temporary directory")?;

        Ok(Self {
            binary: PathBuf::from(env!("CARGO_BIN_EXE_msgbounds")),
            temp_dir,
        })
    }

    /// Writes one file per message into a fresh message directory
    pub fn message_dir(&self, messages: &[(&str, &[u8])]) -> Result<PathBuf> {
        let dir = self.temp_dir.path().join("messages");
        std::fs::create_dir_all(&dir)?;
        for (name, data) in messages {
            std::fs::write(dir.join(name), data)
                .with_context(|| format!("Failed to write message {}", name))?;
        }
        Ok(dir)
    }

    /// Spawns msgbounds with `args`, capturing its output
    pub fn spawn(&self, args: &[&str]) -> Result<TestProcess> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        cmd.env("RUST_LOG", "info");
        cmd.env("NO_COLOR", "1");
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let start_time = Instant::now();
        let child = cmd.spawn().context("Failed to spawn msgbounds")?;
        let pid = Pid::from_raw(
            child
                .id()
                .ok_or_else(|| anyhow::anyhow!("Failed to get child PID"))? as i32,
        );

        Ok(TestProcess {
            pid,
            start_time,
            child,
        })
    }

    /// Runs msgbounds to completion
    pub async fn run(&self, args: &[&str], limit: Duration) -> Result<RunOutput> {
        self.spawn(args)?.finish(limit).await
    }
}

/// A running msgbounds process
pub struct TestProcess {
    pub pid: Pid,
    pub start_time: Instant,
    child: Child,
}

impl TestProcess {
    /// Waits for exit within `limit` and collects the output
    pub async fn finish(mut self, limit: Duration) -> Result<RunOutput> {
        let mut stdout = self.child.stdout.take().context("stdout not captured")?;
        let mut stderr = self.child.stderr.take().context("stderr not captured")?;

        let collect = async {
            let mut out = Vec::new();
            let mut err = Vec::new();
            let (read_out, read_err) =
                tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err));
            read_out?;
            read_err?;
            let status = self.child.wait().await?;
            Ok::<_, std::io::Error>((status, out, err))
        };

        let (status, stdout, stderr) = timeout(limit, collect)
            .await
            .context("msgbounds did not exit in time")?
            .context("Failed to collect msgbounds output")?;

        Ok(RunOutput {
            status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            runtime: self.start_time.elapsed(),
        })
    }
}

/// Output of a finished msgbounds run
#[derive(Debug)]
pub struct RunOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub runtime: Duration,
}

impl RunOutput {
    /// Asserts that the log mentions `needle`
    pub fn assert_logged(&self, needle: &str) {
        assert!(
            self.stdout.contains(needle),
            "expected {:?} in log:\n{}",
            needle,
            self.stdout
        );
    }

    /// PID of the server process, as logged when it was spawned
    pub fn server_pid(&self) -> Option<Pid> {
        let (_, rest) = self.stdout.split_once("Process spawned with PID: ")?;
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse().ok().map(Pid::from_raw)
    }
}

/// Waits until `pid` no longer names a running process.
///
/// A zombie counts as gone: it has already been killed, and whether it gets
/// reaped depends on whoever inherits it.
pub async fn wait_for_process_gone(pid: Pid, limit: Duration) -> Result<()> {
    let deadline = Instant::now() + limit;
    loop {
        match kill(pid, None) {
            Err(Errno::ESRCH) => return Ok(()),
            Err(e) => return Err(e).context("Failed to check process"),
            Ok(()) => {
                let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid));
                if let Ok(stat) = stat {
                    // State follows the parenthesised command name
                    let state = stat.rsplit_once(") ").and_then(|(_, s)| s.chars().next());
                    if state == Some('Z') {
                        return Ok(());
                    }
                }
            }
        }

        if Instant::now() >= deadline {
            anyhow::bail!("Process {} still running after {:?}", pid, limit);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
