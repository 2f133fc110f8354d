use clap::Parser;
use eyre::eyre;
use nix::sys::signal::Signal;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::exchange::ExchangeConfig;
use crate::messages::{MessageSet, Selection};
use crate::receiver::ReadMode;
use crate::supervisor::ProcessConfig;

type Result<T> = color_eyre::eyre::Result<T>;

/// Observe how a server splits a TCP byte stream into messages
#[derive(Parser, Debug)]
#[command(name = "msgbounds")]
#[command(about = "Observe how a server splits a TCP byte stream into messages")]
#[command(version)]
pub struct Cli {
    /// Host to connect to
    #[arg(long, default_value = "127.0.0.1:21")]
    pub host: String,

    /// Read server replies after each send
    #[arg(long)]
    pub read: bool,

    /// Read with a single call instead of draining until timeout
    #[arg(long, alias = "simp")]
    pub simple_read: bool,

    /// Deadline of each read attempt
    #[arg(long, alias = "time", default_value = "30ms", value_parser = parse_duration)]
    pub read_timeout: Duration,

    /// Deadline of each send, after which the step counts as a short write
    #[arg(long, default_value = "1s", value_parser = parse_duration)]
    pub write_timeout: Duration,

    /// Do an initial read (e.g. banner message)
    #[arg(long)]
    pub init_read: bool,

    /// Sleep after connecting
    #[arg(long, default_value = "10ms", value_parser = parse_duration)]
    pub init_sleep: Duration,

    /// Sleep after each send
    #[arg(long, default_value = "1ms", value_parser = parse_duration)]
    pub sleep: Duration,

    /// Sleep before closing, or time the server gets to exit on its own
    #[arg(long, default_value = "3s", value_parser = parse_duration)]
    pub fin_sleep: Duration,

    /// Close the connection before the final sleep
    #[arg(long)]
    pub early_close: bool,

    /// Directory with one message per file, sent in file name order
    #[arg(long)]
    pub messages: Option<PathBuf>,

    /// Messages to send, e.g. "0,2-4" (default: all)
    #[arg(long)]
    pub select: Option<String>,

    /// Merge the selected messages into one payload
    #[arg(long)]
    pub concat: bool,

    /// Signal sent to a server that does not exit in time
    #[arg(long, default_value = "SIGTERM")]
    pub signal: String,

    /// How long to keep retrying the connection
    #[arg(long, default_value = "6s", value_parser = parse_duration)]
    pub connect_timeout: Duration,

    /// Server command to start and supervise
    #[arg(last = true)]
    pub command: Vec<String>,
}

/// Validated run configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub exchange: ExchangeConfig,
    /// Message directory, built-in session when absent
    pub messages_dir: Option<PathBuf>,
    pub selection: Option<Selection>,
    pub concat: bool,
    /// Server to supervise, if any
    pub process: Option<ProcessConfig>,
}

impl Config {
    /// Parse command line arguments into configuration
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let selection = cli
            .select
            .as_deref()
            .map(Selection::from_str)
            .transpose()?;

        let signal = parse_signal(&cli.signal)?;

        let read_mode = if cli.simple_read {
            ReadMode::Single
        } else {
            ReadMode::Drain
        };

        Ok(Config {
            exchange: ExchangeConfig {
                address: cli.host,
                connect_timeout: cli.connect_timeout,
                read: cli.read,
                read_mode,
                read_timeout: cli.read_timeout,
                write_timeout: cli.write_timeout,
                init_read: cli.init_read,
                init_sleep: cli.init_sleep,
                sleep: cli.sleep,
                fin_sleep: cli.fin_sleep,
                early_close: cli.early_close,
                signal,
            },
            messages_dir: cli.messages,
            selection,
            concat: cli.concat,
            process: ProcessConfig::from_argv(&cli.command),
        })
    }

    /// Loads, selects and optionally merges the messages to send
    pub fn load_messages(&self) -> Result<MessageSet> {
        let set = match &self.messages_dir {
            Some(dir) => MessageSet::load_dir(dir)?,
            None => MessageSet::builtin(),
        };
        let set = set.select(self.selection.as_ref())?;

        Ok(if self.concat { set.concat() } else { set })
    }
}

/// Parses a signal given as `TERM`, `SIGTERM` or a number
pub fn parse_signal(s: &str) -> Result<Signal> {
    let s = s.trim();
    if let Ok(number) = s.parse::<i32>() {
        return Signal::try_from(number)
            .map_err(|e| eyre!("Invalid signal number {}: {}", number, e));
    }

    let upper = s.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&name).map_err(|e| eyre!("Invalid signal name '{}': {}", s, e))
}

/// Parses Go-style durations such as `30ms`, `1us`, `1m30s` or `0`
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration '{}'", s))?;
        let (number, tail) = rest.split_at(number_len);
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid number in duration '{}'", s))?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let nanos_per_unit = match unit {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(format!("unknown unit '{}' in duration '{}'", unit, s)),
        };

        total += value * nanos_per_unit;
        rest = tail;
    }

    Ok(Duration::from_nanos(total.round() as u64))
}
