use super::Result;

use eyre::{eyre, WrapErr};
use std::fmt;
use std::ops::RangeInclusive;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

/// FTP session sent when no message directory is given
const BUILTIN_MESSAGES: [&[u8]; 4] = [
    b"USER fuzzing\r\n",
    b"PASS fuzzing\r\n",
    b"LIST\r\n",
    b"QUIT\r\n",
];

/// A single payload sent byte-for-byte to the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Where the payload came from (file name or built-in index)
    pub name: String,
    /// Raw bytes, never decoded
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}

/// Subset of message indices taking part in a run.
///
/// Parsed from comma-separated tokens, each a single index (`3`) or an
/// inclusive range (`2-5`) with `lo < hi`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    ranges: Vec<RangeInclusive<usize>>,
}

impl Selection {
    /// Returns true if `index` is covered by any token
    pub fn contains(&self, index: usize) -> bool {
        self.ranges.iter().any(|r| r.contains(&index))
    }

    /// Largest index referenced by the selection
    pub fn max_index(&self) -> usize {
        self.ranges.iter().map(|r| *r.end()).max().unwrap_or(0)
    }
}

impl FromStr for Selection {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        let mut ranges = Vec::new();

        for token in s.split(',').map(str::trim) {
            if token.is_empty() {
                return Err(eyre!("Empty token in selection '{}'", s));
            }

            let range = match token.split_once('-') {
                Some((lo, hi)) => {
                    let lo = parse_index(lo, token)?;
                    let hi = parse_index(hi, token)?;
                    if lo >= hi {
                        return Err(eyre!(
                            "Invalid range '{}': start must be lower than end",
                            token
                        ));
                    }
                    lo..=hi
                }
                None => {
                    let index = parse_index(token, token)?;
                    index..=index
                }
            };
            ranges.push(range);
        }

        Ok(Selection { ranges })
    }
}

fn parse_index(s: &str, token: &str) -> Result<usize> {
    s.trim()
        .parse::<usize>()
        .map_err(|e| eyre!("Invalid index in selection token '{}': {}", token, e))
}

/// Ordered payloads for one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSet {
    messages: Vec<Message>,
    total_len: usize,
}

impl MessageSet {
    pub fn new(messages: Vec<Message>) -> Self {
        let total_len = messages.iter().map(Message::len).sum();
        Self {
            messages,
            total_len,
        }
    }

    /// The built-in FTP session
    pub fn builtin() -> Self {
        Self::new(
            BUILTIN_MESSAGES
                .iter()
                .enumerate()
                .map(|(i, data)| Message::new(format!("builtin-{}", i), *data))
                .collect(),
        )
    }

    /// Loads every regular file in `dir` as one message.
    ///
    /// Files are ordered lexicographically by file name, and selection
    /// indices refer to that order. Subdirectories and other non-regular
    /// entries are skipped.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir)
            .wrap_err_with(|| format!("Failed to read message directory {:?}", dir))?;

        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.wrap_err_with(|| format!("Failed to list {:?}", dir))?;
            let file_type = entry.file_type()?;
            if !file_type.is_file() {
                debug!("Skipping non-regular entry {:?}", entry.path());
                continue;
            }
            paths.push(entry.path());
        }
        paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

        let mut messages = Vec::with_capacity(paths.len());
        for path in paths {
            let data = std::fs::read(&path)
                .wrap_err_with(|| format!("Failed to read message file {:?}", path))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            messages.push(Message::new(name, data));
        }

        info!("Loaded {} messages from {:?}", messages.len(), dir);
        Ok(Self::new(messages))
    }

    /// Keeps only the selected messages, preserving their original order.
    ///
    /// `None` keeps everything. An index beyond the loaded set is an error.
    pub fn select(self, selection: Option<&Selection>) -> Result<Self> {
        let Some(selection) = selection else {
            return Ok(self);
        };

        if selection.max_index() >= self.messages.len() {
            return Err(eyre!(
                "Selection references message {} but only {} messages are loaded",
                selection.max_index(),
                self.messages.len()
            ));
        }

        let messages = self
            .messages
            .into_iter()
            .enumerate()
            .filter(|(i, _)| selection.contains(*i))
            .map(|(_, m)| m)
            .collect();
        Ok(Self::new(messages))
    }

    /// Merges all messages into a single payload with no separators
    pub fn concat(self) -> Self {
        let mut data = Vec::with_capacity(self.total_len);
        let mut names = Vec::with_capacity(self.messages.len());
        for message in self.messages {
            data.extend_from_slice(&message.data);
            names.push(message.name);
        }
        Self::new(vec![Message::new(names.join("+"), data)])
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn into_inner(self) -> Vec<Message> {
        self.messages
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.data.escape_ascii())
    }
}
