//! Append-only message log
//!
//! Messages are written as JSON lines, one self-contained `Message` per
//! line, into one file per UTC day:
//!
//! ```text
//! <directory>/messages-2026-10-16.jsonl
//! ```
//!
//! Files are opened in append mode for every batch, so several brokers (or a
//! restarted one) can share a directory without truncating each other.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};

use crate::broker::message::Message;
use crate::utils::error::{AppendError, PersistenceError};

#[derive(Debug, Clone)]
pub struct LogStore {
    directory: PathBuf,
}

impl LogStore {
    /// The directory is created lazily on the first write.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.directory
            .join(format!("messages-{}.jsonl", date.format("%Y-%m-%d")))
    }

    /// Append a batch, grouped by each message's UTC date. Returns the number
    /// of records written.
    ///
    /// Days are written in date order. If one day fails, the days before it
    /// stay on disk and the error carries every record from the failing day
    /// onwards.
    pub fn append(&self, batch: &[Message]) -> Result<usize, AppendError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let unwritten = |source: PersistenceError| AppendError {
            written: 0,
            unwritten: batch.to_vec(),
            source,
        };
        fs::create_dir_all(&self.directory).map_err(|e| unwritten(e.into()))?;

        let mut by_date: BTreeMap<NaiveDate, Vec<&Message>> = BTreeMap::new();
        for message in batch {
            by_date
                .entry(message_date(message))
                .or_default()
                .push(message);
        }

        // serialize everything first so a bad record never leaves a half-written batch
        let mut encoded: Vec<(NaiveDate, Vec<&Message>, Vec<u8>)> =
            Vec::with_capacity(by_date.len());
        for (date, messages) in by_date {
            let mut buf = Vec::new();
            for message in &messages {
                serde_json::to_writer(&mut buf, message).map_err(|e| unwritten(e.into()))?;
                buf.push(b'\n');
            }
            encoded.push((date, messages, buf));
        }

        let mut written = 0;
        for (index, (date, messages, buf)) in encoded.iter().enumerate() {
            if let Err(source) = self.append_day(*date, buf) {
                return Err(AppendError {
                    written,
                    unwritten: encoded[index..]
                        .iter()
                        .flat_map(|(_, messages, _)| messages.iter().map(|m| (*m).clone()))
                        .collect(),
                    source,
                });
            }
            written += messages.len();
        }

        Ok(written)
    }

    /// Write one day's lines. A failed write is cut back to the previous end
    /// of file so no torn line is left behind.
    fn append_day(&self, date: NaiveDate, buf: &[u8]) -> Result<(), PersistenceError> {
        let path = self.path_for(date);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let end = file.metadata()?.len();

        if let Err(e) = file.write_all(buf).and_then(|()| file.flush()) {
            if let Err(truncate) = file.set_len(end) {
                tracing::error!(
                    path = %path.display(),
                    error = %truncate,
                    "failed to roll back partial write"
                );
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Read back every record of one day, skipping lines that do not parse.
    pub fn read_day(&self, date: NaiveDate) -> Result<Vec<Message>, PersistenceError> {
        let path = self.path_for(date);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(fs::File::open(path)?);
        let mut messages = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(&line) {
                Ok(message) => messages.push(message),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable log record"),
            }
        }
        Ok(messages)
    }
}

fn message_date(message: &Message) -> NaiveDate {
    DateTime::<Utc>::from_timestamp_millis(message.timestamp)
        .unwrap_or_else(Utc::now)
        .date_naive()
}
