//! Line-oriented Server-Sent-Events reader shared by the chat providers.
//!
//! Providers act on each field as soon as its line arrives
//! ([`SseReader::next_field`]) since a terminating event must end the stream
//! without waiting for the closing blank line. Whole events, joined the
//! generic SSE way, are assembled by `next_event` and `read`.

use std::io;

use thiserror::Error;
use tokio::io::{ AsyncBufRead, AsyncBufReadExt };
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Event {
    /// Value of the last `event:` line, if the block had one.
    pub event: Option<String>,
    pub data: String,
}

/// One meaningful line of the stream. Comments and unknown fields such as
/// `id:` or `retry:` are skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    /// `event:` value, trimmed.
    Event(String),
    /// `data:` value with at most one leading space removed.
    Data(String),
    Blank,
}

#[derive(Debug, Error)]
pub enum SseError {
    #[error("event stream cancelled")]
    Cancelled,
    #[error("error reading event stream: {0}")]
    Io(#[from] io::Error),
}

pub struct SseReader<R> {
    reader: R,
    cancel: CancellationToken,
    line: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> SseReader<R> {
    pub fn new(reader: R, cancel: CancellationToken) -> Self {
        Self {
            reader,
            cancel,
            line: Vec::new(),
        }
    }

    /// Reads the next line without its terminator (`\n` or `\r\n`).
    /// Returns `None` at end of stream.
    pub(crate) async fn next_line(&mut self) -> Result<Option<String>, SseError> {
        self.line.clear();
        let read = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SseError::Cancelled),
            read = self.reader.read_until(b'\n', &mut self.line) => read,
        };

        match read {
            Ok(0) => Ok(None),
            Ok(_) => {
                if self.cancel.is_cancelled() {
                    return Err(SseError::Cancelled);
                }
                if self.line.last() == Some(&b'\n') {
                    self.line.pop();
                }
                if self.line.last() == Some(&b'\r') {
                    self.line.pop();
                }
                Ok(Some(String::from_utf8_lossy(&self.line).into_owned()))
            }
            // Cancellation wins over whatever the transport reported.
            Err(_) if self.cancel.is_cancelled() => Err(SseError::Cancelled),
            Err(e) => Err(SseError::Io(e)),
        }
    }

    /// Returns the next field, or `None` at end of stream.
    pub async fn next_field(&mut self) -> Result<Option<Field>, SseError> {
        loop {
            let Some(line) = self.next_line().await? else {
                return Ok(None);
            };

            if line.is_empty() {
                return Ok(Some(Field::Blank));
            }
            if let Some(value) = line.strip_prefix("event:") {
                return Ok(Some(Field::Event(value.trim().to_string())));
            }
            if let Some(value) = line.strip_prefix("data:") {
                let value = value.strip_prefix(' ').unwrap_or(value);
                return Ok(Some(Field::Data(value.to_string())));
            }
        }
    }

    /// Returns the next event carrying non-empty data, or `None` once the
    /// stream is exhausted. A pending event without a trailing blank line is
    /// still returned at end of stream.
    #[cfg(test)]
    pub(crate) async fn next_event(&mut self) -> Result<Option<Event>, SseError> {
        let mut current = Event::default();

        while let Some(field) = self.next_field().await? {
            match field {
                Field::Blank if !current.data.is_empty() => return Ok(Some(current)),
                Field::Blank => current = Event::default(),
                Field::Event(name) => current.event = Some(name),
                Field::Data(value) => {
                    if !current.data.is_empty() {
                        current.data.push('\n');
                    }
                    current.data.push_str(&value);
                }
            }
        }
        Ok((!current.data.is_empty()).then_some(current))
    }

    /// Drains the stream into `events`, leaving the channel open. Returns
    /// `Ok(())` at normal end of stream. A dropped receiver is reported as
    /// cancellation.
    #[cfg(test)]
    pub(crate) async fn read(&mut self, events: &tokio::sync::mpsc::Sender<Event>) -> Result<(), SseError> {
        while let Some(event) = self.next_event().await? {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SseError::Cancelled),
                sent = events.send(event) => {
                    if sent.is_err() {
                        return Err(SseError::Cancelled);
                    }
                }
            }
            if self.cancel.is_cancelled() {
                return Err(SseError::Cancelled);
            }
        }
        Ok(())
    }
}
