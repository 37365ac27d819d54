//! Live token output for the terminal or a pipe.

use log::warn;
use std::io::{ self, Write };

pub struct TokenWriter<W: Write> {
    out: W,
    is_tty: bool,
}

impl<W: Write> TokenWriter<W> {
    /// `is_tty` selects interactive behavior; piped output gets a trailing
    /// newline on [`TokenWriter::flush`].
    pub fn new(out: W, is_tty: bool) -> Self {
        Self { out, is_tty }
    }

    /// Writes the token verbatim and pushes it through to the sink.
    pub fn write(&mut self, token: &str) -> io::Result<()> {
        self.out.write_all(token.as_bytes())?;
        self.out.flush()
    }

    pub fn flush(&mut self) {
        if self.is_tty {
            return;
        }
        if let Err(e) = self.out.write_all(b"\n").and_then(|_| self.out.flush()) {
            warn!("failed to write trailing newline: {}", e);
        }
    }

    pub fn is_tty(&self) -> bool {
        self.is_tty
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
