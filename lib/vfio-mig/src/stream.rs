// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::{self, Write};

use crate::codec::StreamError;

/// Outgoing migration stream, as handed to device save hooks.
///
/// The stream carries a sticky error: once an error is recorded (by a failed
/// write, or explicitly through [`SaveStream::set_error`]), all further writes
/// fail and the migration engine is expected to abort the migration rather
/// than ship a truncated stream.
pub struct SaveStream {
    sink: Box<dyn Write + Send>,
    error: Option<String>,
    written: u64,
}

impl SaveStream {
    pub fn new(sink: impl Write + Send + 'static) -> Self {
        Self { sink: Box::new(sink), error: None, written: 0 }
    }

    /// Mark the stream as failed.  The first recorded error wins.
    pub fn set_error(&mut self, reason: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(reason.into());
        }
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Surface a recorded error, if any.
    pub fn check(&self) -> Result<(), StreamError> {
        match &self.error {
            Some(reason) => Err(StreamError::Failed(reason.clone())),
            None => Ok(()),
        }
    }

    /// Number of bytes successfully written to the stream.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    fn failed(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::Other,
            format!(
                "migration stream failed: {}",
                self.error.as_deref().unwrap_or_default()
            ),
        )
    }
}

impl Write for SaveStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.error.is_some() {
            return Err(self.failed());
        }
        match self.sink.write(buf) {
            Ok(n) => {
                self.written += n as u64;
                Ok(n)
            }
            Err(e) => {
                self.set_error(e.to_string());
                Err(e)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.error.is_some() {
            return Err(self.failed());
        }
        self.sink.flush().map_err(|e| {
            self.set_error(e.to_string());
            e
        })
    }
}
