//! Byte accumulator for framed input.
//!
//! Chunks are kept as received; nothing is copied until a complete header
//! block or body is available, and nothing is consumed otherwise.

use std::collections::{HashMap, VecDeque};

use crate::error::ReadError;

const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Accumulates raw chunks and hands out header blocks and bodies.
#[derive(Debug, Default)]
pub struct MessageBuffer {
    chunks: VecDeque<Vec<u8>>,
    total_length: usize,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, chunk: impl AsRef<[u8]>) {
        let chunk = chunk.as_ref();
        if chunk.is_empty() {
            return;
        }
        self.total_length += chunk.len();
        self.chunks.push_back(chunk.to_vec());
    }

    pub fn number_of_bytes(&self) -> usize {
        self.total_length
    }

    /// Reads a header block terminated by `\r\n\r\n`.
    ///
    /// Returns `Ok(None)` without consuming anything if the terminator has not
    /// arrived yet.
    ///
    /// # Errors
    ///
    /// Returns [`ReadError::MalformedHeader`] if a header line has no `:`.
    pub fn try_read_headers(
        &mut self,
        lower_case_keys: bool,
    ) -> Result<Option<HashMap<String, String>>, ReadError> {
        let Some(end) = self.find_header_end() else {
            return Ok(None);
        };

        let block = self.take(end);
        let text = &block[..end - 4];
        if !text.is_ascii() {
            return Err(ReadError::NonAsciiHeader);
        }
        let text = String::from_utf8_lossy(text);

        let mut headers = HashMap::new();
        if text.is_empty() {
            return Ok(Some(headers));
        }
        for line in text.split("\r\n") {
            let (key, value) = line.split_once(':').ok_or(ReadError::MalformedHeader)?;
            let key = if lower_case_keys {
                key.to_ascii_lowercase()
            } else {
                key.to_string()
            };
            headers.insert(key, value.trim().to_string());
        }
        Ok(Some(headers))
    }

    /// Removes exactly `length` bytes, or returns `None` if fewer are buffered.
    pub fn try_read_body(&mut self, length: usize) -> Option<Vec<u8>> {
        if self.total_length < length {
            return None;
        }
        Some(self.take(length))
    }

    /// Byte count through the end of the first `\r\n\r\n`, if present.
    fn find_header_end(&self) -> Option<usize> {
        let mut state = 0u8;
        let mut consumed = 0usize;
        for chunk in &self.chunks {
            for &byte in chunk {
                consumed += 1;
                state = match (byte, state) {
                    (CR, 2) => 3,
                    (CR, _) => 1,
                    (LF, 1) => 2,
                    (LF, 3) => return Some(consumed),
                    _ => 0,
                };
            }
        }
        None
    }

    fn take(&mut self, length: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(length);
        while out.len() < length {
            let Some(mut chunk) = self.chunks.pop_front() else {
                break;
            };
            let wanted = length - out.len();
            if chunk.len() > wanted {
                let rest = chunk.split_off(wanted);
                self.chunks.push_front(rest);
            }
            out.extend_from_slice(&chunk);
        }
        self.total_length -= out.len();
        out
    }
}
