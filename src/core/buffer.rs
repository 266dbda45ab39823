//! Per-device inbound byte accumulation and delimiter framing.
//!
//! A [`FrameBuffer`] owns the bytes a device has sent that no read has
//! consumed yet, together with the single-byte terminator used to cut
//! frames out of them.

use crate::domain::error::{BtSerialError, BtSerialResult};

/// Terminator used until a device is given one explicitly.
pub const DEFAULT_DELIMITER: u8 = 0x00;

/// Inbound buffer and frame terminator for one device session
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    data: Vec<u8>,
    delimiter: u8,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            delimiter: DEFAULT_DELIMITER,
        }
    }

    /// Append a chunk. Returns true when the chunk carried the delimiter,
    /// i.e. at least one more complete frame is now buffered.
    pub fn append(&mut self, chunk: &[u8]) -> bool {
        self.data.extend_from_slice(chunk);
        chunk.contains(&self.delimiter)
    }

    /// Take everything buffered, leaving the buffer empty
    pub fn drain_all(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Snapshot of the buffered bytes without consuming them
    pub fn peek(&self) -> &[u8] {
        &self.data
    }

    /// Cut the first delimiter-terminated frame off the front.
    ///
    /// The returned frame includes the delimiter. An incomplete frame is
    /// never consumed: without a delimiter the result is empty and the
    /// buffer is left untouched.
    pub fn extract_frame(&mut self) -> Vec<u8> {
        match self.data.iter().position(|&b| b == self.delimiter) {
            Some(index) => self.data.drain(..=index).collect(),
            None => Vec::new(),
        }
    }

    pub fn delimiter(&self) -> u8 {
        self.delimiter
    }

    pub fn set_delimiter(&mut self, delimiter: u8) {
        self.delimiter = delimiter;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a delimiter written by a human.
///
/// Accepts `\n`, `\r`, `\t`, `\0`, hex such as `0x0A`, or a literal whose
/// first byte becomes the delimiter.
pub fn parse_delimiter(input: &str) -> BtSerialResult<u8> {
    match input {
        "" => Err(BtSerialError::InvalidInput(
            "delimiter must not be empty".to_string(),
        )),
        "\\n" => Ok(b'\n'),
        "\\r" => Ok(b'\r'),
        "\\t" => Ok(b'\t'),
        "\\0" => Ok(0),
        _ => {
            if let Some(hex_digits) = input
                .strip_prefix("0x")
                .or_else(|| input.strip_prefix("0X"))
            {
                return u8::from_str_radix(hex_digits, 16).map_err(|e| {
                    BtSerialError::InvalidInput(format!("Invalid hex delimiter '{}': {}", input, e))
                });
            }
            Ok(input.as_bytes()[0])
        }
    }
}
