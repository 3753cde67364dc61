//! Terminator-delimited wire format.
//!
//! Request: `<filename>END_OF_FILENAME<source>END_OF_CODE`.
//! Response: `<transcript>\nEND_OF_RESULT\n`.
//!
//! Terminators are not escaped: source containing `END_OF_CODE` is cut at
//! the first occurrence.

use std::{path::Path, time::Duration};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    time::timeout,
};
use tracing::{debug, warn};

pub const FILENAME_TERMINATOR: &str = "END_OF_FILENAME";
pub const CODE_TERMINATOR: &str = "END_OF_CODE";
pub const RESULT_TERMINATOR: &str = "END_OF_RESULT";

/// Extension used when the filename has none.
pub const DEFAULT_EXTENSION: &str = ".kt";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("END_OF_FILENAME marker not found")]
    MissingFilenameTerminator,
    #[error("No filename received")]
    EmptyFilename,
    #[error("END_OF_CODE marker not found")]
    MissingCodeTerminator,
    #[error("No code received")]
    EmptyCode,
    #[error("request exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("request is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

impl ProtocolError {
    /// Framing mistakes are the client's; the rest are transport failures.
    pub fn response_text(&self) -> String {
        match self {
            Self::TooLarge { .. } | Self::InvalidUtf8(_) => format!("Server error: {self}"),
            _ => format!("Error: {self}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub filename: String,
    pub source_code: String,
}

impl Request {
    /// `.kt` when the filename carries no extension.
    pub fn extension(&self) -> String {
        extension_of(&self.filename)
    }
}

pub fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub text: String,
}

impl Response {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{}\n{RESULT_TERMINATOR}\n", self.text).into_bytes()
    }
}

impl From<&ProtocolError> for Response {
    fn from(err: &ProtocolError) -> Self {
        Self::new(err.response_text())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FrameLimits {
    pub max_read_attempts: usize,
    pub max_request_bytes: usize,
    pub read_chunk: usize,
    /// Applied to each individual read.
    pub read_timeout: Duration,
}

impl FrameLimits {
    /// Largest request that can complete. Attempts run out before the byte
    /// ceiling unless `max_read_attempts * read_chunk` exceeds it; with the
    /// defaults that is 11 KiB, and anything longer is answered as a missing
    /// `END_OF_CODE`.
    pub fn effective_max_bytes(&self) -> usize {
        self.max_request_bytes
            .min(self.max_read_attempts.saturating_mul(self.read_chunk.max(1)))
    }
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_read_attempts: 11,
            max_request_bytes: 1024 * 1024,
            read_chunk: 1024,
            read_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Reading,
    /// Both terminators are present.
    Complete,
    /// The byte ceiling was crossed.
    Malformed,
    /// Peer closed, read failed or timed out, or attempts ran out.
    Aborted,
}

/// Accumulates request bytes until a terminal [`ReadState`].
#[derive(Debug)]
pub struct FrameReader {
    buf: Vec<u8>,
    attempts: usize,
    state: ReadState,
    limits: FrameLimits,
}

impl FrameReader {
    pub fn new(limits: FrameLimits) -> Self {
        Self { buf: Vec::new(), attempts: 0, state: ReadState::Reading, limits }
    }

    pub fn state(&self) -> ReadState {
        self.state
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Feeds one read's worth of bytes; an empty chunk means the peer closed.
    pub fn push(&mut self, chunk: &[u8]) -> ReadState {
        if self.state != ReadState::Reading {
            return self.state;
        }
        self.attempts += 1;
        self.state = if chunk.is_empty() {
            ReadState::Aborted
        } else {
            self.buf.extend_from_slice(chunk);
            if self.buf.len() > self.limits.max_request_bytes {
                ReadState::Malformed
            } else if contains(&self.buf, FILENAME_TERMINATOR) && contains(&self.buf, CODE_TERMINATOR) {
                ReadState::Complete
            } else if self.attempts >= self.limits.max_read_attempts {
                ReadState::Aborted
            } else {
                ReadState::Reading
            }
        };
        self.state
    }

    pub fn abort(&mut self) {
        if self.state == ReadState::Reading {
            self.state = ReadState::Aborted;
        }
    }

    /// Decodes whatever arrived. A partial request surfaces as a missing
    /// terminator from [`parse_request`].
    pub fn finish(self) -> Result<String, ProtocolError> {
        if self.state == ReadState::Malformed {
            return Err(ProtocolError::TooLarge { limit: self.limits.max_request_bytes });
        }
        Ok(String::from_utf8(self.buf)?)
    }

    pub async fn read_from<S>(mut self, stream: &mut S) -> Result<String, ProtocolError>
    where
        S: AsyncRead + Unpin,
    {
        let mut chunk = vec![0u8; self.limits.read_chunk.max(1)];
        debug!(max_bytes = self.limits.effective_max_bytes(), "reading request");
        while self.state == ReadState::Reading {
            match timeout(self.limits.read_timeout, stream.read(&mut chunk)).await {
                Ok(Ok(n)) => {
                    let state = self.push(&chunk[..n]);
                    debug!(attempt = self.attempts, bytes = n, total = self.buf.len(), ?state, "read");
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "read failed");
                    self.abort();
                }
                Err(_) => {
                    warn!(timeout = ?self.limits.read_timeout, "read timed out");
                    self.abort();
                }
            }
        }
        self.finish()
    }
}

fn contains(haystack: &[u8], needle: &str) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle.as_bytes())
}

pub fn parse_request(data: &str) -> Result<Request, ProtocolError> {
    let (filename, rest) = data
        .split_once(FILENAME_TERMINATOR)
        .ok_or(ProtocolError::MissingFilenameTerminator)?;
    let filename = filename.trim();
    if filename.is_empty() {
        return Err(ProtocolError::EmptyFilename);
    }

    let (code, _) = rest
        .split_once(CODE_TERMINATOR)
        .ok_or(ProtocolError::MissingCodeTerminator)?;
    let code = code.trim();
    if code.is_empty() {
        return Err(ProtocolError::EmptyCode);
    }

    Ok(Request { filename: filename.to_string(), source_code: code.to_string() })
}

/// Client side of the framing.
pub fn encode_request(filename: &str, source: &str) -> String {
    format!("{filename}\n{FILENAME_TERMINATOR}\n{source}\n{CODE_TERMINATOR}\n")
}
