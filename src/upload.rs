//! Chunked upload coordinator
//!
//! Large files go up in three phases: start a partial upload, append
//! fixed-size chunks, complete. The server acknowledges an absolute
//! offset after every append; the coordinator only proceeds while that
//! acknowledgement matches its own running total, and aborts rather
//! than guess when they diverge. Cancel releases server-side resources
//! from any live state.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::client::{Client, ClientError};
use crate::params::{ByteSource, ParameterBag};
use crate::response::ResponseError;
use crate::transport::TransportError;

const UPLOADS: &str = "uploaded_files";

/// Errors raised during a chunked transfer
#[derive(Error, Debug)]
pub enum UploadError {
    /// The server acknowledged an offset different from the bytes sent
    #[error("server acknowledged offset {reported} but {expected} bytes were sent")]
    OffsetMismatch {
        /// Local running total after the chunk
        expected: u64,
        /// Offset the server reported
        reported: u64,
    },

    /// A chunk kept failing at the transport level until the retry
    /// budget ran out
    #[error("chunk at offset {offset} failed after {attempts} attempt(s): {source}")]
    Transient {
        /// Offset of the chunk that never got through
        offset: u64,
        /// Attempts made, including the first
        attempts: u32,
        /// The final transport failure
        source: TransportError,
    },

    /// The server answered an upload phase with a non-2xx status
    #[error("upload {operation} rejected with status {status}")]
    Rejected {
        /// Which phase was rejected
        operation: &'static str,
        /// The status it answered with
        status: u16,
    },

    /// Completion was requested before every byte was acknowledged
    #[error("cannot complete: {sent} of {total} bytes acknowledged")]
    Incomplete {
        /// Bytes acknowledged so far
        sent: u64,
        /// Total bytes the transfer declared
        total: u64,
    },

    /// A phase was attempted from a state that does not allow it
    #[error("cannot {action} a transfer in the {state:?} state")]
    State {
        /// The phase that was attempted
        action: &'static str,
        /// The state the transfer was in
        state: UploadState,
    },

    /// The byte source could not be read
    #[error("could not read upload source: {0}")]
    Source(#[from] std::io::Error),

    /// An upload phase answered with an unexpected payload
    #[error("unexpected payload from upload {operation}: {source}")]
    Payload {
        /// Which phase answered strangely
        operation: &'static str,
        /// The decode failure
        source: ResponseError,
    },

    /// Dispatch of an upload phase failed before or below the protocol
    #[error(transparent)]
    Dispatch(#[from] ClientError),
}

/// Transfer state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// Server assigned an identifier; no chunk sent yet
    Started,
    /// At least one chunk acknowledged
    Appending,
    /// Completion acknowledged; the file exists server-side
    Completed,
    /// Transfer cancelled; the identifier is dead
    Cancelled,
    /// An append diverged or was rejected; only cancel remains
    Failed,
}

/// Chunking and retry policy. Bounds and backoff are configuration,
/// not constants.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Bytes per append
    pub chunk_size: usize,
    /// Extra attempts per chunk after the first transport failure
    pub max_chunk_retries: u32,
    /// Pause between attempts on the same chunk
    pub retry_backoff: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            max_chunk_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl UploadConfig {
    /// Default policy
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the chunk size
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the per-chunk retry budget
    pub fn with_max_chunk_retries(mut self, retries: u32) -> Self {
        self.max_chunk_retries = retries;
        self
    }

    /// Set the pause between attempts on the same chunk
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

#[derive(Debug, Deserialize)]
struct StartAck {
    id: String,
}

#[derive(Debug, Deserialize)]
struct AppendAck {
    offset: u64,
}

#[derive(Debug, Deserialize)]
struct CompleteAck {
    id: String,
}

/// Drives chunked transfers through the dispatcher
#[derive(Debug)]
pub struct Uploader<'a> {
    client: &'a Client,
    config: UploadConfig,
}

impl<'a> Uploader<'a> {
    /// An uploader with the default policy
    pub fn new(client: &'a Client) -> Self {
        Self {
            client,
            config: UploadConfig::default(),
        }
    }

    /// An uploader with an explicit policy
    pub fn with_config(client: &'a Client, config: UploadConfig) -> Self {
        Self { client, config }
    }

    /// Transfer a whole source: start, append every chunk, complete.
    ///
    /// On any unrecoverable failure the partial upload is cancelled
    /// (best effort) before the error is returned, so the server does
    /// not accumulate orphaned transfers. The source's file handle, if
    /// any, is scoped to this call.
    pub async fn upload(&self, name: &str, source: &ByteSource) -> Result<String, UploadError> {
        let total = source.size().await?;
        let mut reader = source.open().await?;
        let mut transfer = self.start(name, total).await?;

        loop {
            let chunk = match reader.next_chunk(self.config.chunk_size).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    transfer.abandon().await;
                    return Err(e.into());
                }
            };
            if chunk.is_empty() {
                break;
            }
            if let Err(e) = transfer.append(&chunk).await {
                transfer.abandon().await;
                return Err(e);
            }
        }

        transfer.complete().await
    }

    /// Open a partial upload for `total_size` bytes.
    ///
    /// The returned handle carries the server-assigned identifier; a
    /// caller that keeps it can drive the append/complete/cancel
    /// phases itself.
    pub async fn start(
        &self,
        name: &str,
        total_size: u64,
    ) -> Result<PartialUpload<'a>, UploadError> {
        let bag = ParameterBag::new().query("name", name).query("size", total_size);
        let response = self.client.send_pair(UPLOADS, "start_partial", &bag).await?;
        if !response.is_success() {
            return Err(UploadError::Rejected {
                operation: "start_partial",
                status: response.status(),
            });
        }
        let ack: StartAck = response.decode().map_err(|source| UploadError::Payload {
            operation: "start_partial",
            source,
        })?;

        debug!(upload = %ack.id, total_size, "partial upload started");
        Ok(PartialUpload {
            client: self.client,
            config: self.config.clone(),
            id: ack.id,
            total_size,
            acked: 0,
            state: UploadState::Started,
        })
    }
}

/// One live chunked transfer
#[derive(Debug)]
pub struct PartialUpload<'a> {
    client: &'a Client,
    config: UploadConfig,
    id: String,
    total_size: u64,
    acked: u64,
    state: UploadState,
}

impl PartialUpload<'_> {
    /// Server-assigned upload identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Bytes acknowledged by the server so far
    pub fn acknowledged(&self) -> u64 {
        self.acked
    }

    /// Total bytes the transfer declared at start
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Current state
    pub fn state(&self) -> UploadState {
        self.state
    }

    /// Send the next chunk at the current offset.
    ///
    /// Transport failures are retried on the same chunk up to the
    /// configured budget. A server acknowledgement that does not equal
    /// the local running total fails the transfer — a divergent offset
    /// is never silently corrected.
    pub async fn append(&mut self, chunk: &[u8]) -> Result<(), UploadError> {
        if !matches!(self.state, UploadState::Started | UploadState::Appending) {
            return Err(UploadError::State {
                action: "append",
                state: self.state,
            });
        }

        let offset = self.acked;
        let expected = offset + chunk.len() as u64;
        let mut attempts = 0u32;

        let response = loop {
            attempts += 1;
            let bag = ParameterBag::new()
                .path("id", self.id.clone())
                .query("offset", offset)
                .file("chunk", ByteSource::memory(chunk.to_vec()));

            match self.client.send_pair(UPLOADS, "append_partial", &bag).await {
                Ok(response) => break response,
                Err(ClientError::Transport(source)) => {
                    if attempts > self.config.max_chunk_retries {
                        self.state = UploadState::Failed;
                        return Err(UploadError::Transient {
                            offset,
                            attempts,
                            source,
                        });
                    }
                    warn!(
                        upload = %self.id,
                        offset,
                        attempt = attempts,
                        error = %source,
                        "chunk append failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                Err(other) => {
                    self.state = UploadState::Failed;
                    return Err(other.into());
                }
            }
        };

        if !response.is_success() {
            self.state = UploadState::Failed;
            return Err(UploadError::Rejected {
                operation: "append_partial",
                status: response.status(),
            });
        }

        let ack: AppendAck = response.decode().map_err(|source| {
            self.state = UploadState::Failed;
            UploadError::Payload {
                operation: "append_partial",
                source,
            }
        })?;

        if ack.offset != expected {
            self.state = UploadState::Failed;
            return Err(UploadError::OffsetMismatch {
                expected,
                reported: ack.offset,
            });
        }

        self.acked = expected;
        self.state = UploadState::Appending;
        debug!(upload = %self.id, acked = self.acked, "chunk acknowledged");
        Ok(())
    }

    /// Close the transfer, yielding the final file identifier. Every
    /// declared byte must have been acknowledged first.
    pub async fn complete(mut self) -> Result<String, UploadError> {
        if !matches!(self.state, UploadState::Started | UploadState::Appending) {
            return Err(UploadError::State {
                action: "complete",
                state: self.state,
            });
        }
        if self.acked != self.total_size {
            return Err(UploadError::Incomplete {
                sent: self.acked,
                total: self.total_size,
            });
        }

        let bag = ParameterBag::new().path("id", self.id.clone());
        let response = self
            .client
            .send_pair(UPLOADS, "complete_partial", &bag)
            .await?;
        if !response.is_success() {
            return Err(UploadError::Rejected {
                operation: "complete_partial",
                status: response.status(),
            });
        }
        let ack: CompleteAck = response.decode().map_err(|source| UploadError::Payload {
            operation: "complete_partial",
            source,
        })?;

        self.state = UploadState::Completed;
        debug!(upload = %self.id, file = %ack.id, "partial upload completed");
        Ok(ack.id)
    }

    /// Release the server-side transfer. Valid from any live state.
    pub async fn cancel(mut self) -> Result<(), UploadError> {
        if matches!(self.state, UploadState::Completed | UploadState::Cancelled) {
            return Err(UploadError::State {
                action: "cancel",
                state: self.state,
            });
        }
        self.send_cancel().await
    }

    /// Best-effort cancellation on failure paths; the original error
    /// matters more than a cancel that also failed
    async fn abandon(&mut self) {
        if matches!(self.state, UploadState::Completed | UploadState::Cancelled) {
            return;
        }
        if let Err(e) = self.send_cancel().await {
            warn!(upload = %self.id, error = %e, "failed to cancel partial upload");
        }
    }

    async fn send_cancel(&mut self) -> Result<(), UploadError> {
        let bag = ParameterBag::new().path("id", self.id.clone());
        let response = self.client.send_pair(UPLOADS, "cancel_partial", &bag).await?;
        self.state = UploadState::Cancelled;
        if !response.is_success() {
            return Err(UploadError::Rejected {
                operation: "cancel_partial",
                status: response.status(),
            });
        }
        debug!(upload = %self.id, "partial upload cancelled");
        Ok(())
    }
}
