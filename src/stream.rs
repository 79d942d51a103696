//! Incremental ingestion of streamed text.
//!
//! Chunks arrive as raw bytes and may split a multi-byte character. The
//! accumulator carries incomplete trailing bytes over to the next chunk and
//! only fails on bytes that can never become valid UTF-8.

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{GenerationError, StreamDecodeError};

/// Growing UTF-8 text buffer fed with arbitrary byte chunks.
#[derive(Debug, Default)]
pub struct Utf8Accumulator {
    /// Bytes of an incomplete trailing character.
    pending: Vec<u8>,
    text: String,
    /// Bytes already decoded into `text`.
    consumed: usize,
}

impl Utf8Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `chunk` and append it. Returns the number of characters added.
    pub fn push(&mut self, chunk: &[u8]) -> Result<usize, StreamDecodeError> {
        self.pending.extend_from_slice(chunk);
        let before = self.text.len();

        match std::str::from_utf8(&self.pending) {
            Ok(decoded) => {
                self.text.push_str(decoded);
                self.consumed += self.pending.len();
                self.pending.clear();
            }
            Err(e) => {
                let valid = e.valid_up_to();
                if e.error_len().is_some() {
                    return Err(StreamDecodeError {
                        offset: self.consumed + valid,
                    });
                }
                // Only an incomplete sequence at the end: keep it for the next chunk
                let head: Vec<u8> = self.pending.drain(..valid).collect();
                self.text.push_str(std::str::from_utf8(&head).map_err(|_| {
                    StreamDecodeError {
                        offset: self.consumed,
                    }
                })?);
                self.consumed += valid;
            }
        }

        Ok(self.text[before..].chars().count())
    }

    /// Finish the stream. Leftover bytes mean the stream ended mid-character.
    pub fn finish(self) -> Result<String, StreamDecodeError> {
        if self.pending.is_empty() {
            Ok(self.text)
        } else {
            Err(StreamDecodeError {
                offset: self.consumed,
            })
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Notification published while a stream is ingested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamNotice {
    /// Full text accumulated so far.
    Progress(String),
    /// The stream ended; carries the complete text.
    Complete(String),
    /// The stream broke. Partial text is not final.
    Failed(String),
}

/// How an ingestion run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// Byte stream produced by a text generation request.
pub type ByteStream =
    std::pin::Pin<Box<dyn Stream<Item = Result<Vec<u8>, GenerationError>> + Send>>;

/// Reads a byte stream to its end, publishing the growing text after every chunk.
pub struct StreamIngestor {
    cancel: CancellationToken,
}

impl StreamIngestor {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Consume `stream` until it ends, fails, or the cancellation token fires.
    ///
    /// Cancellation stops reading and publishes nothing further.
    pub async fn run<S, F>(self, mut stream: S, mut publish: F) -> IngestOutcome
    where
        S: Stream<Item = Result<Vec<u8>, GenerationError>> + Unpin,
        F: FnMut(StreamNotice),
    {
        let mut acc = Utf8Accumulator::new();
        let mut chunks = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!(chunks, "stream_cancelled");
                    return IngestOutcome::Cancelled;
                }
                next = stream.next() => next,
            };

            if self.cancel.is_cancelled() {
                debug!(chunks, "stream_cancelled");
                return IngestOutcome::Cancelled;
            }

            match next {
                Some(Ok(chunk)) => {
                    chunks += 1;
                    trace!(bytes = chunk.len(), "stream_chunk");
                    match acc.push(&chunk) {
                        Ok(0) => {}
                        Ok(_) => publish(StreamNotice::Progress(acc.text().to_string())),
                        Err(e) => {
                            warn!(error = %e, "stream_decode_failed");
                            publish(StreamNotice::Failed(e.to_string()));
                            return IngestOutcome::Failed;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, chunks, "stream_failed");
                    publish(StreamNotice::Failed(e.to_string()));
                    return IngestOutcome::Failed;
                }
                None => {
                    return match acc.finish() {
                        Ok(text) => {
                            debug!(chunks, chars = text.chars().count(), "stream_complete");
                            publish(StreamNotice::Complete(text));
                            IngestOutcome::Completed
                        }
                        Err(e) => {
                            warn!(error = %e, "stream_truncated");
                            publish(StreamNotice::Failed(e.to_string()));
                            IngestOutcome::Failed
                        }
                    };
                }
            }
        }
    }
}
