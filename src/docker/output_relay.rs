// ABOUTME: Output relay that attaches to a sandbox's combined stdout/stderr
// Delivers decoded text chunks as a lazy stream that ends when the sandbox stream ends

use super::engine::{RawOutputStream, SandboxEngine, SandboxHandle, StreamKind};
use super::ContainerError;
use crate::models::SessionId;
use futures_util::stream::{BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, info, warn};

/// Decoded piece of program output, in the order the sandbox emitted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub kind: StreamKind,
    pub text: String,
}

pub struct OutputRelay {
    engine: Arc<dyn SandboxEngine>,
}

impl OutputRelay {
    pub fn new(engine: Arc<dyn SandboxEngine>) -> Self {
        Self { engine }
    }

    /// Attach to a sandbox's output.
    ///
    /// Fails only if the attach itself fails. Once attached, the subscription
    /// yields chunks until the sandbox stream ends; a broken stream is logged
    /// and treated as the end.
    pub async fn attach(
        &self,
        session_id: SessionId,
        handle: &SandboxHandle,
    ) -> Result<OutputSubscription, ContainerError> {
        let raw = self.engine.attach_output(handle).await?;
        info!("Relaying output of sandbox {} for session {}", handle.name(), session_id);
        Ok(OutputSubscription::from_raw(session_id, handle.name().to_string(), raw))
    }
}

/// A session's output as a stream of chunks.
///
/// Nothing is read from the sandbox until the subscription is polled, and
/// nothing is buffered beyond the frame being decoded. Dropping the
/// subscription (or calling [`OutputSubscription::cancel`]) releases the
/// underlying attach stream.
pub struct OutputSubscription {
    session_id: SessionId,
    chunks: BoxStream<'static, OutputChunk>,
}

impl OutputSubscription {
    pub fn from_raw(session_id: SessionId, container_name: String, raw: RawOutputStream) -> Self {
        let chunks = async_stream::stream! {
            let mut raw = raw;
            let mut decoders: Vec<(StreamKind, Utf8Decoder)> = Vec::new();

            while let Some(frame) = raw.next().await {
                match frame {
                    Ok(frame) => {
                        let index = match decoders.iter().position(|(kind, _)| *kind == frame.kind) {
                            Some(index) => index,
                            None => {
                                decoders.push((frame.kind, Utf8Decoder::default()));
                                decoders.len() - 1
                            }
                        };
                        let text = decoders[index].1.push(&frame.data);
                        if !text.is_empty() {
                            yield OutputChunk { kind: frame.kind, text };
                        }
                    }
                    Err(e) => {
                        warn!("Output stream of {} (session {}) broke: {}", container_name, session_id, e);
                        break;
                    }
                }
            }

            for (kind, decoder) in decoders {
                let text = decoder.finish();
                if !text.is_empty() {
                    yield OutputChunk { kind, text };
                }
            }

            debug!("Output stream ended for {} (session {})", container_name, session_id);
        };

        Self {
            session_id,
            chunks: chunks.boxed(),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub async fn next_chunk(&mut self) -> Option<OutputChunk> {
        self.chunks.next().await
    }

    /// Stop relaying and release the attach stream.
    pub fn cancel(self) {
        debug!("Output subscription for session {} cancelled", self.session_id);
    }

    /// Feed every chunk's text to `on_data` until the stream ends.
    pub async fn for_each_text<F>(mut self, mut on_data: F) -> usize
    where
        F: FnMut(String),
    {
        let mut delivered = 0;
        while let Some(chunk) = self.chunks.next().await {
            on_data(chunk.text);
            delivered += 1;
        }
        delivered
    }
}

impl Stream for OutputSubscription {
    type Item = OutputChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.chunks.poll_next_unpin(cx)
    }
}

/// Incremental UTF-8 decoder that keeps a split multi-byte sequence until
/// the rest of it arrives in the next frame.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(invalid) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + invalid);
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more bytes
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    fn finish(self) -> String {
        String::from_utf8_lossy(&self.pending).into_owned()
    }
}
