//! Line capture for one child output stream.
//!
//! Each `StreamReader` owns its `CapturedStream` while the child is alive and
//! hands it back by value when its task is joined. Lines are reported to the
//! runner as `StreamEvent`s carrying only the arrival time; the bytes stay
//! with the reader.

use crate::decode::LineDecoder;
use crate::error::RunError;
use crate::outcome::Captured;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamId {
    Stdout,
    Stderr,
}

impl StreamId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamId::Stdout => "stdout",
            StreamId::Stderr => "stderr",
        }
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a reader tells the runner while the child is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    /// A complete line was captured at `at`.
    Line { stream: StreamId, at: Instant },
    /// Strict decoding failed at byte `offset` of the stream; the reader has stopped.
    DecodeFailed {
        stream: StreamId,
        offset: u64,
        encoding: &'static str,
    },
}

/// Why a reader stopped before end-of-stream. Recorded on the
/// `CapturedStream` next to the output gathered so far; the runner decides
/// whether it still matters for the run's outcome.
#[derive(Debug)]
pub enum StreamFailure {
    /// Strict decoding failed at byte `offset` of the stream.
    Decode { offset: u64, encoding: &'static str },
    /// Reading the pipe failed.
    Read(std::io::Error),
}

#[derive(Debug)]
enum Fragments {
    Raw(Vec<Vec<u8>>),
    Text {
        decoder: LineDecoder,
        lines: Vec<String>,
    },
}

/// Append-only capture buffer for one stream.
#[derive(Debug)]
pub struct CapturedStream {
    stream: StreamId,
    fragments: Fragments,
    /// Bytes consumed before the next fragment.
    bytes: u64,
    closed: bool,
    failure: Option<StreamFailure>,
}

impl CapturedStream {
    /// Raw capture, or decoded text when `decoder` is set.
    pub fn new(stream: StreamId, decoder: Option<LineDecoder>) -> Self {
        let fragments = match decoder {
            Some(decoder) => Fragments::Text {
                decoder,
                lines: Vec::new(),
            },
            None => Fragments::Raw(Vec::new()),
        };
        Self {
            stream,
            fragments,
            bytes: 0,
            closed: false,
            failure: None,
        }
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn failure(&self) -> Option<&StreamFailure> {
        self.failure.as_ref()
    }

    /// Number of captured fragments (lines plus any unterminated tail).
    pub fn fragment_count(&self) -> usize {
        match &self.fragments {
            Fragments::Raw(lines) => lines.len(),
            Fragments::Text { lines, .. } => lines.len(),
        }
    }

    /// Append one fragment. A fragment that fails strict decoding is still
    /// kept, decoded lossily, so the capture never loses what the child wrote.
    fn push(&mut self, bytes: Vec<u8>) -> Result<(), StreamFailure> {
        let start = self.bytes;
        self.bytes += bytes.len() as u64;
        match &mut self.fragments {
            Fragments::Raw(lines) => lines.push(bytes),
            Fragments::Text { decoder, lines } => match decoder.decode(&bytes) {
                Ok(text) => lines.push(text),
                Err(malformed) => {
                    lines.push(decoder.decode_lossy(&bytes));
                    return Err(StreamFailure::Decode {
                        offset: start + malformed.offset as u64,
                        encoding: decoder.encoding_name(),
                    });
                }
            },
        }
        Ok(())
    }

    /// Concatenate the fragments into the value reported to the caller.
    pub fn into_captured(self) -> Captured {
        self.into_parts().0
    }

    /// The captured output together with the failure that stopped the
    /// reader, if any.
    pub fn into_parts(self) -> (Captured, Option<RunError>) {
        let captured = match self.fragments {
            Fragments::Raw(lines) => Captured::Bytes(lines.concat()),
            Fragments::Text { lines, .. } => Captured::Text(lines.concat()),
        };
        let failure = self.failure.map(|failure| match failure {
            StreamFailure::Decode { offset, encoding } => RunError::Decode {
                stream: self.stream,
                offset,
                encoding,
            },
            StreamFailure::Read(source) => RunError::Io { source },
        });
        (captured, failure)
    }
}

/// Reads one pipe until end-of-stream, cancellation or a failure.
pub struct StreamReader<R> {
    stream: StreamId,
    reader: BufReader<R>,
    events: mpsc::UnboundedSender<StreamEvent>,
    cancel: watch::Receiver<bool>,
    captured: CapturedStream,
}

impl<R> StreamReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(
        stream: StreamId,
        pipe: R,
        decoder: Option<LineDecoder>,
        events: mpsc::UnboundedSender<StreamEvent>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream,
            reader: BufReader::new(pipe),
            events,
            cancel,
            captured: CapturedStream::new(stream, decoder),
        }
    }

    pub fn spawn(self) -> JoinHandle<CapturedStream> {
        tokio::spawn(self.run())
    }

    /// Capture lines until the pipe closes, cancellation is signalled or a
    /// line fails to decode, then flush any unterminated fragment.
    pub async fn run(mut self) -> CapturedStream {
        let mut line = Vec::new();
        let mut was_cancelled = false;
        loop {
            tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => {
                    was_cancelled = true;
                    break;
                }
                read = self.reader.read_until(b'\n', &mut line) => match read {
                    Ok(0) => break,
                    Ok(_) if line.ends_with(b"\n") => {
                        let at = Instant::now();
                        if !self.push(std::mem::take(&mut line)) {
                            break;
                        }
                        let _ = self.events.send(StreamEvent::Line {
                            stream: self.stream,
                            at,
                        });
                    }
                    // Unterminated tail; the next read reports EOF.
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(stream = %self.stream, error = %e, "error reading child output");
                        self.captured.failure = Some(StreamFailure::Read(e));
                        break;
                    }
                },
            }
        }

        if was_cancelled {
            // Bytes already pulled from the pipe but not yet scanned.
            line.extend_from_slice(self.reader.buffer());
        }
        if !line.is_empty() {
            self.push(line);
        }
        self.captured.closed = true;
        tracing::debug!(
            stream = %self.stream,
            bytes = self.captured.bytes,
            cancelled = was_cancelled,
            failed = self.captured.failure.is_some(),
            "stream reader finished"
        );
        self.captured
    }

    /// Capture one fragment. Returns `false` once the stream has failed;
    /// only the first failure is kept and reported.
    fn push(&mut self, bytes: Vec<u8>) -> bool {
        let Err(failure) = self.captured.push(bytes) else {
            return true;
        };
        if self.captured.failure.is_none() {
            if let StreamFailure::Decode { offset, encoding } = failure {
                let _ = self.events.send(StreamEvent::DecodeFailed {
                    stream: self.stream,
                    offset,
                    encoding,
                });
            }
            self.captured.failure = Some(failure);
        }
        false
    }
}

/// Resolves once cancellation is requested. A dropped sender never cancels.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|requested| *requested).await.is_err() {
        std::future::pending::<()>().await;
    }
}
