//! Incremental decoding of a separator-delimited JSON byte stream.
//!
//! [`StreamDecoder`] is a pure state object: feed it chunks with
//! [`StreamDecoder::push`], drain complete records with
//! [`StreamDecoder::next_record`], and call [`StreamDecoder::finish`] once the
//! body ends. [`RecordStream`] drives it over an async byte stream.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::stream::Stream;

use crate::config::TrailingPolicy;
use crate::error::{CoreResult, SearchError};
use crate::model::SearchRecord;
use crate::stream::StreamEvent;
use crate::transport::ByteStream;

/// UTF-8 decoder that holds back a multi-byte sequence split across chunks.
#[derive(Debug, Default)]
struct Utf8Accumulator {
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    fn decode_into(&mut self, chunk: &[u8], out: &mut String) {
        let mut input = std::mem::take(&mut self.pending);
        input.extend_from_slice(chunk);
        let mut rest: &[u8] = &input;
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + bad..];
                        }
                        None => {
                            // incomplete sequence at the end of this chunk
                            self.pending = rest[valid..].to_vec();
                            return;
                        }
                    }
                }
            }
        }
    }

    fn finish_into(&mut self, out: &mut String) {
        if !self.pending.is_empty() {
            self.pending.clear();
            out.push(char::REPLACEMENT_CHARACTER);
        }
    }
}

/// What was left in the buffer when the stream ended.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Finish {
    /// Final record parsed from the remainder (`TrailingPolicy::Flush` only).
    pub record: Option<SearchRecord>,
    /// Bytes of non-blank remainder that were dropped.
    pub discarded_bytes: usize,
}

#[derive(Debug)]
pub struct StreamDecoder {
    separator: String,
    trailing: TrailingPolicy,
    utf8: Utf8Accumulator,
    buf: String,
    failed: bool,
}

impl StreamDecoder {
    pub fn new(separator: impl Into<String>, trailing: TrailingPolicy) -> Self {
        Self {
            separator: separator.into(),
            trailing,
            utf8: Utf8Accumulator::default(),
            buf: String::new(),
            failed: false,
        }
    }

    pub fn from_config(cfg: &crate::config::StreamCfg) -> Self {
        Self::new(cfg.separator.clone(), cfg.trailing)
    }

    /// Append one chunk of raw bytes. Ignored once the decoder has failed.
    pub fn push(&mut self, chunk: &[u8]) {
        if self.failed {
            return;
        }
        self.utf8.decode_into(chunk, &mut self.buf);
    }

    /// Next complete record, or `Ok(None)` when the buffer holds no separator.
    ///
    /// A candidate that fails to parse poisons the decoder: the error is
    /// returned once and every later call yields `Ok(None)`. An empty
    /// separator can never frame a record and fails the same way.
    pub fn next_record(&mut self) -> CoreResult<Option<SearchRecord>> {
        if self.failed {
            return Ok(None);
        }
        if self.separator.is_empty() {
            return Err(self.fail(SearchError::Validation(
                "record separator must not be empty".into(),
            )));
        }
        while let Some(idx) = self.buf.find(self.separator.as_str()) {
            let candidate: String = self.buf.drain(..idx).collect();
            self.buf.drain(..self.separator.len());
            let candidate = candidate.trim();
            if candidate.is_empty() {
                continue;
            }
            return match SearchRecord::from_json(candidate) {
                Ok(rec) => Ok(Some(rec)),
                Err(e) => Err(self.fail(e)),
            };
        }
        Ok(None)
    }

    /// Close the stream. Call only after `next_record` returned `Ok(None)`.
    pub fn finish(&mut self) -> CoreResult<Finish> {
        if self.failed {
            return Ok(Finish::default());
        }
        self.utf8.finish_into(&mut self.buf);
        let remainder = std::mem::take(&mut self.buf);
        let remainder = remainder.trim();
        if remainder.is_empty() {
            return Ok(Finish::default());
        }
        match self.trailing {
            TrailingPolicy::Discard => Ok(Finish {
                record: None,
                discarded_bytes: remainder.len(),
            }),
            TrailingPolicy::Flush => match SearchRecord::from_json(remainder) {
                Ok(rec) => Ok(Finish {
                    record: Some(rec),
                    discarded_bytes: 0,
                }),
                Err(e) => Err(self.fail(e)),
            },
        }
    }

    pub fn has_failed(&self) -> bool {
        self.failed
    }

    fn fail(&mut self, e: SearchError) -> SearchError {
        self.failed = true;
        self.buf.clear();
        self.utf8.pending.clear();
        e
    }
}

/// Decode a complete, already-buffered body. Convenience for replay and tests.
pub fn decode_all<'a, I>(
    separator: &str,
    trailing: TrailingPolicy,
    chunks: I,
) -> CoreResult<Vec<SearchRecord>>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut dec = StreamDecoder::new(separator, trailing);
    let mut out = Vec::new();
    for chunk in chunks {
        dec.push(chunk);
        while let Some(rec) = dec.next_record()? {
            out.push(rec);
        }
    }
    out.extend(dec.finish()?.record);
    Ok(out)
}

/// Adapts a byte stream into decoded [`StreamEvent`]s, ending with exactly one terminal event.
pub struct RecordStream {
    inner: ByteStream,
    decoder: StreamDecoder,
    inner_done: bool,
    finished: bool,
}

impl RecordStream {
    pub fn new(inner: ByteStream, decoder: StreamDecoder) -> Self {
        Self {
            inner,
            decoder,
            inner_done: false,
            finished: false,
        }
    }

    fn terminate(&mut self, ev: StreamEvent) -> Poll<Option<StreamEvent>> {
        self.finished = true;
        Poll::Ready(Some(ev))
    }
}

impl Stream for RecordStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        loop {
            // Drain what is already buffered before reading more bytes.
            match self.decoder.next_record() {
                Ok(Some(rec)) => return Poll::Ready(Some(StreamEvent::Record(rec))),
                Ok(None) => {}
                Err(e) => return self.terminate(StreamEvent::Error(e)),
            }

            let polled = if self.inner_done {
                Poll::Ready(None)
            } else {
                self.inner.as_mut().poll_next(cx)
            };
            match polled {
                Poll::Ready(Some(Ok(chunk))) => {
                    self.decoder.push(&chunk);
                    continue;
                }
                Poll::Ready(Some(Err(e))) => return self.terminate(StreamEvent::Error(e)),
                Poll::Ready(None) => {
                    self.inner_done = true;
                    return match self.decoder.finish() {
                        Ok(Finish {
                            record: Some(rec), ..
                        }) => {
                            // Done follows on the next poll.
                            Poll::Ready(Some(StreamEvent::Record(rec)))
                        }
                        Ok(Finish {
                            discarded_bytes, ..
                        }) => {
                            if discarded_bytes > 0 {
                                tracing::warn!(
                                    discarded_bytes,
                                    "stream ended with an unterminated record; remainder discarded"
                                );
                            }
                            self.terminate(StreamEvent::Done { discarded_bytes })
                        }
                        Err(e) => self.terminate(StreamEvent::Error(e)),
                    };
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
