//! Length-prefixed message envelopes, shared by gRPC, gRPC-Web and Connect streaming.
//!
//! ```text
//! +-------+----------------------+-----------------+
//! | flags | length (u32, BE)     | payload         |
//! | 1 B   | 4 B                  | length bytes    |
//! +-------+----------------------+-----------------+
//! ```
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::{Stream, StreamExt, stream};
use http_body::Body as HttpBody;
use http_body_util::BodyExt;

use crate::BoxError;

pub const HEADER_LEN: usize = 5;

/// Message payload is compressed.
pub const FLAG_COMPRESSED: u8 = 0x01;
/// Connect streaming: the end-of-stream message.
pub const FLAG_END_STREAM: u8 = 0x02;
/// gRPC-Web: the trailers frame.
pub const FLAG_TRAILERS: u8 = 0x80;

/// Largest message accepted from a caller.
pub const MAX_MESSAGE_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Message of {0} bytes exceeds the {MAX_MESSAGE_LEN} byte limit")]
    TooLarge(usize),
    #[error("Request body ended inside a message")]
    Truncated,
    #[error("Invalid base64 in gRPC-Web text body")]
    Base64,
    #[error("Failed to read request body: {0}")]
    Body(BoxError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub flags: u8,
    pub payload: Bytes,
}

impl Envelope {
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    /// Trailer and end-of-stream frames carry protocol control data, not messages.
    pub fn is_control(&self) -> bool {
        self.flags & (FLAG_TRAILERS | FLAG_END_STREAM) != 0
    }
}

pub fn encode(flags: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(flags);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Base64 form of a frame, for `grpc-web-text` responses.
pub fn encode_text(frame: &[u8]) -> Bytes {
    Bytes::from(STANDARD.encode(frame))
}

/// Incremental envelope parser.
#[derive(Debug, Default)]
pub struct Decoder {
    buf: BytesMut,
}

impl Decoder {
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn next_envelope(&mut self) -> Result<Option<Envelope>, EnvelopeError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let flags = self.buf[0];
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len > MAX_MESSAGE_LEN {
            return Err(EnvelopeError::TooLarge(len));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();
        Ok(Some(Envelope { flags, payload }))
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Decodes a base64 body that may arrive split at any byte, and may be a concatenation of
/// separately padded chunks.
#[derive(Debug, Default)]
struct TextDecoder {
    pending: Vec<u8>,
}

impl TextDecoder {
    fn push(&mut self, chunk: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
        self.pending
            .extend(chunk.iter().copied().filter(|b| !b.is_ascii_whitespace()));

        let complete = self.pending.len() / 4 * 4;
        let mut out = Vec::with_capacity(complete / 4 * 3);
        for quad in self.pending[..complete].chunks(4) {
            STANDARD
                .decode_vec(quad, &mut out)
                .map_err(|_| EnvelopeError::Base64)?;
        }
        self.pending.drain(..complete);
        Ok(out)
    }

    fn finish(&self) -> Result<(), EnvelopeError> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(EnvelopeError::Base64)
        }
    }
}

struct State<B> {
    body: B,
    decoder: Decoder,
    text: Option<TextDecoder>,
    done: bool,
}

/// Reads envelopes off a request body as they arrive.
pub fn envelopes<B>(body: B, text: bool) -> impl Stream<Item = Result<Envelope, EnvelopeError>> + Send
where
    B: HttpBody<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError>,
{
    let state = State {
        body,
        decoder: Decoder::default(),
        text: text.then(TextDecoder::default),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.done {
                return None;
            }

            match state.decoder.next_envelope() {
                Ok(Some(envelope)) => return Some((Ok(envelope), state)),
                Ok(None) => {}
                Err(err) => {
                    state.done = true;
                    return Some((Err(err), state));
                }
            }

            match state.body.frame().await {
                Some(Ok(frame)) => {
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    let decoded = match state.text.as_mut() {
                        Some(text) => text.push(&data).map(Bytes::from),
                        None => Ok(data),
                    };
                    match decoded {
                        Ok(bytes) => state.decoder.push(&bytes),
                        Err(err) => {
                            state.done = true;
                            return Some((Err(err), state));
                        }
                    }
                }
                Some(Err(err)) => {
                    state.done = true;
                    return Some((Err(EnvelopeError::Body(err.into())), state));
                }
                None => {
                    state.done = true;
                    let leftover = state
                        .text
                        .as_ref()
                        .map_or(Ok(()), TextDecoder::finish)
                        .and_then(|()| {
                            if state.decoder.is_empty() {
                                Ok(())
                            } else {
                                Err(EnvelopeError::Truncated)
                            }
                        });
                    return leftover.err().map(|err| (Err(err), state));
                }
            }
        }
    })
}

/// Only the message envelopes, skipping control frames.
pub fn messages<B>(body: B, text: bool) -> impl Stream<Item = Result<Envelope, EnvelopeError>> + Send
where
    B: HttpBody<Data = Bytes> + Send + Unpin + 'static,
    B::Error: Into<BoxError>,
{
    envelopes(body, text).filter(|result| {
        let keep = !matches!(result, Ok(envelope) if envelope.is_control());
        async move { keep }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::TryStreamExt;
    use http_body_util::{Full, StreamBody};
    use std::convert::Infallible;

    fn chunked(chunks: Vec<Bytes>) -> StreamBody<impl Stream<Item = Result<http_body::Frame<Bytes>, Infallible>> + Send + Unpin> {
        StreamBody::new(stream::iter(
            chunks.into_iter().map(|c| Ok(http_body::Frame::data(c))),
        ))
    }

    #[tokio::test]
    async fn reassembles_envelopes_split_across_chunks() {
        let mut wire = encode(0, b"hello").to_vec();
        wire.extend_from_slice(&encode(0, b"world"));
        let chunks = wire.chunks(3).map(Bytes::copy_from_slice).collect();

        let payloads: Vec<_> = messages(chunked(chunks), false)
            .map_ok(|e| e.payload)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(payloads, vec![Bytes::from("hello"), Bytes::from("world")]);
    }

    #[tokio::test]
    async fn decodes_base64_bodies() {
        let mut text = STANDARD.encode(encode(0, b"abc"));
        text.push_str(&STANDARD.encode(encode(0, b"de")));
        let chunks = text.as_bytes().chunks(5).map(Bytes::copy_from_slice).collect();

        let payloads: Vec<_> = messages(chunked(chunks), true)
            .map_ok(|e| e.payload)
            .try_collect()
            .await
            .unwrap();

        assert_eq!(payloads, vec![Bytes::from("abc"), Bytes::from("de")]);
    }

    #[tokio::test]
    async fn truncated_bodies_are_errors() {
        let wire = encode(0, b"hello");
        let body = Full::new(wire.slice(..7));

        let result: Result<Vec<_>, _> = messages(body, false).try_collect().await;

        assert!(matches!(result, Err(EnvelopeError::Truncated)));
    }

    #[tokio::test]
    async fn oversized_messages_are_rejected() {
        let mut header = vec![0u8];
        header.extend_from_slice(&((MAX_MESSAGE_LEN as u32) + 1).to_be_bytes());
        let body = Full::new(Bytes::from(header));

        let result: Result<Vec<_>, _> = messages(body, false).try_collect().await;

        assert!(matches!(result, Err(EnvelopeError::TooLarge(_))));
    }

    #[tokio::test]
    async fn skips_control_frames() {
        let mut wire = encode(0, b"m").to_vec();
        wire.extend_from_slice(&encode(FLAG_END_STREAM, b"{}"));
        let body = Full::new(Bytes::from(wire));

        let all: Vec<_> = messages(body, false).try_collect().await.unwrap();

        assert_eq!(all.len(), 1);
    }
}
