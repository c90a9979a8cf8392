//! The protocol framing seam.
//!
//! A [`ConnectionContext`] owns everything byte-level about one wire
//! protocol on one connection: frame boundaries, in-flight call state,
//! and the drain gate the reactor consults before it lets its thread
//! exit. The reactor itself never inspects payload bytes.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;

use crate::connection::Direction;
use crate::error::{Error, Result};

/// Queues protocol-level responses produced while parsing inbound data.
pub struct ResponseSink<'a> {
    pub(crate) responses: &'a mut VecDeque<Bytes>,
}

impl ResponseSink<'_> {
    /// Queue `data` for transmission on this connection.
    pub fn push(&mut self, data: Bytes) {
        self.responses.push_back(data);
    }
}

/// Protocol-specific framing state plugged into a generic connection.
pub trait ConnectionContext: Send + 'static {
    /// Parse and act on buffered inbound bytes, returning how many were
    /// consumed. Incomplete trailing frames stay buffered; the
    /// connection calls again once more bytes arrive.
    fn process_calls(&mut self, data: &[u8], out: &mut ResponseSink<'_>) -> Result<usize>;

    /// Whether the connection holds no in-flight protocol state and may
    /// be reaped by the idle scanner.
    fn is_idle(&self) -> bool;

    /// Gate for reactor exit: true once pending protocol work has
    /// drained after shutdown.
    fn ready_to_stop(&self) -> bool {
        true
    }
}

/// Produces a fresh context for each new connection.
pub type ContextFactory = Arc<dyn Fn(Direction) -> Box<dyn ConnectionContext> + Send + Sync>;

/// A minimal length-delimited framing context: each frame is a u32
/// big-endian length followed by that many payload bytes.
///
/// Server-side it echoes every frame back; client-side it consumes
/// frames silently. Enough protocol to exercise the transport in tests
/// and demos.
pub struct DelimitedContext {
    echo: bool,
    frames_seen: u64,
}

impl DelimitedContext {
    /// Context that echoes each inbound frame (server side).
    pub fn echoing() -> Box<dyn ConnectionContext> {
        Box::new(DelimitedContext {
            echo: true,
            frames_seen: 0,
        })
    }

    /// Context that consumes inbound frames without responding
    /// (client side).
    pub fn silent() -> Box<dyn ConnectionContext> {
        Box::new(DelimitedContext {
            echo: false,
            frames_seen: 0,
        })
    }

    /// A [`ContextFactory`] wiring servers to echo and clients to
    /// consume.
    pub fn factory() -> ContextFactory {
        Arc::new(|direction| match direction {
            Direction::Server => DelimitedContext::echoing(),
            Direction::Client => DelimitedContext::silent(),
        })
    }

    /// Frame `payload` for the wire.
    pub fn encode(payload: &[u8]) -> Bytes {
        let mut framed = Vec::with_capacity(4 + payload.len());
        framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        framed.extend_from_slice(payload);
        Bytes::from(framed)
    }
}

const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

impl ConnectionContext for DelimitedContext {
    fn process_calls(&mut self, data: &[u8], out: &mut ResponseSink<'_>) -> Result<usize> {
        let mut consumed = 0;
        while data.len() - consumed >= 4 {
            let header: [u8; 4] = data[consumed..consumed + 4].try_into().unwrap();
            let len = u32::from_be_bytes(header) as usize;
            if len > MAX_FRAME_LEN {
                return Err(Error::NetworkError(format!(
                    "frame length {len} exceeds maximum {MAX_FRAME_LEN}"
                )));
            }
            if data.len() - consumed - 4 < len {
                break;
            }
            let frame = &data[consumed + 4..consumed + 4 + len];
            self.frames_seen += 1;
            if self.echo {
                out.push(DelimitedContext::encode(frame));
            }
            consumed += 4 + len;
        }
        Ok(consumed)
    }

    fn is_idle(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink_and_process(
        ctx: &mut dyn ConnectionContext,
        data: &[u8],
    ) -> (usize, VecDeque<Bytes>) {
        let mut responses = VecDeque::new();
        let consumed = ctx
            .process_calls(
                data,
                &mut ResponseSink {
                    responses: &mut responses,
                },
            )
            .unwrap();
        (consumed, responses)
    }

    #[test]
    fn echoes_complete_frames() {
        let mut ctx = DelimitedContext::echoing();
        let wire = DelimitedContext::encode(b"hello");
        let (consumed, responses) = sink_and_process(ctx.as_mut(), &wire);
        assert_eq!(consumed, wire.len());
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0], wire);
    }

    #[test]
    fn partial_frame_stays_buffered() {
        let mut ctx = DelimitedContext::echoing();
        let wire = DelimitedContext::encode(b"hello");
        let (consumed, responses) = sink_and_process(ctx.as_mut(), &wire[..wire.len() - 1]);
        assert_eq!(consumed, 0);
        assert!(responses.is_empty());
    }

    #[test]
    fn several_frames_in_one_read() {
        let mut ctx = DelimitedContext::silent();
        let mut wire = DelimitedContext::encode(b"a").to_vec();
        wire.extend_from_slice(&DelimitedContext::encode(b"bb"));
        let (consumed, responses) = sink_and_process(ctx.as_mut(), &wire);
        assert_eq!(consumed, wire.len());
        assert!(responses.is_empty());
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut ctx = DelimitedContext::silent();
        let mut responses = VecDeque::new();
        let header = (u32::MAX).to_be_bytes();
        let err = ctx
            .process_calls(
                &header,
                &mut ResponseSink {
                    responses: &mut responses,
                },
            )
            .unwrap_err();
        assert!(err.is_network_error());
    }
}
