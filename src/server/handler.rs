//! Per-connection request handling.
//!
//! A connection is a sequence of lock-step request cycles: read one frame,
//! bridge it through the broker, write one reply, read the next frame.
//! Exactly one correlation token is live per connection at any time.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{self, Instant};
use tokio_util::codec::Framed;

use super::framing::FrameCodec;
use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    BridgeError,
    CorrelationId,
    CorrelationStore,
    Envelope,
    FrameMode,
    Publisher,
    Result,
    Topic,
};

/// Everything a connection handler needs, shared by all connections.
#[derive(Clone)]
pub struct HandlerContext {
    pub store: CorrelationStore,
    pub publisher: Publisher,
    pub request_topic: Topic,
    pub request_timeout: Duration,
    pub failure_payload: Bytes,
    pub frame_mode: FrameMode,
    pub max_frame_len: usize,
}

/// Lifecycle of one request, logged at debug level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Init,
    Published,
    Responded,
    TimedOut,
    Failed,
    Done,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "INIT",
            Self::Published => "PUBLISHED",
            Self::Responded => "RESPONDED",
            Self::TimedOut => "TIMED_OUT",
            Self::Failed => "FAILED",
            Self::Done => "DONE",
        })
    }
}

struct Tracker {
    id: CorrelationId,
    state: RequestState,
}

impl Tracker {
    fn new(id: CorrelationId) -> Self {
        log_debug!("{id}: {}", RequestState::Init);
        Self {
            id,
            state: RequestState::Init,
        }
    }

    fn advance(&mut self, next: RequestState) {
        log_debug!("{}: {} -> {next}", self.id, self.state);
        self.state = next;
    }
}

/// Serve one client connection until it closes or fails.
///
/// # Errors
///
/// Socket failures and oversized frames end the connection and are returned
/// to the listener for logging.
pub async fn serve(stream: TcpStream, peer: SocketAddr, ctx: HandlerContext) -> Result<()> {
    // ---
    let codec = FrameCodec::new(ctx.frame_mode, ctx.max_frame_len);
    let mut framed = Framed::new(stream, codec);
    let mut served = 0u64;

    while let Some(frame) = framed.next().await {
        let request = frame?;

        if request.is_empty() {
            continue;
        }

        let reply = round_trip(&ctx, request).await;
        framed.send(reply).await?;
        served += 1;
    }

    log_info!("{peer} disconnected after {served} request(s)");
    Ok(())
}

/// Bridge one request through the broker and produce the reply payload.
///
/// Never fails: every error path yields the configured failure payload.
async fn round_trip(ctx: &HandlerContext, request: Bytes) -> Bytes {
    // ---
    let deadline = Instant::now() + ctx.request_timeout;
    let id = CorrelationId::generate();
    let mut tracker = Tracker::new(id.clone());

    // Claim before publishing so a fast response cannot be missed.
    let claim = match ctx.store.claim(id.clone()) {
        Ok(claim) => claim,
        Err(_err) => {
            log_warn!("{id}: claim failed: {_err}");
            tracker.advance(RequestState::Failed);
            tracker.advance(RequestState::Done);
            return ctx.failure_payload.clone();
        }
    };

    let env = Envelope::request(ctx.request_topic.clone(), id.clone(), request);
    let published = match time::timeout_at(deadline, ctx.publisher.publish(env)).await {
        Ok(result) => result,
        Err(_elapsed) => Err(BridgeError::CorrelationTimeout),
    };

    let reply = match published {
        Ok(()) => {
            tracker.advance(RequestState::Published);
            let remaining = deadline.saturating_duration_since(Instant::now());

            match claim.wait(remaining).await {
                Ok(payload) => {
                    tracker.advance(RequestState::Responded);
                    payload
                }
                Err(BridgeError::CorrelationTimeout) => {
                    log_warn!("{id}: no response within {:?}", ctx.request_timeout);
                    tracker.advance(RequestState::TimedOut);
                    ctx.failure_payload.clone()
                }
                Err(_err) => {
                    log_warn!("{id}: wait failed: {_err}");
                    tracker.advance(RequestState::Failed);
                    ctx.failure_payload.clone()
                }
            }
        }
        Err(_err) => {
            // Dropping the claim unregisters the token.
            log_warn!("{id}: publish failed: {_err}");
            tracker.advance(RequestState::Failed);
            ctx.failure_payload.clone()
        }
    };

    tracker.advance(RequestState::Done);
    reply
}
