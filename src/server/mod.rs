//! Client-facing TCP listener.
//!
//! Accepts connections and spawns one handler task per connection. The
//! accept loop never waits on a handler; an accept error abandons only that
//! attempt.

mod framing;
mod handler;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time;

use crate::{log_debug, log_info, log_warn, BridgeError, Result};

pub use framing::FrameCodec;
pub use handler::HandlerContext;

/// Pause after a failed accept (fd exhaustion and the like) so the loop
/// does not spin.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(100);

/// Bound listener, ready to accept client connections.
pub struct BridgeServer {
    listener: TcpListener,
    ctx: HandlerContext,
}

impl BridgeServer {
    // ---

    /// Bind `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Bind`] if the address is unavailable.
    pub async fn bind(addr: SocketAddr, ctx: HandlerContext) -> Result<Self> {
        // ---
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BridgeError::Bind { addr, source })?;

        Ok(Self { listener, ctx })
    }

    /// The address actually bound (resolves port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires.
    ///
    /// Connections already being served keep running; they finish their
    /// current request cycle on their own.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        // ---
        let Self { listener, ctx } = self;
        if let Ok(_addr) = listener.local_addr() {
            log_info!("listening on {_addr}");
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        log_debug!("accepted connection from {peer}");
                        if let Err(_err) = stream.set_nodelay(true) {
                            log_debug!("{peer}: set_nodelay failed: {_err}");
                        }

                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            if let Err(_err) = handler::serve(stream, peer, ctx).await {
                                log_warn!("connection {peer} closed: {_err}");
                            }
                        });
                    }
                    Err(_err) => {
                        log_warn!("accept failed: {_err}; pausing {ACCEPT_ERROR_DELAY:?}");
                        pause_after_accept_error(&mut shutdown).await;
                    }
                },
                _ = shutdown.changed() => {}
            }

            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                log_info!("listener stopping");
                break;
            }
        }
    }
}

/// Wait out [`ACCEPT_ERROR_DELAY`], returning early on shutdown.
async fn pause_after_accept_error(shutdown: &mut watch::Receiver<bool>) {
    // ---
    tokio::select! {
        _ = time::sleep(ACCEPT_ERROR_DELAY) => {}
        _ = shutdown.changed() => {}
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_accept_error_pauses_before_retry() {
        // ---
        let (_tx, mut rx) = watch::channel(false);

        let started = Instant::now();
        pause_after_accept_error(&mut rx).await;

        assert!(started.elapsed() >= ACCEPT_ERROR_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_error_pause_cut_short_by_shutdown() {
        // ---
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();

        let started = Instant::now();
        pause_after_accept_error(&mut rx).await;

        assert!(started.elapsed() < ACCEPT_ERROR_DELAY);
    }
}
