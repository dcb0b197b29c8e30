//! The boundary between the multiplexer and whatever produces and consumes session bytes.
//!
//! Callers own a [`Tunnel`] behind `Rc<RefCell<dyn Tunnel>>` and register a [`SessionHandler`]
//! per session. Delivery is push-only: reassembled bytes arrive through
//! [`SessionHandler::on_read`] while the tunnel is borrowed, so handlers must never call back into
//! the tunnel that invoked them.

use thiserror::Error;

use crate::TunnelError;

/// Session id, unique within the owning client or server endpoint. Zero is never allocated.
pub type SessionId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("receiver has no room for {len} bytes")]
    Full { len: usize },

    #[error("receiver is gone")]
    Detached,
}

/// Receives the events of one session.
pub trait SessionHandler {
    /// A reassembled chunk. The bytes are discarded after this returns, whatever the result.
    fn on_read(&mut self, id: SessionId, data: &[u8]) -> Result<(), DeliveryError>;

    /// The peer sent its close signal. Called at most once, after every preceding chunk.
    fn on_close(&mut self, id: SessionId);

    /// Whether a chunk of `len` bytes can be taken right now. Returning `false` leaves the chunk
    /// queued in the engine until the next tick.
    fn ready(&self, len: usize) -> bool {
        let _ = len;
        true
    }
}

/// [`SessionHandler`] built from a pair of closures.
pub struct Callbacks<R, C> {
    on_read: R,
    on_close: C,
}

impl<R, C> Callbacks<R, C>
where
    R: FnMut(SessionId, &[u8]) -> Result<(), DeliveryError>,
    C: FnMut(SessionId),
{
    pub fn new(on_read: R, on_close: C) -> Self {
        Self { on_read, on_close }
    }
}

impl<R, C> SessionHandler for Callbacks<R, C>
where
    R: FnMut(SessionId, &[u8]) -> Result<(), DeliveryError>,
    C: FnMut(SessionId),
{
    fn on_read(&mut self, id: SessionId, data: &[u8]) -> Result<(), DeliveryError> {
        (self.on_read)(id, data)
    }

    fn on_close(&mut self, id: SessionId) {
        (self.on_close)(id)
    }
}

/// Session operations shared by [`crate::TunnelClient`] and the server's per-peer
/// [`crate::Endpoint`].
pub trait Tunnel {
    /// Opens a session. Returns `None` when no id could be allocated or the tunnel has no peer.
    fn new_session(&mut self, handler: Box<dyn SessionHandler>) -> Option<SessionId>;

    /// Drops the session and its engine immediately. Unknown ids are ignored.
    fn remove_session(&mut self, id: SessionId);

    /// Queues bytes, fragmenting as needed.
    ///
    /// Returns how many leading bytes were accepted; this is short when the engine pushes back
    /// part way through. An empty slice is accepted as `Ok(0)` and never signals close.
    fn write(&mut self, id: SessionId, bytes: &[u8]) -> Result<usize, TunnelError>;

    /// Queues the close signal. The session is removed once the peer has acknowledged everything
    /// queued before it. Closing twice is a no-op.
    fn close_session(&mut self, id: SessionId) -> Result<(), TunnelError>;

    /// Pull-style reads are not supported; delivery goes through [`SessionHandler::on_read`].
    fn read(&mut self, id: SessionId, buf: &mut [u8]) -> Option<usize> {
        let _ = (id, buf);
        None
    }
}
