use std::{collections::BTreeMap, io::Write};

use tokio::time::Instant;

use crate::{
    buffer::Buffer,
    config::MuxConfig,
    engine::{Conversation, EngineError, Recv},
    metrics::Metrics,
    tunnel::{SessionHandler, SessionId},
    TunnelError,
};

/// One multiplexed stream: an engine conversation plus the handler its bytes are delivered to.
pub(crate) struct Session<O: Write> {
    id: SessionId,
    conv: Conversation<O>,
    staging: Buffer,
    /// Set when the local side queued its close signal.
    closing: Option<Instant>,
    /// Set when the peer's close signal was delivered.
    remote_closed: Option<Instant>,
    handler: Box<dyn SessionHandler>,
}

impl<O: Write> Session<O> {
    pub(crate) fn new(
        id: SessionId,
        output: O,
        handler: Box<dyn SessionHandler>,
        cfg: &MuxConfig,
    ) -> Result<Self, EngineError> {
        Ok(Self {
            id,
            conv: Conversation::new(id, output, &cfg.engine)?,
            staging: Buffer::with_capacity(cfg.buffer_size),
            closing: None,
            remote_closed: None,
            handler,
        })
    }

    pub(crate) fn write(&mut self, bytes: &[u8], max_fragment: usize) -> Result<usize, TunnelError> {
        if self.closing.is_some() {
            return Err(TunnelError::Closing(self.id));
        }

        let mut written = 0;
        for chunk in bytes.chunks(max_fragment.max(1)) {
            match self.conv.send(chunk) {
                Ok(_) => written += chunk.len(),
                Err(err) if written == 0 => {
                    return Err(match err {
                        EngineError::SendQueueFull { .. } => TunnelError::Backpressure,
                        err => TunnelError::Engine(err),
                    });
                }
                Err(err) => {
                    tracing::trace!(id = self.id, written, "short write: {err}");
                    break;
                }
            }
        }
        Ok(written)
    }

    pub(crate) fn close(&mut self, now: Instant) -> Result<(), TunnelError> {
        if self.closing.is_some() {
            return Ok(());
        }
        self.conv.send_close()?;
        self.closing = Some(now);
        tracing::debug!(id = self.id, "close signal queued");
        Ok(())
    }

    pub(crate) fn input(&mut self, datagram: &[u8]) -> Result<(), EngineError> {
        self.conv.input(datagram)
    }

    pub(crate) fn update(&mut self, now_ms: u32) {
        if let Err(err) = self.conv.update(now_ms) {
            tracing::debug!(id = self.id, "engine update failed: {err}");
        }
    }

    /// Hands every ready chunk to the handler, stopping at the close signal or when the handler
    /// has no room.
    pub(crate) fn forward(&mut self, metrics: &Metrics) {
        while self.remote_closed.is_none() {
            let Some(size) = self.conv.peek_size() else {
                break;
            };
            if size > 0 && !self.handler.ready(size) {
                break;
            }

            match self.conv.recv(self.staging.tail_mut()) {
                Recv::Data(n) => {
                    if self.staging.commit(n).is_err() {
                        break;
                    }
                    if let Err(err) = self.handler.on_read(self.id, self.staging.head()) {
                        tracing::debug!(id = self.id, len = n, "delivery failed: {err}");
                        metrics.delivery_failed();
                    }
                    if self.staging.remove(n).is_err() {
                        break;
                    }
                }
                Recv::Close => {
                    tracing::debug!(id = self.id, "peer closed session");
                    self.remote_closed = Some(Instant::now());
                    self.handler.on_close(self.id);
                }
                Recv::NeedsMoreSpace => {
                    tracing::debug!(
                        id = self.id,
                        size,
                        capacity = self.staging.capacity(),
                        "chunk larger than staging buffer"
                    );
                    break;
                }
                Recv::NoData => break,
            }
        }
    }

    /// Whether the tick should drop this session now.
    ///
    /// Once either side has closed, the session goes when everything it sent is acknowledged or
    /// when `close_linger` has passed since the close, whichever comes first.
    fn finished(&self, now: Instant, cfg: &MuxConfig) -> bool {
        let Some(since) = self.closing.or(self.remote_closed) else {
            return false;
        };
        if self.conv.pending() == 0 {
            return true;
        }
        if now.saturating_duration_since(since) >= cfg.close_linger {
            tracing::warn!(
                id = self.id,
                pending = self.conv.pending(),
                "output was never acknowledged after close; dropping session"
            );
            return true;
        }
        false
    }
}

/// Sessions of one scope (the client, or one server endpoint) keyed by id.
pub(crate) struct SessionTable<O: Write> {
    sessions: BTreeMap<SessionId, Session<O>>,
    last_id: SessionId,
    metrics: Metrics,
}

impl<O: Write> SessionTable<O> {
    pub(crate) fn new(metrics: Metrics) -> Self {
        Self {
            sessions: BTreeMap::new(),
            last_id: 0,
            metrics,
        }
    }

    /// Next free id after the last one handed out. Wraps, never yields 0.
    pub(crate) fn allocate_id(&mut self, attempts: u32) -> Option<SessionId> {
        for _ in 0..attempts {
            self.last_id = self.last_id.wrapping_add(1);
            if self.last_id == 0 {
                self.last_id = 1;
            }
            if !self.sessions.contains_key(&self.last_id) {
                return Some(self.last_id);
            }
        }
        None
    }

    pub(crate) fn insert(&mut self, session: Session<O>) {
        let id = session.id;
        if self.sessions.insert(id, session).is_none() {
            self.metrics.session_opened();
        }
        tracing::debug!(id, "session opened");
    }

    pub(crate) fn remove(&mut self, id: SessionId) -> bool {
        let removed = self.sessions.remove(&id).is_some();
        if removed {
            self.metrics.session_closed();
            tracing::debug!(id, "session removed");
        }
        removed
    }

    pub(crate) fn get_mut(&mut self, id: SessionId) -> Option<&mut Session<O>> {
        self.sessions.get_mut(&id)
    }

    pub(crate) fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drives every session's timers, forwards whatever became ready and drops finished sessions.
    pub(crate) fn tick(&mut self, now: Instant, now_ms: u32, cfg: &MuxConfig) {
        let mut done = Vec::new();
        for (id, session) in self.sessions.iter_mut() {
            session.update(now_ms);
            session.forward(&self.metrics);
            if session.finished(now, cfg) {
                done.push(*id);
            }
        }
        for id in done {
            self.remove(id);
        }
    }
}

impl<O: Write> Drop for SessionTable<O> {
    fn drop(&mut self) {
        for _ in 0..self.sessions.len() {
            self.metrics.session_closed();
        }
    }
}
