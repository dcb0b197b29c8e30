//! Byte pump between a TCP stream and one tunnel session.
//!
//! Each connection runs as a local task. Inbound bytes (TCP to tunnel) are staged in a
//! [`Buffer`] owned by the task and written into the session; outbound bytes (tunnel to TCP) are
//! pushed by the session's [`BridgeHandler`] into the shared [`Link`] and drained by the task.
//! Interest follows the buffers: the socket is only polled for reads while the inbound buffer has
//! room and for writes while the outbound buffer holds data.

use std::{cell::RefCell, io, net::SocketAddr, rc::Rc};

use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::Notify,
    time::MissedTickBehavior,
};

use crate::{
    buffer::Buffer,
    config::MuxConfig,
    metrics::Metrics,
    tunnel::{DeliveryError, SessionHandler, SessionId, Tunnel},
    TunnelError,
};

/// State shared between a session's handler and the task pumping its TCP stream.
pub struct Link {
    state: RefCell<LinkState>,
    wake: Notify,
}

struct LinkState {
    outbound: Buffer,
    remote_closed: bool,
    /// The session was removed from its tunnel.
    detached: bool,
    /// The pump stopped; nothing will drain `outbound` again.
    stream_gone: bool,
}

impl Link {
    pub fn new(capacity: usize) -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(LinkState {
                outbound: Buffer::with_capacity(capacity),
                remote_closed: false,
                detached: false,
                stream_gone: false,
            }),
            wake: Notify::new(),
        })
    }
}

/// Session handler that hands delivered bytes to a pump task.
pub struct BridgeHandler {
    link: Rc<Link>,
}

impl BridgeHandler {
    pub fn new(link: Rc<Link>) -> Self {
        Self { link }
    }
}

impl SessionHandler for BridgeHandler {
    fn on_read(&mut self, _id: SessionId, data: &[u8]) -> Result<(), DeliveryError> {
        let mut state = self.link.state.borrow_mut();
        if state.stream_gone {
            return Err(DeliveryError::Detached);
        }
        state
            .outbound
            .push(data)
            .map_err(|_| DeliveryError::Full { len: data.len() })?;
        drop(state);
        self.link.wake.notify_one();
        Ok(())
    }

    fn on_close(&mut self, _id: SessionId) {
        self.link.state.borrow_mut().remote_closed = true;
        self.link.wake.notify_one();
    }

    fn ready(&self, len: usize) -> bool {
        let state = self.link.state.borrow();
        state.stream_gone || state.outbound.unused() >= len
    }
}

impl Drop for BridgeHandler {
    fn drop(&mut self) {
        self.link.state.borrow_mut().detached = true;
        self.link.wake.notify_one();
    }
}

/// Accepts connections and gives each one a session on `tunnel` and a pump task.
///
/// Must run inside a [`tokio::task::LocalSet`]. Only returns on a listener error.
pub async fn serve_listener(
    listener: TcpListener,
    tunnel: Rc<RefCell<dyn Tunnel>>,
    config: MuxConfig,
) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(%peer, "failed to set TCP_NODELAY: {err}");
        }

        let link = Link::new(config.buffer_size);
        let handler = Box::new(BridgeHandler::new(link.clone()));
        let Some(id) = tunnel.borrow_mut().new_session(handler) else {
            tracing::warn!(%peer, "no session available; dropping connection");
            continue;
        };
        tracing::debug!(%peer, id, "accepted connection");

        tokio::task::spawn_local(pump(stream, tunnel.clone(), id, link, config));
    }
}

/// Connects a server Task to the egress target and pumps it. On connect failure the peer is sent
/// the close signal.
pub async fn run_egress(
    target: SocketAddr,
    tunnel: Rc<RefCell<dyn Tunnel>>,
    id: SessionId,
    link: Rc<Link>,
    config: MuxConfig,
    metrics: Metrics,
) {
    let connect = tokio::time::timeout(config.connect_timeout, TcpStream::connect(target)).await;
    let stream = match connect {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            tracing::warn!(id, %target, "egress connect failed: {err}");
            metrics.egress_connect_failed();
            close_quietly(&tunnel, id);
            return;
        }
        Err(_) => {
            tracing::warn!(id, %target, "egress connect timed out");
            metrics.egress_connect_failed();
            close_quietly(&tunnel, id);
            return;
        }
    };
    if let Err(err) = stream.set_nodelay(true) {
        tracing::debug!(id, "failed to set TCP_NODELAY: {err}");
    }
    tracing::debug!(id, %target, "egress connected");

    pump(stream, tunnel, id, link, config).await;
}

/// Moves bytes both ways until the session is over, then flushes and shuts down the stream.
///
/// Local EOF becomes the close signal once every staged byte is in the session. The pump finishes
/// when the peer closed or the session was removed, after the outbound buffer has drained.
pub async fn pump(
    mut stream: TcpStream,
    tunnel: Rc<RefCell<dyn Tunnel>>,
    id: SessionId,
    link: Rc<Link>,
    config: MuxConfig,
) {
    let mut inbound = Buffer::with_capacity(config.buffer_size);
    let mut eof = false;
    let mut close_sent = false;

    // Retries writes the session pushed back on.
    let mut retry = tokio::time::interval(config.tick_interval);
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if !inbound.is_empty() {
            let res = tunnel.borrow_mut().write(id, inbound.head());
            match res {
                Ok(n) => {
                    if inbound.remove(n).is_err() {
                        break;
                    }
                }
                Err(TunnelError::Backpressure) => {}
                Err(err) => {
                    tracing::debug!(id, "tunnel write failed: {err}");
                    break;
                }
            }
        }

        if eof && inbound.is_empty() && !close_sent {
            close_sent = true;
            if let Err(err) = tunnel.borrow_mut().close_session(id) {
                tracing::debug!(id, "close failed: {err}");
                break;
            }
        }

        let (want_write, finished) = {
            let state = link.state.borrow();
            let drained = state.outbound.is_empty();
            (!drained, drained && (state.remote_closed || state.detached))
        };
        if finished {
            break;
        }
        let want_read = !eof && !inbound.is_full();
        let backlog = !inbound.is_empty();

        tokio::select! {
            res = stream.readable(), if want_read => {
                if let Err(err) = res {
                    tracing::debug!(id, "tcp readiness failed: {err}");
                    break;
                }
                match stream.try_read(inbound.tail_mut()) {
                    Ok(0) => {
                        tracing::debug!(id, "local eof");
                        eof = true;
                    }
                    Ok(n) => {
                        if inbound.commit(n).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        tracing::debug!(id, "tcp read failed: {err}");
                        break;
                    }
                }
            }
            res = stream.writable(), if want_write => {
                if let Err(err) = res {
                    tracing::debug!(id, "tcp readiness failed: {err}");
                    break;
                }
                let mut state = link.state.borrow_mut();
                match stream.try_write(state.outbound.head()) {
                    Ok(n) => {
                        if state.outbound.remove(n).is_err() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        tracing::debug!(id, "tcp write failed: {err}");
                        break;
                    }
                }
            }
            _ = link.wake.notified() => {}
            _ = retry.tick(), if backlog => {}
        }
    }

    let (remote_closed, detached) = {
        let mut state = link.state.borrow_mut();
        state.stream_gone = true;
        (state.remote_closed, state.detached)
    };
    if remote_closed || detached {
        if let Err(err) = stream.shutdown().await {
            tracing::trace!(id, "tcp shutdown failed: {err}");
        }
    } else if !close_sent {
        // The stream failed; let the peer know.
        close_quietly(&tunnel, id);
    }
    tracing::debug!(id, "pump finished");
}

fn close_quietly(tunnel: &Rc<RefCell<dyn Tunnel>>, id: SessionId) {
    if let Err(err) = tunnel.borrow_mut().close_session(id) {
        tracing::trace!(id, "close failed: {err}");
    }
}
