use std::{cell::RefCell, net::SocketAddr, rc::Rc};

use tokio::{
    net::UdpSocket,
    time::{Instant, MissedTickBehavior},
};

use crate::{
    clock::Clock,
    config::MuxConfig,
    engine::conversation_id,
    metrics::Metrics,
    output::DatagramOutput,
    session::{Session, SessionTable},
    socket,
    tunnel::{SessionHandler, SessionId, Tunnel},
    Error, TunnelError,
};

/// Client side of the tunnel: one UDP socket connected to a single server, carrying every locally
/// opened session.
///
/// Sessions are only ever created locally through [`Tunnel::new_session`]; datagrams for unknown
/// conversations are dropped.
pub struct TunnelClient {
    config: MuxConfig,
    socket: Option<Rc<UdpSocket>>,
    remote: Option<SocketAddr>,
    sessions: SessionTable<DatagramOutput>,
    clock: Clock,
    metrics: Metrics,
}

impl TunnelClient {
    pub fn new(config: MuxConfig) -> Self {
        Self::with_metrics(config, Metrics::new())
    }

    pub fn with_metrics(config: MuxConfig, metrics: Metrics) -> Self {
        Self {
            config,
            socket: None,
            remote: None,
            sessions: SessionTable::new(metrics.clone()),
            clock: Clock::new(),
            metrics,
        }
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.clone()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn bind(&mut self, addr: SocketAddr) -> Result<(), Error> {
        let socket = socket::bind_udp(addr)?;
        tracing::debug!(addr = %socket.local_addr()?, "client socket bound");
        self.socket = Some(Rc::new(socket));
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        let socket = self.socket.as_ref().ok_or(Error::NotBound)?;
        Ok(socket.local_addr()?)
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Resolves the server and connects the socket to it. Returns the address actually used.
    pub async fn connect(&mut self, host: &str, service: &str) -> Result<SocketAddr, Error> {
        let socket = self.socket.clone().ok_or(Error::NotBound)?;
        let addr = socket::resolve(host, service, Some(socket.local_addr()?)).await?;
        socket
            .connect(addr)
            .await
            .map_err(|source| Error::Connect { addr, source })?;
        tracing::info!(%addr, "client connected to tunnel server");
        self.remote = Some(addr);
        Ok(addr)
    }

    /// Event loop: incoming datagrams plus the periodic update tick. Never returns `Ok`.
    ///
    /// The client stays shared so the TCP bridge can open sessions while this runs; it is only
    /// borrowed between awaits.
    pub async fn run(this: Rc<RefCell<Self>>) -> Result<(), Error> {
        let (socket, tick_interval) = {
            let client = this.borrow();
            let socket = client.socket.clone().ok_or(Error::NotBound)?;
            if client.remote.is_none() {
                return Err(Error::NotConnected);
            }
            (socket, client.config.tick_interval)
        };

        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            tokio::select! {
                res = socket.recv(&mut buf) => match res {
                    Ok(n) => this.borrow_mut().handle_datagram(&buf[..n]),
                    // ICMP errors from the peer surface here on connected sockets.
                    Err(err) => tracing::debug!("udp recv failed: {err}"),
                },
                _ = ticker.tick() => this.borrow_mut().update(),
            }
        }
    }

    pub(crate) fn handle_datagram(&mut self, datagram: &[u8]) {
        self.metrics.datagram_rx(datagram.len());

        let Some(id) = conversation_id(datagram) else {
            tracing::trace!(len = datagram.len(), "dropping short datagram");
            self.metrics.datagram_dropped();
            return;
        };
        let Some(session) = self.sessions.get_mut(id) else {
            tracing::debug!(id, "dropping datagram for unknown session");
            self.metrics.datagram_dropped();
            return;
        };
        if let Err(err) = session.input(datagram) {
            tracing::debug!(id, "engine rejected datagram: {err}");
            self.metrics.datagram_dropped();
            return;
        }
        session.forward(&self.metrics);
    }

    /// One tick: drive every session and drop the ones that finished closing.
    pub(crate) fn update(&mut self) {
        self.sessions
            .tick(Instant::now(), self.clock.now_ms(), &self.config);
    }
}

impl Tunnel for TunnelClient {
    fn new_session(&mut self, handler: Box<dyn SessionHandler>) -> Option<SessionId> {
        let socket = self.socket.clone()?;
        self.remote?;

        let Some(id) = self.sessions.allocate_id(self.config.id_attempts) else {
            tracing::warn!(live = self.sessions.len(), "no free session id");
            return None;
        };
        let output = DatagramOutput::connected(socket, self.metrics.clone());
        match Session::new(id, output, handler, &self.config) {
            Ok(session) => {
                self.sessions.insert(session);
                Some(id)
            }
            Err(err) => {
                tracing::warn!(id, "failed to create engine: {err}");
                None
            }
        }
    }

    fn remove_session(&mut self, id: SessionId) {
        self.sessions.remove(id);
    }

    fn write(&mut self, id: SessionId, bytes: &[u8]) -> Result<usize, TunnelError> {
        let max_fragment = self.config.max_fragment;
        self.sessions
            .get_mut(id)
            .ok_or(TunnelError::UnknownSession(id))?
            .write(bytes, max_fragment)
    }

    fn close_session(&mut self, id: SessionId) -> Result<(), TunnelError> {
        self.sessions
            .get_mut(id)
            .ok_or(TunnelError::UnknownSession(id))?
            .close(Instant::now())
    }
}
