use std::{
    cell::RefCell,
    collections::{hash_map::Entry, HashMap},
    net::SocketAddr,
    rc::Rc,
};

use tokio::{
    net::UdpSocket,
    time::{Instant, MissedTickBehavior},
};

use crate::{
    bridge::{self, BridgeHandler, Link},
    clock::Clock,
    config::MuxConfig,
    engine::{conversation_id, opens_conversation},
    metrics::Metrics,
    output::DatagramOutput,
    session::{Session, SessionTable},
    socket,
    tunnel::{SessionHandler, SessionId, Tunnel},
    Error, TunnelError,
};

/// Server side of the tunnel: one UDP socket shared by every peer.
///
/// Each source address gets its own [`Endpoint`], so the same conversation id arriving from two
/// peers names two unrelated Tasks. A Task is created when a peer opens a conversation and bridges
/// it to a fresh TCP connection to the configured target.
pub struct TunnelServer {
    config: MuxConfig,
    socket: Option<Rc<UdpSocket>>,
    target: Option<SocketAddr>,
    endpoints: HashMap<SocketAddr, Rc<RefCell<Endpoint>>>,
    clock: Clock,
    metrics: Metrics,
}

impl TunnelServer {
    pub fn new(config: MuxConfig) -> Self {
        Self::with_metrics(config, Metrics::new())
    }

    pub fn with_metrics(config: MuxConfig, metrics: Metrics) -> Self {
        Self {
            config,
            socket: None,
            target: None,
            endpoints: HashMap::new(),
            clock: Clock::new(),
            metrics,
        }
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.clone()
    }

    pub fn bind_listen(&mut self, addr: SocketAddr) -> Result<(), Error> {
        let socket = socket::bind_udp(addr)?;
        tracing::debug!(addr = %socket.local_addr()?, "server socket bound");
        self.socket = Some(Rc::new(socket));
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        let socket = self.socket.as_ref().ok_or(Error::NotBound)?;
        Ok(socket.local_addr()?)
    }

    /// Resolves the egress target once. Without a target, opening datagrams are dropped.
    pub async fn set_remote_host(&mut self, host: &str, service: &str) -> Result<SocketAddr, Error> {
        let local = match &self.socket {
            Some(socket) => Some(socket.local_addr()?),
            None => None,
        };
        let target = socket::resolve(host, service, local).await?;
        tracing::info!(%target, "egress target set");
        self.target = Some(target);
        Ok(target)
    }

    pub fn target(&self) -> Option<SocketAddr> {
        self.target
    }

    /// Event loop: datagrams from any peer plus the periodic update tick.
    ///
    /// Spawns one local task per egress connection, so this must run inside a
    /// [`tokio::task::LocalSet`].
    pub async fn run(mut self) -> Result<(), Error> {
        let socket = self.socket.clone().ok_or(Error::NotBound)?;

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            tokio::select! {
                res = socket.recv_from(&mut buf) => match res {
                    Ok((n, peer)) => self.handle_datagram(peer, &buf[..n]),
                    Err(err) => tracing::debug!("udp recv failed: {err}"),
                },
                _ = ticker.tick() => self.update(),
            }
        }
    }

    fn handle_datagram(&mut self, peer: SocketAddr, datagram: &[u8]) {
        self.metrics.datagram_rx(datagram.len());

        let id = match conversation_id(datagram) {
            Some(0) | None => {
                tracing::trace!(%peer, len = datagram.len(), "dropping datagram without conversation");
                self.metrics.datagram_dropped();
                return;
            }
            Some(id) => id,
        };

        let Some(target) = self.target else {
            tracing::debug!(%peer, id, "no egress target; dropping");
            self.metrics.datagram_dropped();
            return;
        };

        let Some(endpoint) = self.endpoint_for(peer, datagram) else {
            tracing::debug!(%peer, id, "dropping datagram from unknown peer");
            self.metrics.datagram_dropped();
            return;
        };

        let mut ep = endpoint.borrow_mut();
        ep.last_activity = Instant::now();

        if !ep.sessions.contains(id) {
            if !opens_conversation(datagram) {
                tracing::debug!(%peer, id, "dropping datagram for finished task");
                self.metrics.datagram_dropped();
                return;
            }
            let link = Link::new(self.config.buffer_size);
            let handler = Box::new(BridgeHandler::new(link.clone()));
            if !ep.insert_session(id, handler) {
                self.metrics.datagram_dropped();
                return;
            }
            tracing::debug!(%peer, id, %target, "task opened");

            let tunnel: Rc<RefCell<dyn Tunnel>> = endpoint.clone();
            tokio::task::spawn_local(bridge::run_egress(
                target,
                tunnel,
                id,
                link,
                self.config,
                self.metrics.clone(),
            ));
        }

        let Some(session) = ep.sessions.get_mut(id) else {
            return;
        };
        if let Err(err) = session.input(datagram) {
            tracing::debug!(%peer, id, "engine rejected datagram: {err}");
            self.metrics.datagram_dropped();
            return;
        }
        session.forward(&self.metrics);
    }

    /// The endpoint for `peer`, created when the datagram could open a Task.
    fn endpoint_for(&mut self, peer: SocketAddr, datagram: &[u8]) -> Option<Rc<RefCell<Endpoint>>> {
        match self.endpoints.entry(peer) {
            Entry::Occupied(entry) => Some(entry.get().clone()),
            Entry::Vacant(entry) => {
                if !opens_conversation(datagram) {
                    return None;
                }
                let socket = self.socket.clone()?;
                tracing::debug!(%peer, "new peer");
                self.metrics.endpoint_opened();
                let endpoint = Endpoint::new(peer, socket, self.config, self.metrics.clone());
                Some(entry.insert(Rc::new(RefCell::new(endpoint))).clone())
            }
        }
    }

    fn update(&mut self) {
        let now = Instant::now();
        let now_ms = self.clock.now_ms();
        let config = self.config;
        let metrics = &self.metrics;

        self.endpoints.retain(|peer, endpoint| {
            let mut ep = endpoint.borrow_mut();
            ep.sessions.tick(now, now_ms, &config);
            let idle = now.saturating_duration_since(ep.last_activity) >= config.endpoint_idle_timeout;
            if ep.sessions.is_empty() && idle {
                tracing::debug!(%peer, "evicting idle peer");
                metrics.endpoint_evicted();
                return false;
            }
            true
        });
    }
}

/// One remote peer of a [`TunnelServer`] and the Tasks it opened.
pub struct Endpoint {
    peer: SocketAddr,
    socket: Rc<UdpSocket>,
    sessions: SessionTable<DatagramOutput>,
    config: MuxConfig,
    metrics: Metrics,
    last_activity: Instant,
}

impl Endpoint {
    fn new(peer: SocketAddr, socket: Rc<UdpSocket>, config: MuxConfig, metrics: Metrics) -> Self {
        Self {
            peer,
            socket,
            sessions: SessionTable::new(metrics.clone()),
            config,
            metrics,
            last_activity: Instant::now(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn insert_session(&mut self, id: SessionId, handler: Box<dyn SessionHandler>) -> bool {
        let output = DatagramOutput::to_peer(self.socket.clone(), self.peer, self.metrics.clone());
        match Session::new(id, output, handler, &self.config) {
            Ok(session) => {
                self.sessions.insert(session);
                true
            }
            Err(err) => {
                tracing::warn!(peer = %self.peer, id, "failed to create engine: {err}");
                false
            }
        }
    }
}

impl Tunnel for Endpoint {
    /// Always `None`: ids are allocated by the client, and a client drops datagrams for sessions
    /// it did not open. Tasks appear only when the peer opens a conversation.
    fn new_session(&mut self, _handler: Box<dyn SessionHandler>) -> Option<SessionId> {
        None
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
