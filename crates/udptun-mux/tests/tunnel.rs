use std::{
    cell::{Cell, RefCell},
    future::Future,
    net::SocketAddr,
    rc::Rc,
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::LocalSet,
    time::{sleep, timeout},
};
use udptun_mux::{
    serve_listener, Callbacks, EngineConfig, Metrics, MuxConfig, SessionHandler, Tunnel,
    TunnelClient, TunnelError, TunnelServer,
};

const DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Data(Vec<u8>),
    Closed,
}

fn recorder(events: &Rc<RefCell<Vec<Event>>>) -> Box<dyn SessionHandler> {
    let on_read = events.clone();
    let on_close = events.clone();
    Box::new(Callbacks::new(
        move |_, data: &[u8]| {
            on_read.borrow_mut().push(Event::Data(data.to_vec()));
            Ok(())
        },
        move |_| on_close.borrow_mut().push(Event::Closed),
    ))
}

fn received(events: &Rc<RefCell<Vec<Event>>>) -> Vec<u8> {
    events
        .borrow()
        .iter()
        .filter_map(|e| match e {
            Event::Data(d) => Some(d.clone()),
            Event::Closed => None,
        })
        .flatten()
        .collect()
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(DEADLINE, async {
        while !cond() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached before deadline");
}

fn local<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    let set = LocalSet::new();
    async move { set.run_until(fut).await }
}

/// TCP echo service; counts accepted connections.
async fn echo_target() -> (SocketAddr, Rc<Cell<usize>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Rc::new(Cell::new(0));
    let counter = accepted.clone();
    tokio::task::spawn_local(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.set(counter.get() + 1);
            tokio::task::spawn_local(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    (addr, accepted)
}

async fn start_server(target: SocketAddr, config: MuxConfig) -> (SocketAddr, Metrics) {
    let mut server = TunnelServer::new(config);
    server.bind_listen("127.0.0.1:0".parse().unwrap()).unwrap();
    server
        .set_remote_host("127.0.0.1", &target.port().to_string())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    let metrics = server.metrics();
    tokio::task::spawn_local(server.run());
    (addr, metrics)
}

async fn start_client(server: SocketAddr, config: MuxConfig) -> Rc<RefCell<TunnelClient>> {
    let mut client = TunnelClient::new(config);
    client.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    client
        .connect("127.0.0.1", &server.port().to_string())
        .await
        .unwrap();
    let client = Rc::new(RefCell::new(client));
    tokio::task::spawn_local(TunnelClient::run(client.clone()));
    client
}

#[tokio::test]
async fn tcp_stream_round_trips_through_tunnel() {
    local(async {
        let (target, accepted) = echo_target().await;
        let (server_addr, server_metrics) = start_server(target, MuxConfig::default()).await;
        let client = start_client(server_addr, MuxConfig::default()).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        let tunnel: Rc<RefCell<dyn Tunnel>> = client.clone();
        tokio::task::spawn_local(serve_listener(listener, tunnel, MuxConfig::default()));

        let mut app = TcpStream::connect(listen_addr).await.unwrap();
        let payload: Vec<u8> = (0..5000u32).map(|i| (i * 7) as u8).collect();
        app.write_all(&payload).await.unwrap();

        let mut echoed = vec![0u8; payload.len()];
        timeout(DEADLINE, app.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, payload);
        assert_eq!(accepted.get(), 1);

        // Closing the application side tears the session down on both ends.
        drop(app);
        wait_until(|| client.borrow().session_count() == 0).await;
        wait_until(|| server_metrics.snapshot().sessions_active == 0).await;
    })
    .await;
}

#[tokio::test]
async fn close_arrives_after_all_data() {
    local(async {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let reply: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let expected = reply.clone();
        tokio::task::spawn_local(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut hello = [0u8; 5];
            stream.read_exact(&mut hello).await.unwrap();
            assert_eq!(&hello, b"hello");
            stream.write_all(&reply).await.unwrap();
        });

        let (server_addr, server_metrics) = start_server(target, MuxConfig::default()).await;
        let client = start_client(server_addr, MuxConfig::default()).await;

        let events = Rc::new(RefCell::new(Vec::new()));
        let id = client.borrow_mut().new_session(recorder(&events)).unwrap();
        assert_eq!(client.borrow_mut().write(id, b"hello").unwrap(), 5);

        wait_until(|| events.borrow().last() == Some(&Event::Closed)).await;
        let closes = events
            .borrow()
            .iter()
            .filter(|e| **e == Event::Closed)
            .count();
        assert_eq!(closes, 1);
        assert_eq!(received(&events), expected);

        wait_until(|| client.borrow().session_count() == 0).await;
        wait_until(|| server_metrics.snapshot().sessions_active == 0).await;
    })
    .await;
}

#[tokio::test]
async fn same_session_id_from_two_peers_stays_isolated() {
    local(async {
        let (target, accepted) = echo_target().await;
        let (server_addr, server_metrics) = start_server(target, MuxConfig::default()).await;
        let a = start_client(server_addr, MuxConfig::default()).await;
        let b = start_client(server_addr, MuxConfig::default()).await;

        let a_events = Rc::new(RefCell::new(Vec::new()));
        let b_events = Rc::new(RefCell::new(Vec::new()));
        let a_id = a.borrow_mut().new_session(recorder(&a_events)).unwrap();
        let b_id = b.borrow_mut().new_session(recorder(&b_events)).unwrap();
        assert_eq!((a_id, b_id), (1, 1));

        a.borrow_mut().write(a_id, b"from a").unwrap();
        b.borrow_mut().write(b_id, b"from b").unwrap();

        wait_until(|| received(&a_events) == b"from a" && received(&b_events) == b"from b").await;
        assert_eq!(accepted.get(), 2);

        let snapshot = server_metrics.snapshot();
        assert_eq!(snapshot.endpoints_active, 2);
        assert_eq!(snapshot.sessions_active, 2);
    })
    .await;
}

#[tokio::test]
async fn backpressure_yields_short_writes_without_loss() {
    local(async {
        let (target, _) = echo_target().await;
        let (server_addr, _) = start_server(target, MuxConfig::default()).await;
        let config = MuxConfig {
            engine: EngineConfig {
                max_pending_segments: 8,
                ..EngineConfig::default()
            },
            ..MuxConfig::default()
        };
        let client = start_client(server_addr, config).await;

        let events = Rc::new(RefCell::new(Vec::new()));
        let id = client.borrow_mut().new_session(recorder(&events)).unwrap();

        let payload: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 253) as u8).collect();
        let mut offset = 0;
        let mut short_writes = 0;
        timeout(DEADLINE, async {
            while offset < payload.len() {
                let res = client.borrow_mut().write(id, &payload[offset..]);
                match res {
                    Ok(n) => {
                        if n < payload.len() - offset {
                            short_writes += 1;
                        }
                        offset += n;
                    }
                    Err(TunnelError::Backpressure) => short_writes += 1,
                    Err(err) => panic!("unexpected write error: {err}"),
                }
                if offset < payload.len() {
                    sleep(Duration::from_millis(5)).await;
                }
            }
        })
        .await
        .unwrap();
        assert!(short_writes > 0);

        wait_until(|| received(&events).len() == payload.len()).await;
        assert_eq!(received(&events), payload);
    })
    .await;
}

#[tokio::test]
async fn failed_egress_connect_closes_session() {
    local(async {
        // Reserve a port with nothing listening on it.
        let target = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let (server_addr, server_metrics) = start_server(target, MuxConfig::default()).await;
        let client = start_client(server_addr, MuxConfig::default()).await;

        let events = Rc::new(RefCell::new(Vec::new()));
        let id = client.borrow_mut().new_session(recorder(&events)).unwrap();
        client.borrow_mut().write(id, b"anyone there?").unwrap();

        wait_until(|| *events.borrow() == vec![Event::Closed]).await;
        assert_eq!(server_metrics.snapshot().egress_connect_fail_total, 1);
        wait_until(|| client.borrow().session_count() == 0).await;
    })
    .await;
}
