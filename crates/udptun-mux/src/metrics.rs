use std::{
    fmt::Write,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

#[derive(Clone, Default)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct MetricsInner {
    // Sessions
    sessions_active: AtomicU64,
    sessions_total: AtomicU64,

    // Server peers
    endpoints_active: AtomicU64,

    // Datagrams/bytes
    datagrams_rx_total: AtomicU64,
    datagrams_tx_total: AtomicU64,
    bytes_rx_total: AtomicU64,
    bytes_tx_total: AtomicU64,
    datagrams_dropped_total: AtomicU64,
    send_fail_total: AtomicU64,

    // Delivery toward local sockets
    delivery_fail_total: AtomicU64,
    egress_connect_fail_total: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub sessions_active: u64,
    pub sessions_total: u64,
    pub endpoints_active: u64,
    pub datagrams_rx_total: u64,
    pub datagrams_tx_total: u64,
    pub bytes_rx_total: u64,
    pub bytes_tx_total: u64,
    pub datagrams_dropped_total: u64,
    pub send_fail_total: u64,
    pub delivery_fail_total: u64,
    pub egress_connect_fail_total: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_opened(&self) {
        self.inner.sessions_total.fetch_add(1, Ordering::Relaxed);
        self.inner.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.inner.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn endpoint_opened(&self) {
        self.inner.endpoints_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn endpoint_evicted(&self) {
        self.inner.endpoints_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn datagram_rx(&self, bytes: usize) {
        self.inner.datagrams_rx_total.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_rx_total
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn datagram_tx(&self, bytes: usize) {
        self.inner.datagrams_tx_total.fetch_add(1, Ordering::Relaxed);
        self.inner
            .bytes_tx_total
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn datagram_dropped(&self) {
        self.inner
            .datagrams_dropped_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_failed(&self) {
        self.inner.send_fail_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_failed(&self) {
        self.inner
            .delivery_fail_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn egress_connect_failed(&self) {
        self.inner
            .egress_connect_fail_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);
        MetricsSnapshot {
            sessions_active: load(&self.inner.sessions_active),
            sessions_total: load(&self.inner.sessions_total),
            endpoints_active: load(&self.inner.endpoints_active),
            datagrams_rx_total: load(&self.inner.datagrams_rx_total),
            datagrams_tx_total: load(&self.inner.datagrams_tx_total),
            bytes_rx_total: load(&self.inner.bytes_rx_total),
            bytes_tx_total: load(&self.inner.bytes_tx_total),
            datagrams_dropped_total: load(&self.inner.datagrams_dropped_total),
            send_fail_total: load(&self.inner.send_fail_total),
            delivery_fail_total: load(&self.inner.delivery_fail_total),
            egress_connect_fail_total: load(&self.inner.egress_connect_fail_total),
        }
    }

    pub fn render_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();

        push_gauge(&mut out, "udptun_sessions_active", s.sessions_active);
        push_counter(&mut out, "udptun_sessions_total", s.sessions_total);

        push_gauge(&mut out, "udptun_endpoints_active", s.endpoints_active);

        push_counter(&mut out, "udptun_datagrams_rx_total", s.datagrams_rx_total);
        push_counter(&mut out, "udptun_datagrams_tx_total", s.datagrams_tx_total);
        push_counter(&mut out, "udptun_bytes_rx_total", s.bytes_rx_total);
        push_counter(&mut out, "udptun_bytes_tx_total", s.bytes_tx_total);
        push_counter(
            &mut out,
            "udptun_datagrams_dropped_total",
            s.datagrams_dropped_total,
        );
        push_counter(&mut out, "udptun_send_fail_total", s.send_fail_total);

        push_counter(&mut out, "udptun_delivery_fail_total", s.delivery_fail_total);
        push_counter(
            &mut out,
            "udptun_egress_connect_fail_total",
            s.egress_connect_fail_total,
        );

        out
    }
}

fn push_gauge(out: &mut String, name: &str, val: u64) {
    push_metric(out, "gauge", name, val);
}

fn push_counter(out: &mut String, name: &str, val: u64) {
    push_metric(out, "counter", name, val);
}

fn push_metric(out: &mut String, kind: &str, name: &str, val: u64) {
    // Writing to a String cannot fail.
    let _ = writeln!(out, "# TYPE {name} {kind}\n{name} {val}");
}
