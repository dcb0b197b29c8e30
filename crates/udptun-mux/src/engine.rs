//! Reliable-transport engine wrapper.
//!
//! Every logical stream is one KCP conversation. The multiplexer only talks to the engine through
//! [`Conversation`], which narrows `kcp::Kcp` down to the operations the session layer needs and
//! adds the two things the raw engine does not expose: a bounded send queue (so writers see
//! backpressure) and an explicit [`Conversation::pending`] query for the close handshake.
//!
//! KCP segment header (all integer fields little-endian):
//!
//! ```text
//! 0        4     5     6        8        12       16       20       24
//! +--------+-----+-----+--------+--------+--------+--------+--------+
//! |  conv  | cmd | frg |  wnd   |   ts   |   sn   |  una   |  len   |
//! +--------+-----+-----+--------+--------+--------+--------+--------+
//! | payload (len bytes)                                              |
//! +------------------------------------------------------------------+
//! ```

use std::io::Write;

use kcp::Kcp;
use thiserror::Error;

/// Length of one KCP segment header.
pub const SEGMENT_HEADER_LEN: usize = 24;

/// Practical per-datagram payload ceiling; writes are fragmented to this size.
pub const MAX_FRAGMENT: usize = 1400;

const CMD_PUSH: u8 = 81;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum datagram size emitted by the engine.
    pub mtu: usize,
    pub send_window: u16,
    pub recv_window: u16,
    pub nodelay: bool,
    /// Internal flush interval. Matches the tick so every update flushes.
    pub interval_ms: u32,
    /// Fast-resend threshold (0 disables fast resend).
    pub fast_resend: u32,
    pub no_congestion_control: bool,
    /// Unacknowledged segments a conversation may hold before `send` reports backpressure.
    pub max_pending_segments: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mtu: MAX_FRAGMENT,
            send_window: 128,
            recv_window: 128,
            nodelay: false,
            interval_ms: 20,
            fast_resend: 0,
            no_congestion_control: false,
            max_pending_segments: 256,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("send queue full ({pending} segments pending)")]
    SendQueueFull { pending: usize },

    #[error("kcp engine error: {0:?}")]
    Kcp(kcp::Error),
}

impl From<kcp::Error> for EngineError {
    fn from(err: kcp::Error) -> Self {
        EngineError::Kcp(err)
    }
}

/// Result of pulling one reassembled chunk out of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recv {
    /// `n` application bytes were written to the front of the caller's buffer.
    Data(usize),
    /// The peer sent the zero-length close signal.
    Close,
    /// No complete chunk is ready.
    NoData,
    /// The next chunk is larger than the caller's buffer.
    NeedsMoreSpace,
}

/// One reliable conversation. Dropping it releases the engine.
pub struct Conversation<O: Write> {
    kcp: Kcp<O>,
    max_pending: usize,
}

impl<O: Write> Conversation<O> {
    pub fn new(conv: u32, output: O, cfg: &EngineConfig) -> Result<Self, EngineError> {
        let mut kcp = Kcp::new(conv, output);
        kcp.set_mtu(cfg.mtu)?;
        kcp.set_wndsize(cfg.send_window, cfg.recv_window);
        kcp.set_nodelay(
            cfg.nodelay,
            cfg.interval_ms as i32,
            cfg.fast_resend as i32,
            cfg.no_congestion_control,
        );
        Ok(Self {
            kcp,
            max_pending: cfg.max_pending_segments,
        })
    }

    pub fn conv(&self) -> u32 {
        self.kcp.conv()
    }

    /// Queues application bytes. Fails without queueing anything once the pending limit is hit.
    pub fn send(&mut self, bytes: &[u8]) -> Result<usize, EngineError> {
        let pending = self.kcp.wait_snd();
        if pending >= self.max_pending {
            return Err(EngineError::SendQueueFull { pending });
        }
        Ok(self.kcp.send(bytes)?)
    }

    /// Queues the zero-length close signal. Not subject to the pending limit.
    pub fn send_close(&mut self) -> Result<(), EngineError> {
        self.kcp.send(&[])?;
        Ok(())
    }

    pub fn input(&mut self, datagram: &[u8]) -> Result<(), EngineError> {
        self.kcp.input(datagram)?;
        Ok(())
    }

    pub fn recv(&mut self, buf: &mut [u8]) -> Recv {
        match self.kcp.recv(buf) {
            Ok(0) => Recv::Close,
            Ok(n) => Recv::Data(n),
            Err(kcp::Error::UserBufTooSmall) => Recv::NeedsMoreSpace,
            Err(kcp::Error::RecvQueueEmpty) | Err(kcp::Error::ExpectingFragment) => Recv::NoData,
            Err(err) => {
                tracing::debug!(conv = self.conv(), "kcp recv failed: {err:?}");
                Recv::NoData
            }
        }
    }

    /// Size of the next complete chunk, if one is ready. `Some(0)` is a pending close signal.
    pub fn peek_size(&self) -> Option<usize> {
        self.kcp.peeksize().ok()
    }

    /// Drives retransmission timers; may emit datagrams through the output synchronously.
    pub fn update(&mut self, now_ms: u32) -> Result<(), EngineError> {
        self.kcp.update(now_ms)?;
        Ok(())
    }

    /// Segments queued or in flight that the peer has not acknowledged yet.
    pub fn pending(&self) -> usize {
        self.kcp.wait_snd()
    }
}

/// Extracts the conversation id from a raw datagram without needing a [`Conversation`].
pub fn conversation_id(datagram: &[u8]) -> Option<u32> {
    if datagram.len() < SEGMENT_HEADER_LEN {
        return None;
    }
    Some(u32::from_le_bytes([
        datagram[0],
        datagram[1],
        datagram[2],
        datagram[3],
    ]))
}

/// Returns true when the datagram carries the first data segment (PUSH, sn 0) of its
/// conversation.
///
/// Acknowledgements and retransmissions of later segments for a conversation the receiver has
/// already torn down must not bring it back to life.
pub fn opens_conversation(datagram: &[u8]) -> bool {
    let mut rest = datagram;
    while rest.len() >= SEGMENT_HEADER_LEN {
        let cmd = rest[4];
        let sn = u32::from_le_bytes([rest[12], rest[13], rest[14], rest[15]]);
        let len = u32::from_le_bytes([rest[20], rest[21], rest[22], rest[23]]) as usize;
        if cmd == CMD_PUSH && sn == 0 {
            return true;
        }
        let Some(next) = SEGMENT_HEADER_LEN.checked_add(len) else {
            return false;
        };
        if next > rest.len() {
            return false;
        }
        rest = &rest[next..];
    }
    false
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{cell::RefCell, collections::VecDeque, io, rc::Rc};

    /// In-memory output capturing every emitted datagram.
    #[derive(Clone, Default)]
    pub(crate) struct Wire(pub(crate) Rc<RefCell<VecDeque<Vec<u8>>>>);

    impl Write for Wire {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().push_back(buf.to_vec());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Wire {
        pub(crate) fn drain(&self) -> Vec<Vec<u8>> {
            self.0.borrow_mut().drain(..).collect()
        }
    }

    pub(crate) fn pair(conv: u32, cfg: &EngineConfig) -> (Conversation<Wire>, Wire, Conversation<Wire>, Wire) {
        let a_wire = Wire::default();
        let b_wire = Wire::default();
        let a = Conversation::new(conv, a_wire.clone(), cfg).unwrap();
        let b = Conversation::new(conv, b_wire.clone(), cfg).unwrap();
        (a, a_wire, b, b_wire)
    }

    /// Updates one side until it emits at least one datagram.
    ///
    /// A fresh KCP instance starts with an empty congestion window, so its very first flush can
    /// be silent.
    pub(crate) fn emit(conv: &mut Conversation<Wire>, wire: &Wire, now: &mut u32) -> Vec<Vec<u8>> {
        for _ in 0..10 {
            *now += 20;
            conv.update(*now).unwrap();
            let out = wire.drain();
            if !out.is_empty() {
                return out;
            }
        }
        Vec::new()
    }

    /// Runs update rounds, shuttling datagrams both ways, until neither side emits anything.
    pub(crate) fn settle(
        a: &mut Conversation<Wire>,
        a_wire: &Wire,
        b: &mut Conversation<Wire>,
        b_wire: &Wire,
        now: &mut u32,
    ) {
        for _ in 0..200 {
            *now += 20;
            a.update(*now).unwrap();
            b.update(*now).unwrap();
            let to_b = a_wire.drain();
            let to_a = b_wire.drain();
            if to_b.is_empty() && to_a.is_empty() && a.pending() == 0 && b.pending() == 0 {
                return;
            }
            for d in to_b {
                b.input(&d).unwrap();
            }
            for d in to_a {
                a.input(&d).unwrap();
            }
        }
    }

    #[test]
    fn fragmented_message_round_trips() {
        let cfg = EngineConfig::default();
        let (mut a, a_wire, mut b, b_wire) = pair(7, &cfg);
        let mut now = 0;

        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        for chunk in payload.chunks(MAX_FRAGMENT) {
            a.send(chunk).unwrap();
        }
        settle(&mut a, &a_wire, &mut b, &b_wire, &mut now);

        let mut got = Vec::new();
        let mut buf = vec![0u8; 4096];
        loop {
            match b.recv(&mut buf) {
                Recv::Data(n) => got.extend_from_slice(&buf[..n]),
                Recv::NoData => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(got, payload);
        assert_eq!(a.pending(), 0);
    }

    #[test]
    fn close_signal_follows_data() {
        let cfg = EngineConfig::default();
        let (mut a, a_wire, mut b, b_wire) = pair(3, &cfg);
        let mut now = 0;

        a.send(b"last words").unwrap();
        a.send_close().unwrap();
        settle(&mut a, &a_wire, &mut b, &b_wire, &mut now);

        let mut buf = vec![0u8; 64];
        assert_eq!(b.peek_size(), Some(10));
        assert_eq!(b.recv(&mut buf), Recv::Data(10));
        assert_eq!(&buf[..10], b"last words");
        assert_eq!(b.peek_size(), Some(0));
        assert_eq!(b.recv(&mut buf), Recv::Close);
        assert_eq!(b.recv(&mut buf), Recv::NoData);
    }

    #[test]
    fn small_receive_buffer_needs_more_space() {
        let cfg = EngineConfig::default();
        let (mut a, a_wire, mut b, b_wire) = pair(3, &cfg);
        let mut now = 0;

        a.send(&[9u8; 100]).unwrap();
        settle(&mut a, &a_wire, &mut b, &b_wire, &mut now);

        let mut small = [0u8; 10];
        assert_eq!(b.recv(&mut small), Recv::NeedsMoreSpace);
        let mut big = [0u8; 100];
        assert_eq!(b.recv(&mut big), Recv::Data(100));
    }

    #[test]
    fn send_reports_backpressure_at_pending_limit() {
        let cfg = EngineConfig {
            max_pending_segments: 4,
            ..EngineConfig::default()
        };
        let (mut a, _a_wire, _b, _b_wire) = pair(1, &cfg);

        for _ in 0..4 {
            a.send(b"x").unwrap();
        }
        assert!(matches!(
            a.send(b"x"),
            Err(EngineError::SendQueueFull { pending: 4 })
        ));
        // The close signal still gets through.
        a.send_close().unwrap();
        assert_eq!(a.pending(), 5);
    }

    #[test]
    fn input_rejects_foreign_conversation() {
        let cfg = EngineConfig::default();
        let (mut a, a_wire, _b, _b_wire) = pair(1, &cfg);
        let other_wire = Wire::default();
        let mut other = Conversation::new(2, other_wire.clone(), &cfg).unwrap();

        other.send(b"hi").unwrap();
        let datagrams = emit(&mut other, &other_wire, &mut 0);
        assert!(!datagrams.is_empty());
        assert!(a.input(&datagrams[0]).is_err());
        assert!(a_wire.drain().is_empty());
        assert!(a.input(b"short").is_err());
    }

    #[test]
    fn routing_helpers_inspect_headers() {
        let cfg = EngineConfig::default();
        let (mut a, a_wire, mut b, b_wire) = pair(0xdead_beef, &cfg);

        assert_eq!(conversation_id(&[0u8; 10]), None);

        let mut now = 0;
        a.send(b"first").unwrap();
        let first = emit(&mut a, &a_wire, &mut now);
        assert_eq!(conversation_id(&first[0]), Some(0xdead_beef));
        assert!(opens_conversation(&first[0]));

        // The receiver's acknowledgement does not open anything.
        b.input(&first[0]).unwrap();
        let ack = emit(&mut b, &b_wire, &mut now);
        assert!(!opens_conversation(&ack[0]));

        a.input(&ack[0]).unwrap();
        a.send(b"second").unwrap();
        let second = emit(&mut a, &a_wire, &mut now);
        assert!(!opens_conversation(&second[0]));
    }
}
