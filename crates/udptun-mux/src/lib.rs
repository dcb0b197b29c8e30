#![forbid(unsafe_code)]

//! Multiplexes many TCP byte streams over one reliable UDP transport.
//!
//! Every stream is a session backed by its own KCP conversation; the conversation id in each
//! datagram's header is the demultiplexing key. [`TunnelClient`] talks to a single server and
//! opens sessions locally. [`TunnelServer`] accepts datagrams from any number of peers, keeps an
//! [`Endpoint`] per source address and bridges each conversation a peer opens to a new TCP
//! connection.
//!
//! Everything runs on one thread: state is shared through `Rc<RefCell<..>>`, borrowed only
//! between awaits, and the tasks are spawned with `spawn_local`. A periodic tick drives the
//! engines' timers, forwards deferred data and retires closed sessions.

pub mod bridge;
pub mod buffer;
mod client;
mod clock;
pub mod config;
pub mod engine;
mod error;
pub mod metrics;
mod output;
mod server;
mod session;
mod socket;
pub mod tunnel;

pub use bridge::serve_listener;
pub use buffer::{Buffer, BufferError};
pub use client::TunnelClient;
pub use config::MuxConfig;
pub use engine::{EngineConfig, EngineError};
pub use error::{Error, TunnelError};
pub use metrics::{Metrics, MetricsSnapshot};
pub use server::{Endpoint, TunnelServer};
pub use tunnel::{Callbacks, DeliveryError, SessionHandler, SessionId, Tunnel};
