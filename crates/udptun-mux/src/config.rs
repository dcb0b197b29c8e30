use std::time::Duration;

use crate::{buffer::DEFAULT_BUFFER_SIZE, engine::EngineConfig, engine::MAX_FRAGMENT};

/// Tuning shared by [`crate::TunnelClient`], [`crate::TunnelServer`] and the TCP bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxConfig {
    /// Period of the update tick that drives every conversation's timers.
    pub tick_interval: Duration,
    /// Capacity of each per-direction staging buffer.
    pub buffer_size: usize,
    /// Writes are split into chunks of at most this many bytes.
    pub max_fragment: usize,
    /// Id allocation gives up after this many collisions.
    pub id_attempts: u32,
    /// A locally closed session is removed after this long even if the peer never acknowledged
    /// the close signal.
    pub close_linger: Duration,
    /// Server endpoints without sessions are evicted after this much inactivity.
    pub endpoint_idle_timeout: Duration,
    /// Timeout for each server Task's outbound TCP connect.
    pub connect_timeout: Duration,
    pub engine: EngineConfig,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(20),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_fragment: MAX_FRAGMENT,
            id_attempts: 10,
            close_linger: Duration::from_secs(30),
            endpoint_idle_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(5),
            engine: EngineConfig::default(),
        }
    }
}
