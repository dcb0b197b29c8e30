use tokio::time::Instant;

/// Millisecond clock fed to every conversation's `update`.
///
/// The engine only compares timestamps with wrapping arithmetic, so truncating to `u32` is fine.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Clock {
    start: Instant,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub(crate) fn now_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }
}
