use std::time::Duration;

/// Tunables for the interception layer, read-only after construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdempotencyOptions {
    acquisition_timeout: Duration,
    require_volume: bool,
}

impl IdempotencyOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounded wait for a volume's serial-access lock.
    /// Zero, the default, makes acquisition a non-blocking attempt.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.acquisition_timeout = timeout;
        self
    }

    /// Require volumes to exist before operating on them: delete, publish and
    /// unpublish verify existence up front and reply with
    /// `VOLUME_DOES_NOT_EXIST` instead of reaching the service.
    pub fn with_require_volume(mut self, require_volume: bool) -> Self {
        self.require_volume = require_volume;
        self
    }

    pub fn acquisition_timeout(&self) -> Duration {
        self.acquisition_timeout
    }

    pub fn require_volume(&self) -> bool {
        self.require_volume
    }
}
