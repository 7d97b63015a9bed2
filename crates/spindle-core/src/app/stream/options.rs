use std::time::Duration;

/// StreamConsumerOptions は consumer group worker の設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConsumerOptions {
    /// Workers in the pool.
    pub counts: usize,
    /// Retry budget attached to every delivered entry.
    pub retries: u32,
    /// Messages per group read.
    pub read_count: usize,
    /// `None` blocks until a message arrives.
    pub block: Option<Duration>,
    /// Pause after a failed read.
    pub error_backoff: Duration,
}

impl StreamConsumerOptions {
    pub fn new(counts: usize, retries: u32) -> Self {
        Self {
            counts,
            retries,
            ..Self::default()
        }
    }

    pub fn normalize(mut self) -> Self {
        self.counts = self.counts.max(1);
        self.read_count = self.read_count.max(1);
        self
    }
}

impl Default for StreamConsumerOptions {
    fn default() -> Self {
        Self {
            counts: 1,
            retries: 5,
            read_count: 2,
            block: None,
            error_backoff: Duration::from_secs(5),
        }
    }
}
