use std::time::Duration;

/// Consumer pool settings of a sorted queue.
#[derive(Debug, Clone, PartialEq)]
pub struct SortedQueueOptions {
    /// Retry budget attached to every consumed entry.
    pub max_retries: u32,
    /// Members popped per batch.
    pub consuming: usize,
    /// Workers in the pool.
    pub consumers: usize,
    /// Pause after each pass; pop-min does not block.
    pub poll_interval: Duration,
    /// Pause after a failed read of the queue itself.
    pub error_backoff: Duration,
}

impl Default for SortedQueueOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            consuming: 10,
            consumers: 1,
            poll_interval: Duration::from_millis(100),
            error_backoff: Duration::from_secs(60),
        }
    }
}

impl SortedQueueOptions {
    pub fn normalize(mut self) -> Self {
        self.consuming = self.consuming.max(1);
        self.consumers = self.consumers.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_clamps_counts() {
        let options = SortedQueueOptions {
            consuming: 0,
            consumers: 0,
            ..Default::default()
        }
        .normalize();
        assert_eq!(options.consuming, 1);
        assert_eq!(options.consumers, 1);
        assert_eq!(options.max_retries, 3);
    }
}
