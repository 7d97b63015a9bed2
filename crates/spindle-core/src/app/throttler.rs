//! Throttler - credit ベースの実行ペース制御
//!
//! # 実装詳細
//! - credit は `[0, 100]`、背景 task が 500ms ごとに `[0, 15)` を加算（100 で頭打ち）
//! - `work`: read lock で `credit >= cost` を確認、足りなければ 2 秒待って再確認
//! - 通過後は write lock を保持したまま 1 秒の実行を模擬し、cost を差し引く
//!
//! # 既知の競合
//! 確認（read lock）と差し引き（write lock）は別々に取るので、複数の呼び出しが
//! 同時に確認を通ると credit は負になりうる。

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::lifecycle::ShutdownSignal;

pub const MAX_CREDIT: f64 = 100.0;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ThrottleError {
    #[error("operation cancelled after {elapsed:?}")]
    Cancelled { elapsed: Duration },

    #[error("invalid throttler state: {0}")]
    InvalidState(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThrottlerOptions {
    pub replenish_interval: Duration,
    /// Upper bound (exclusive) of one replenishment.
    pub max_increment: f64,
    /// Upper bound (exclusive) of the random cost used by [`Throttler::work`].
    pub max_cost: f64,
    /// Wait between two admission checks.
    pub admission_wait: Duration,
    /// Simulated execution time of one unit of work.
    pub execution: Duration,
    /// Granularity of the execution busy-check.
    pub busy_check: Duration,
}

impl Default for ThrottlerOptions {
    fn default() -> Self {
        Self {
            replenish_interval: Duration::from_millis(500),
            max_increment: 15.0,
            max_cost: 100.0,
            admission_wait: Duration::from_secs(2),
            execution: Duration::from_secs(1),
            busy_check: Duration::from_millis(1),
        }
    }
}

/// Serialized throttler state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottlerState {
    pub credit: f64,
    #[serde(default)]
    pub last_hit: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Throttler {
    state: Arc<RwLock<ThrottlerState>>,
    shutdown: ShutdownSignal,
    options: ThrottlerOptions,
}

impl Throttler {
    pub fn new(shutdown: ShutdownSignal, options: ThrottlerOptions) -> Self {
        Self::with_state(
            shutdown,
            options,
            ThrottlerState {
                credit: MAX_CREDIT,
                last_hit: None,
            },
        )
    }

    /// Restore from [`serialize`](Self::serialize) output. Empty input starts
    /// with full credit.
    pub fn from_state(
        shutdown: ShutdownSignal,
        options: ThrottlerOptions,
        serialized: &str,
    ) -> Result<Self, ThrottleError> {
        if serialized.trim().is_empty() {
            return Ok(Self::new(shutdown, options));
        }
        let mut state: ThrottlerState = serde_json::from_str(serialized)
            .map_err(|e| ThrottleError::InvalidState(e.to_string()))?;
        state.credit = state.credit.clamp(0.0, MAX_CREDIT);
        Ok(Self::with_state(shutdown, options, state))
    }

    fn with_state(shutdown: ShutdownSignal, options: ThrottlerOptions, state: ThrottlerState) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
            shutdown,
            options,
        }
    }

    /// Start the replenishment task. It stops on shutdown.
    pub fn initialize(&self) -> JoinHandle<()> {
        let state = Arc::clone(&self.state);
        let mut shutdown = self.shutdown.clone();
        let interval = self.options.replenish_interval;
        let max_increment = self.options.max_increment;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let increment = random_below(max_increment);
                let mut state = state.write().await;
                state.credit = (state.credit + increment).min(MAX_CREDIT);
            }
            debug!("throttler replenishment stopped");
        })
    }

    /// Run one unit of work with a random cost in `[0, max_cost)`.
    pub async fn work(&self, title: &str) -> Result<Duration, ThrottleError> {
        let cost = random_below(self.options.max_cost);
        self.work_with_cost(title, cost).await
    }

    /// Wait for `cost` credit, simulate execution, then deduct it.
    /// Returns the time spent since the call.
    pub async fn work_with_cost(&self, title: &str, cost: f64) -> Result<Duration, ThrottleError> {
        let started = Instant::now();
        let mut shutdown = self.shutdown.clone();
        let cancelled = || ThrottleError::Cancelled {
            elapsed: started.elapsed(),
        };

        loop {
            if shutdown.is_shutdown() {
                return Err(cancelled());
            }
            let credit = self.state.read().await.credit;
            if credit >= cost {
                debug!(title, cost, credit, "ready credit");
                break;
            }
            debug!(title, cost, credit, "waiting for credits");
            tokio::select! {
                _ = shutdown.wait() => return Err(cancelled()),
                _ = tokio::time::sleep(self.options.admission_wait) => {}
            }
        }

        // 実行中は write lock を保持（admitted work は 1 つずつ）
        let mut state = self.state.write().await;
        let execution_started = Instant::now();
        while execution_started.elapsed() < self.options.execution {
            if shutdown.is_shutdown() {
                return Err(cancelled());
            }
            tokio::time::sleep(self.options.busy_check).await;
        }
        state.credit -= cost;
        state.last_hit = Some(Utc::now());
        info!(title, cost, credit = state.credit, "work done");
        Ok(started.elapsed())
    }

    pub async fn credit(&self) -> f64 {
        self.state.read().await.credit
    }

    pub async fn serialize(&self) -> String {
        let state = self.state.read().await;
        serde_json::to_string(&*state).unwrap_or_default()
    }
}

fn random_below(upper: f64) -> f64 {
    if upper <= 0.0 {
        return 0.0;
    }
    rand::thread_rng().gen_range(0.0..upper)
}
