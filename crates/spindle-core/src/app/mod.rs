//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせて queue / stream / throttler を実装します。
//!
//! # 主要コンポーネント
//! - **LeaseLock**: ストア上の TTL 付きロック
//! - **FifoQueue**: list ベースの単純なキュー
//! - **SortedQueue**: priority queue（retry, crash recovery, panic 境界）
//! - **stream**: consumer group（ack 先行、再 append による retry）
//! - **Throttler**: credit によるペース制御
//! - **lifecycle**: shutdown signal, WorkerPool, SyncGroup

pub mod fifo;
pub mod lifecycle;
pub mod lock;
pub mod sorted;
pub mod stream;
pub mod throttler;

// 主要な型を再エクスポート
pub use self::fifo::{EnqueueReport, FifoConsumerOptions, FifoHandler, FifoQueue};
pub use self::lifecycle::{Completion, DoneGuard, Shutdown, ShutdownSignal, SyncGroup, WorkerPool};
pub use self::lock::{Lease, LeaseLock};
pub use self::sorted::{
    BatchOutcome, FailureHandler, RecoveryOutcome, SortedHandler, SortedQueue, SortedQueueOptions,
};
pub use self::stream::{StreamConsumerOptions, StreamHandler};
pub use self::throttler::{ThrottleError, Throttler, ThrottlerOptions, ThrottlerState};
