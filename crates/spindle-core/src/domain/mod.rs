//! Domain model: entry shapes, reference identifiers, failure records.
//!
//! - fifo_entry: FIFO queue の entry
//! - sorted_entry: priority queue の entry（retry 回数と失敗履歴を持つ）
//! - stream_entry: consumer group stream の message
//! - failure: failure handler に渡す record
//! - ids: `gid://` 参照 URI
//! - errors: decode エラー（poison）

pub mod errors;
pub mod failure;
pub mod fifo_entry;
pub mod ids;
pub mod sorted_entry;
pub mod stream_entry;

pub use self::errors::CodecError;
pub use self::failure::{FailurePayload, FailureRecord};
pub use self::fifo_entry::FifoEntry;
pub use self::sorted_entry::SortedEntry;
pub use self::stream_entry::StreamEntry;
