//! Reference identifiers.
//!
//! Every stored entry body lives under a reference URI of the form
//! `gid://<scope>/<uuid>`. The scope is usually the queue name, but callers
//! may nest several segments (`gid://users/import/<uuid>`).
//!
//! ## なぜ URI なのか
//! - キー空間の衝突を避ける（queue 名がそのまま名前空間になる）
//! - prefix だけで「engine が作った参照か」を判定できる（poison 検出）

use uuid::Uuid;

/// URI scheme every reference identifier starts with.
pub const URI_SCHEME: &str = "gid://";

/// Build `gid://<kind1>/<kind2>/.../<uuid>`.
pub fn new_uri(kinds: &[&str]) -> String {
    format!("{URI_SCHEME}{}/{}", kinds.join("/"), Uuid::new_v4())
}

/// Reference for an entry owned by `queue`.
pub fn queue_uri(queue: &str) -> String {
    new_uri(&[queue])
}

/// Anything not starting with `gid://` is treated as poison.
pub fn is_valid_uri(candidate: &str) -> bool {
    candidate.starts_with(URI_SCHEME)
}
