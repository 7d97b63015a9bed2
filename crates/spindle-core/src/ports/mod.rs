//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! engine は共有ストアへのアクセスをすべて [`Store`] 経由で行います。
//!
//! # 実装
//! - `impls::RedisStore`: 本番用
//! - `impls::InMemoryStore`: テスト・開発用

pub mod store;

pub use self::store::{Store, StoreError, StreamMessage};
