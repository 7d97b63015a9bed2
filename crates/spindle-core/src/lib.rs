//! spindle-core
//!
//! Background task engine over a shared store (Redis).
//!
//! # モジュール構成
//! - **domain**: entry の形（FIFO / sorted / stream）、参照 URI、failure record
//! - **ports**: 抽象化レイヤー（Store）
//! - **app**: queue / stream consumer group / throttler / lifecycle
//! - **impls**: Store の実装（RedisStore, InMemoryStore）
//! - **config**: 環境変数からの設定
//! - **error**: crate 共通のエラー型

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod ports;

pub use self::config::{ConfigError, EngineConfig};
pub use self::error::{EngineError, HandlerError};
