//! # Vantiq SDK
//!
//! An async Rust client for the Vantiq platform's HTTP and WebSocket API. It
//! supports:
//!
//! - Authentication with username/password or an externally issued token
//! - Resource queries and writes (`select`, `count`, `insert`, `update`,
//!   `upsert`, `delete`)
//! - Publishing to topics, sources and services
//! - Procedure execution, analytics model evaluation and source queries
//! - Event subscriptions over a single WebSocket, including reliable topics
//!   with acknowledgement
//! - Document upload and streaming download
//!
//! For usage examples, see `demos/simple.rs`.

pub mod config;
pub mod error;
pub mod event;
pub mod multipart;
pub mod session;
pub mod subscriber;
pub mod subscription;
pub mod transport;
pub mod utils;
pub mod vantiq;

pub use config::Config;
pub use error::{Error, Result};
pub use event::{SubscriberEvent, SubscriptionEvent};
pub use subscription::{SubscribeTarget, TypeOperation};
pub use vantiq::{Download, Vantiq};
