//! # rampart
//!
//! Request protection and response caching for async HTTP services:
//!
//! - **admission control**: a per-client token bucket
//!   ([`security::RateLimiter`]) that answers `429 Too Many Requests`;
//! - **deadlines**: a per-request timeout with soft cancellation
//!   ([`timeout::run_bounded`]) that answers `504 Gateway Timeout`;
//! - **cache-aside reads**: [`cache::CacheAside`] and
//!   [`cache::CachedReadService`] shield a backing read service from
//!   repeated identical queries.
//!
//! All state is process-local. The pieces compose as ordinary
//! [`middleware`] layers, and [`Protection`] wires them from a
//! [`ProtectionConfig`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rampart::{Protection, Response, StatusCode};
//! use rampart::middleware::{LoggerMiddleware, Pipeline};
//! use rampart::server::Server;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut protection = Protection::from_env()?;
//!     protection.start();
//!
//!     let pipeline = protection
//!         .layers(Pipeline::builder().layer(Arc::new(LoggerMiddleware)))
//!         .handler(|_ctx| async { Response::new(StatusCode::Ok).body("Hello, World!") });
//!
//!     Server::bind("127.0.0.1:8080").await?.run(pipeline).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod http;
pub mod middleware;
pub mod protection;
pub mod security;
pub mod server;
pub mod timeout;

pub use config::{ConfigError, ProtectionConfig};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use protection::Protection;
pub use server::{Server, ServerError};
