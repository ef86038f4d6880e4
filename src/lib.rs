// src/lib.rs
//! Embeddable HTTP/1.1 server library on a non-blocking epoll/kqueue
//! reactor.
//!
//! One reactor thread (or N, each behind its own `SO_REUSEPORT` listener)
//! drives a table of connection slots through accept → incremental parse →
//! dispatch → respond → recycle. Dispatch runs protocol upgrades, the rate
//! limiter, the middleware chain, static-file mounts, and the hybrid
//! array/trie router, in that order. Handlers run synchronously on the
//! reactor thread and must not block.

pub mod conn;
pub mod error;
pub mod headers;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod parser;
pub mod rate_limit;
pub mod router;
pub mod server;
pub mod slab;
pub mod static_files;
pub mod syscalls;
pub mod upgrade;
pub mod worker;

// Re-exports for users.
pub use error::{ErrorKind, ErrorStats, UvhttpError, UvhttpResult};
pub use headers::HeaderMap;
pub use http::{Body, Context, Method, Request, Response};
pub use logging::{init_logging, init_logging_with_level};
pub use middleware::{CorsConfig, Middleware, MiddlewareChain, MiddlewareResult, cors_middleware};
pub use parser::{ParseError, Parser};
pub use rate_limit::{RateDecision, RateLimiter};
pub use router::{Handler, Params, Router};
pub use server::{Limits, Server, ServerHandle};
pub use static_files::StaticConfig;
pub use upgrade::{UpgradeRegistry, websocket_accept_key};
