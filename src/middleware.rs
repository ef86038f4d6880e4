// src/middleware.rs
use crate::error::{ErrorKind, ErrorStats};
use crate::http::{Method, Request, Response};
use std::any::Any;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareResult {
    /// Proceed to the next interceptor, then the handler.
    Continue,
    /// The response was produced here; skip the rest of the chain and the
    /// handler.
    Stop,
}

/// Mutable bag handed to each interceptor: string key/values shared along
/// the chain plus the interceptor's own registration config.
pub struct MiddlewareCtx {
    vars: Vec<(String, String)>,
    config: Option<Arc<dyn Any + Send + Sync>>,
}

impl MiddlewareCtx {
    fn new(config: Option<Arc<dyn Any + Send + Sync>>) -> Self {
        Self {
            vars: Vec::new(),
            config,
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        match self.vars.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.vars.push((key.to_string(), value.to_string())),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The config object this interceptor was registered with.
    pub fn config<T: 'static>(&self) -> Option<&T> {
        self.config.as_deref().and_then(|c| c.downcast_ref::<T>())
    }
}

pub type Middleware = fn(&Request, &mut Response, &mut MiddlewareCtx) -> MiddlewareResult;

struct MiddlewareEntry {
    func: Middleware,
    config: Option<Arc<dyn Any + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChainOutcome {
    /// Every interceptor continued; run the handler.
    Continue,
    /// An interceptor produced the response.
    Stopped,
}

/// Ordered list of interceptors run before the route handler.
#[derive(Default)]
pub struct MiddlewareChain {
    entries: Vec<MiddlewareEntry>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, func: Middleware) {
        self.entries.push(MiddlewareEntry { func, config: None });
    }

    pub fn push_with_config(
        &mut self,
        func: Middleware,
        config: Arc<dyn Any + Send + Sync>,
    ) {
        self.entries.push(MiddlewareEntry {
            func,
            config: Some(config),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn execute(
        &self,
        req: &Request,
        resp: &mut Response,
        stats: &ErrorStats,
    ) -> ChainOutcome {
        for entry in &self.entries {
            let mut ctx = MiddlewareCtx::new(entry.config.clone());
            match (entry.func)(req, resp, &mut ctx) {
                MiddlewareResult::Continue => {
                    if resp.is_sent() {
                        // An interceptor sent the response and still asked to
                        // continue. Honor the first send, skip the rest.
                        warn!("middleware sent a response but returned Continue");
                        stats.record(
                            ErrorKind::DoubleSend,
                            "middleware returned Continue after send",
                        );
                        return ChainOutcome::Stopped;
                    }
                }
                MiddlewareResult::Stop => {
                    if !resp.is_sent() {
                        let _ = resp.send();
                    }
                    return ChainOutcome::Stopped;
                }
            }
        }
        ChainOutcome::Continue
    }
}

// ── Built-in CORS interceptor ──

/// Cross-origin resource sharing configuration.
///
/// The defaults mirror a permissive development setup: any origin, the
/// common methods and request headers, a day of preflight caching.
#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub allow_origin: String,
    pub allow_methods: String,
    pub allow_headers: String,
    pub expose_headers: String,
    pub allow_credentials: bool,
    pub max_age: String,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allow_origin: "*".to_string(),
            allow_methods: "GET, POST, PUT, DELETE, OPTIONS, HEAD, PATCH".to_string(),
            allow_headers: "Content-Type, Authorization, X-Requested-With".to_string(),
            expose_headers: String::new(),
            allow_credentials: false,
            max_age: "86400".to_string(),
        }
    }
}

impl CorsConfig {
    pub fn with_origin(origin: &str) -> Self {
        Self {
            allow_origin: origin.to_string(),
            ..Self::default()
        }
    }
}

fn cors_set_headers(resp: &mut Response, config: &CorsConfig, origin: Option<&str>) {
    if config.allow_origin == "*" {
        let _ = resp.set_header("Access-Control-Allow-Origin", "*");
    } else if let Some(origin) = origin {
        if origin == config.allow_origin {
            let _ = resp.set_header("Access-Control-Allow-Origin", origin);
            // Echoed origins vary the response; merge with any existing Vary.
            match resp.headers.get("Vary") {
                Some(existing) if !crate::http::contains_token(existing, "Origin") => {
                    let merged = format!("{}, Origin", existing);
                    let _ = resp.headers.set("Vary", &merged);
                }
                Some(_) => {}
                None => {
                    let _ = resp.set_header("Vary", "Origin");
                }
            }
        }
    }

    let _ = resp.set_header("Access-Control-Allow-Methods", &config.allow_methods);
    let _ = resp.set_header("Access-Control-Allow-Headers", &config.allow_headers);
    if !config.expose_headers.is_empty() {
        let _ = resp.set_header("Access-Control-Expose-Headers", &config.expose_headers);
    }
    if config.allow_credentials {
        let _ = resp.set_header("Access-Control-Allow-Credentials", "true");
    }
    if !config.max_age.is_empty() {
        let _ = resp.set_header("Access-Control-Max-Age", &config.max_age);
    }
}

/// CORS interceptor. Register with a [`CorsConfig`] via
/// [`MiddlewareChain::push_with_config`]; without one the permissive
/// defaults apply. `OPTIONS` preflights are answered with 200 and stop the
/// chain.
pub fn cors_middleware(
    req: &Request,
    resp: &mut Response,
    ctx: &mut MiddlewareCtx,
) -> MiddlewareResult {
    let default_config;
    let config = match ctx.config::<CorsConfig>() {
        Some(c) => c,
        None => {
            default_config = CorsConfig::default();
            &default_config
        }
    };

    cors_set_headers(resp, config, req.header("Origin"));

    if req.method == Method::Options {
        let _ = resp.set_status(200);
        let _ = resp.send();
        return MiddlewareResult::Stop;
    }
    MiddlewareResult::Continue
}
