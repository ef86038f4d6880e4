// src/server.rs
use crate::error::{ErrorStats, UvhttpError, UvhttpResult};
use crate::middleware::MiddlewareChain;
use crate::parser::{BODY_MAX_DEFAULT, URL_MAX_DEFAULT};
use crate::rate_limit::RateLimiter;
use crate::router::Router;
use crate::static_files::{StaticConfig, StaticService};
use crate::syscalls;
use crate::upgrade::UpgradeRegistry;
use crate::worker::Worker;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tracing::{error, info};

/// Per-connection and per-request resource caps.
#[derive(Debug, Clone)]
pub struct Limits {
    pub url_max: usize,
    pub body_max: usize,
    pub idle_timeout_secs: u32,
    /// Keep-alive requests served before the connection is closed.
    pub max_requests_per_conn: u32,
    /// Connection slots per worker.
    pub max_connections: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            url_max: URL_MAX_DEFAULT,
            body_max: BODY_MAX_DEFAULT,
            idle_timeout_secs: 30,
            max_requests_per_conn: 10_000,
            max_connections: 1024,
        }
    }
}

/// Everything workers share, built once at serve time. The router and
/// upgrade registry are immutable from here on; the rate limiter, static
/// caches and error stats are internally synchronized.
pub(crate) struct ServerShared {
    pub(crate) router: Router,
    pub(crate) middleware: MiddlewareChain,
    pub(crate) rate_limiter: Option<RateLimiter>,
    pub(crate) upgrades: UpgradeRegistry,
    pub(crate) mounts: Vec<StaticService>,
    pub(crate) limits: Limits,
    pub(crate) stats: ErrorStats,
}

/// HTTP server builder.
///
/// ```no_run
/// use uvhttp::{Context, Response, Router, Server};
///
/// fn hello(_ctx: &mut Context, resp: &mut Response) {
///     let _ = resp.respond(200, "text/plain", "Hello, World!");
/// }
///
/// fn main() -> uvhttp::UvhttpResult<()> {
///     let mut router = Router::new();
///     router.get("/", hello)?;
///     Server::bind("0.0.0.0:8080").router(router).serve()
/// }
/// ```
pub struct Server {
    host_port: String,
    workers: usize,
    router: Router,
    middleware: MiddlewareChain,
    rate_limiter: Option<RateLimiter>,
    whitelist: Vec<String>,
    upgrades: UpgradeRegistry,
    mounts: Vec<StaticService>,
    limits: Limits,
}

impl Server {
    /// The single-reactor baseline: one worker unless raised.
    pub fn bind(host_port: &str) -> Self {
        Self {
            host_port: host_port.to_string(),
            workers: 1,
            router: Router::new(),
            middleware: MiddlewareChain::new(),
            rate_limiter: None,
            whitelist: Vec::new(),
            upgrades: UpgradeRegistry::new(),
            mounts: Vec::new(),
            limits: Limits::default(),
        }
    }

    /// Reactor threads, each with its own `SO_REUSEPORT` listener, epoll
    /// instance, and connection table.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// One reactor thread per CPU core.
    pub fn workers_auto(self) -> Self {
        let cores = num_cpus::get();
        self.workers(cores)
    }

    pub fn router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    pub fn middleware(mut self, middleware: MiddlewareChain) -> Self {
        self.middleware = middleware;
        self
    }

    /// Allow `limit` requests per `window_secs`-second window, shared
    /// across the whole server.
    pub fn rate_limit(mut self, limit: u32, window_secs: u64) -> Self {
        self.rate_limiter = Some(RateLimiter::new(limit, window_secs));
        self
    }

    /// Peer addresses exempt from the rate limiter.
    pub fn rate_limit_whitelist<I, S>(mut self, addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.whitelist.extend(addrs.into_iter().map(Into::into));
        self
    }

    pub fn upgrades(mut self, upgrades: UpgradeRegistry) -> Self {
        self.upgrades = upgrades;
        self
    }

    /// Serve files under `config.root_directory` at URL prefix `prefix`.
    pub fn static_mount(mut self, prefix: &str, config: StaticConfig) -> UvhttpResult<Self> {
        self.mounts.push(StaticService::new(prefix, config)?);
        Ok(self)
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Run until ctrl-c. Blocks the calling thread.
    pub fn serve(self) -> UvhttpResult<()> {
        let handle = self.spawn()?;
        let shutdown = handle.shutdown.clone();
        ctrlc::set_handler(move || {
            info!("shutdown signal received, draining connections");
            shutdown.store(true, Ordering::Release);
        })
        .map_err(|e| UvhttpError::Other(format!("failed to set ctrl-c handler: {}", e)))?;

        let metrics = handle.metrics.clone();
        let shutdown_metrics = handle.shutdown.clone();
        thread::Builder::new()
            .name("uvhttp-metrics".to_string())
            .spawn(move || {
                while !shutdown_metrics.load(Ordering::Acquire) {
                    thread::sleep(std::time::Duration::from_secs(5));
                    if shutdown_metrics.load(Ordering::Acquire) {
                        break;
                    }
                    let mut total_reqs = 0;
                    let mut total_active = 0;
                    for m in &metrics {
                        total_reqs += m.req_count.load(Ordering::Relaxed);
                        total_active += m.active_conns.load(Ordering::Relaxed);
                    }
                    info!(active_connections = total_active, total_requests = total_reqs);
                }
            })
            .ok();

        handle.join();
        Ok(())
    }

    /// Start workers in the background and return a handle, for embedding
    /// and tests.
    pub fn spawn(self) -> UvhttpResult<ServerHandle> {
        let Parts { host, port } = parse_host_port(&self.host_port)?;

        let mut rate_limiter = self.rate_limiter;
        if let Some(limiter) = rate_limiter.as_mut() {
            for addr in &self.whitelist {
                limiter.add_whitelist(addr);
            }
        }

        let shared = Arc::new(ServerShared {
            router: self.router,
            middleware: self.middleware,
            rate_limiter,
            upgrades: self.upgrades,
            mounts: self.mounts,
            limits: self.limits,
            stats: ErrorStats::new(),
        });
        let shutdown = Arc::new(AtomicBool::new(false));
        let core_ids = core_affinity::get_core_ids().unwrap_or_default();

        // All listeners are created up front so an ephemeral port (":0")
        // resolves once and every worker binds the same resolved port.
        let first_fd = syscalls::create_listen_socket(&host, port)?;
        let bound_port = syscalls::local_port(first_fd).unwrap_or(port);
        let mut listen_fds = vec![first_fd];
        for _ in 1..self.workers {
            listen_fds.push(syscalls::create_listen_socket(&host, bound_port)?);
        }

        info!(
            workers = self.workers,
            port = bound_port,
            "starting workers with SO_REUSEPORT"
        );

        let mut metrics = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            metrics.push(Arc::new(crate::metrics::WorkerMetrics::new()));
        }

        let mut threads = Vec::with_capacity(self.workers);
        for (i, listen_fd) in listen_fds.into_iter().enumerate() {
            let core_id = core_ids.get(i % core_ids.len().max(1)).copied();
            let shared = shared.clone();
            let shutdown_flag = shutdown.clone();
            let worker_metrics = metrics[i].clone();

            let handle = thread::Builder::new()
                .name(format!("uvhttp-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        core_affinity::set_for_current(id);
                    }
                    let mut worker = Worker::new(i, listen_fd, shared, worker_metrics);
                    if let Err(e) = worker.run(shutdown_flag) {
                        error!(worker = i, error = %e, "worker exited with error");
                    }
                    syscalls::close_fd(listen_fd);
                })
                .map_err(|e| UvhttpError::Worker(format!("spawn failed: {}", e)))?;
            threads.push(handle);
        }

        Ok(ServerHandle {
            shutdown,
            threads,
            shared,
            metrics,
            port: bound_port,
        })
    }
}

/// Handle to a running server.
pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
    threads: Vec<thread::JoinHandle<()>>,
    shared: Arc<ServerShared>,
    metrics: Vec<Arc<crate::metrics::WorkerMetrics>>,
    port: u16,
}

impl ServerHandle {
    /// The resolved listen port (useful with an ephemeral ":0" bind).
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn stats(&self) -> &ErrorStats {
        &self.shared.stats
    }

    pub fn metrics(&self) -> &[Arc<crate::metrics::WorkerMetrics>] {
        &self.metrics
    }

    /// Signal shutdown and wait for every worker to drain and exit.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.join_inner();
    }

    fn join(mut self) {
        self.join_inner();
    }

    fn join_inner(&mut self) {
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

struct Parts {
    host: String,
    port: u16,
}

fn parse_host_port(hp: &str) -> UvhttpResult<Parts> {
    let (host, port) = hp
        .rsplit_once(':')
        .ok_or_else(|| UvhttpError::InvalidParam("listen address must be host:port"))?;
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    let port = port
        .parse::<u16>()
        .map_err(|_| UvhttpError::InvalidParam("invalid port number"))?;
    Ok(Parts {
        host: host.to_string(),
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        let p = parse_host_port("127.0.0.1:8080").unwrap();
        assert_eq!(p.host, "127.0.0.1");
        assert_eq!(p.port, 8080);

        let p = parse_host_port(":9000").unwrap();
        assert_eq!(p.host, "0.0.0.0");

        assert!(parse_host_port("no-port").is_err());
        assert!(parse_host_port("x:70000").is_err());
    }

    #[test]
    fn test_limits_defaults() {
        let limits = Limits::default();
        assert_eq!(limits.url_max, 2048);
        assert_eq!(limits.body_max, 1024 * 1024);
        assert_eq!(limits.idle_timeout_secs, 30);
    }
}
