//! Async TCP listener using Tokio.
//!
//! Accepts connections, optionally terminates TLS, and hands every connection
//! to its own task. Each connection carries exactly one request/response
//! exchange and is then closed (see [`connection`]).
//!
//! Shutdown is cooperative: [`ServerHandle::stop`] closes the listening
//! socket, waits up to `shutdown_grace_ms` for in-flight connections, and then
//! leaves any stragglers to finish on their own.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ServerConfig};
use crate::router::{ApplicationRegistry, Router};

mod connection;
pub mod tls;

use connection::ConnectionSettings;

/// Errors produced while starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read {}: {source}", .path.display())]
    TlsFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificate found in {}", .0.display())]
    MissingCertificate(PathBuf),

    #[error("no private key found in {}", .0.display())]
    MissingKey(PathBuf),

    #[error("TLS configuration rejected: {0}")]
    Tls(#[from] rustls::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// The listener plus everything a connection needs to be served.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use servlette::application::Application;
/// use servlette::config::ServerConfig;
/// use servlette::router::ApplicationRegistry;
/// use servlette::server::Server;
/// use servlette::servlet::servlet_fn;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let registry = Arc::new(ApplicationRegistry::new());
///     let app = Application::builder("/")
///         .servlet(
///             "hello",
///             servlet_fn(|ctx| {
///                 ctx.response_mut().write_str("Hello!")?;
///                 Ok(())
///             }),
///             &["/"],
///         )
///         .build()?;
///     registry.deploy(Arc::new(app))?;
///
///     let handle = Server::new(ServerConfig::default(), registry).start().await?;
///     println!("listening on http://{}", handle.local_addr());
///     handle.stop().await;
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    router: Router,
}

impl Server {
    pub fn new(config: ServerConfig, registry: Arc<ApplicationRegistry>) -> Self {
        Self {
            config,
            router: Router::new(registry),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Binds the listening socket and starts accepting connections.
    ///
    /// Returns once the socket is bound, so the caller knows the server is
    /// reachable (or why it is not).
    ///
    /// # Errors
    ///
    /// - [`ServerError::Config`]: the configuration failed validation.
    /// - [`ServerError::Bind`]: the address could not be bound.
    /// - [`ServerError::TlsFile`], [`ServerError::Tls`] and friends: TLS setup failed.
    pub async fn start(self) -> Result<ServerHandle, ServerError> {
        self.config.validate()?;
        let addr = self.config.socket_addr()?;
        let tls = self.config.tls.as_ref().map(tls::acceptor).transpose()?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, tls = tls.is_some(), "servlette listening");

        let (shutdown, signal) = watch::channel(false);
        let registry = Arc::clone(self.router.registry());

        let acceptor = Acceptor {
            listener,
            tls,
            router: Arc::new(self.router),
            settings: Arc::new(ConnectionSettings::from(&self.config)),
            limit: self.config.max_connections.map(|n| Arc::new(Semaphore::new(n))),
            grace: self.config.shutdown_grace(),
        };
        let accept = tokio::spawn(acceptor.run(signal.clone()));
        let reaper = self
            .config
            .session_sweep()
            .map(|every| tokio::spawn(reap_sessions(registry, every, signal)));

        Ok(ServerHandle {
            local_addr,
            shutdown,
            accept,
            reaper,
        })
    }
}

/// Control over a running server.
///
/// Dropping the handle shuts the server down the same way [`stop`](Self::stop)
/// does, without waiting for it.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept: JoinHandle<()>,
    reaper: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// The bound address; useful when the configured port was `0`.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, drains in-flight connections for the grace period,
    /// and returns once the listener task has exited.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.accept.await {
            error!(error = %e, "listener task failed");
        }
        if let Some(reaper) = self.reaper {
            let _ = reaper.await;
        }
        info!(address = %self.local_addr, "servlette stopped");
    }
}

struct Acceptor {
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    router: Arc<Router>,
    settings: Arc<ConnectionSettings>,
    limit: Option<Arc<Semaphore>>,
    grace: Duration,
}

impl Acceptor {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let Acceptor {
            listener,
            tls,
            router,
            settings,
            limit,
            grace,
        } = self;
        let mut workers = JoinSet::new();

        loop {
            while let Some(finished) = workers.try_join_next() {
                if let Err(e) = finished {
                    if e.is_panic() {
                        error!(error = %e, "connection task panicked");
                    }
                }
            }

            // Wait for a free slot before accepting, so excess connections
            // queue in the kernel backlog rather than in memory.
            let permit = match &limit {
                Some(slots) => tokio::select! {
                    permit = Arc::clone(slots).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                    _ = shutdown.changed() => break,
                },
                None => None,
            };

            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.changed() => break,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "connection accepted");
                    let tls = tls.clone();
                    let router = Arc::clone(&router);
                    let settings = Arc::clone(&settings);
                    workers.spawn(async move {
                        let _permit = permit;
                        connection::process(stream, peer, tls, router, settings).await;
                    });
                }
                // Per-connection failures (reset before accept, fd pressure)
                // must not take the listener down.
                Err(e) => warn!(error = %e, "failed to accept connection"),
            }
        }

        drop(listener);
        info!(in_flight = workers.len(), "listener closed; draining connections");

        let drained = tokio::time::timeout(grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = workers.len(),
                grace_ms = grace.as_millis() as u64,
                "grace period elapsed; leaving connections to finish on their own"
            );
            workers.detach_all();
        }
    }
}

async fn reap_sessions(
    registry: Arc<ApplicationRegistry>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for application in registry.applications() {
                    let expired = application.sessions().expire_idle();
                    if expired > 0 {
                        debug!(
                            context = %application.display_name(),
                            expired,
                            "expired idle sessions"
                        );
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::application::Application;
    use crate::context::Context;
    use crate::servlet::{BoxFuture, Servlet, ServletResult, servlet_fn};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    fn config() -> ServerConfig {
        ServerConfig {
            port: 0,
            close_delay_ms: 0,
            shutdown_grace_ms: 200,
            ..ServerConfig::default()
        }
    }

    fn registry() -> Arc<ApplicationRegistry> {
        let registry = Arc::new(ApplicationRegistry::new());
        let app = Application::builder("/")
            .servlet(
                "slow",
                servlet_fn(|ctx| {
                    ctx.response_mut().write_str("ok")?;
                    Ok(())
                }),
                &["/"],
            )
            .build()
            .unwrap();
        registry.deploy(Arc::new(app)).unwrap();
        registry
    }

    #[tokio::test]
    async fn serves_then_stops() {
        let handle = Server::new(config(), registry()).start().await.unwrap();
        let addr = handle.local_addr();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
        assert!(out.ends_with("ok"));

        handle.stop().await;
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let first = Server::new(config(), registry()).start().await.unwrap();
        let taken = ServerConfig {
            port: first.local_addr().port(),
            ..config()
        };
        let err = Server::new(taken, registry()).start().await.unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }), "{err}");
        first.stop().await;
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_binding() {
        let bad = ServerConfig {
            bind_address: "not-an-ip".into(),
            ..config()
        };
        let err = Server::new(bad, registry()).start().await.unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
    }

    /// Sleeps before answering and tracks how many requests overlap.
    struct Slow {
        delay: Duration,
        started: mpsc::UnboundedSender<()>,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Servlet for Slow {
        fn service<'a>(&'a self, ctx: &'a mut Context) -> BoxFuture<'a, ServletResult> {
            Box::pin(async move {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                let _ = self.started.send(());
                tokio::time::sleep(self.delay).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                ctx.response_mut().write_str("slow")?;
                Ok(())
            })
        }
    }

    struct SlowSetup {
        registry: Arc<ApplicationRegistry>,
        started: mpsc::UnboundedReceiver<()>,
        peak: Arc<AtomicUsize>,
    }

    fn slow_registry(delay: Duration) -> SlowSetup {
        let (tx, started) = mpsc::unbounded_channel();
        let peak = Arc::new(AtomicUsize::new(0));
        let servlet = Slow {
            delay,
            started: tx,
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::clone(&peak),
        };
        let registry = Arc::new(ApplicationRegistry::new());
        let app = Application::builder("/").servlet("slow", servlet, &["/"]).build().unwrap();
        registry.deploy(Arc::new(app)).unwrap();
        SlowSetup {
            registry,
            started,
            peak,
        }
    }

    // Under the paused clock the header deadline must outlast every servlet sleep.
    fn slow_config(grace_ms: u64) -> ServerConfig {
        ServerConfig {
            shutdown_grace_ms: grace_ms,
            header_timeout_ms: 3_600_000,
            session_sweep_ms: 0,
            ..config()
        }
    }

    async fn send(addr: SocketAddr) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        stream
    }

    async fn read_all(mut stream: TcpStream) -> String {
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test(start_paused = true)]
    async fn connection_limit_serializes_requests() {
        let setup = slow_registry(Duration::from_secs(10));
        let limited = ServerConfig {
            max_connections: Some(1),
            ..slow_config(200)
        };
        let handle = Server::new(limited, setup.registry).start().await.unwrap();
        let addr = handle.local_addr();

        let began = Instant::now();
        let first = tokio::spawn(async move { read_all(send(addr).await).await });
        let second = tokio::spawn(async move { read_all(send(addr).await).await });
        let (first, second) = (first.await.unwrap(), second.await.unwrap());

        assert!(first.ends_with("slow"), "{first}");
        assert!(second.ends_with("slow"), "{second}");
        assert_eq!(setup.peak.load(Ordering::SeqCst), 1);
        assert!(began.elapsed() >= Duration::from_secs(20));
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_in_flight_request_within_grace() {
        let mut setup = slow_registry(Duration::from_secs(10));
        let handle = Server::new(slow_config(60_000), setup.registry).start().await.unwrap();
        let addr = handle.local_addr();

        let stream = send(addr).await;
        setup.started.recv().await.unwrap();

        let stopping = Instant::now();
        handle.stop().await;
        let waited = stopping.elapsed();
        assert!(waited >= Duration::from_secs(9), "{waited:?}");
        assert!(waited < Duration::from_secs(60), "{waited:?}");

        let out = read_all(stream).await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
        assert!(out.ends_with("slow"));
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_detaches_connections_after_grace() {
        let mut setup = slow_registry(Duration::from_secs(10));
        let handle = Server::new(slow_config(200), setup.registry).start().await.unwrap();
        let addr = handle.local_addr();

        let stream = send(addr).await;
        setup.started.recv().await.unwrap();

        let stopping = Instant::now();
        handle.stop().await;
        let waited = stopping.elapsed();
        assert!(waited >= Duration::from_millis(200), "{waited:?}");
        assert!(waited < Duration::from_secs(10), "{waited:?}");

        // The detached connection still runs to completion.
        let out = read_all(stream).await;
        assert!(out.ends_with("slow"), "{out}");
    }
}
