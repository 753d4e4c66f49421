//! The fronting handle: configuration and the retrying round-tripper.

use std::sync::Arc;
use std::time::Duration;

use hyper::body::Bytes;
use hyper::http::request::Parts;
use hyper::{Body, Request, Response};
use rustls::RootCertStore;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cache::{self, CacheHandle, MasqueradeStore, WritebackPolicy};
use crate::dial::{FrontDialer, TlsFrontDialer};
use crate::error::Error;
use crate::http;
use crate::masquerade::{Masquerade, Providers};
use crate::pool::{Dialed, Pool};
use crate::vet;

/// Attempt budget per request. Blind thousand-fold retrying serves nothing
/// interactive; callers who want a bigger budget set one explicitly.
pub const DEFAULT_MAX_TRIES: usize = 6;

/// Deadline covering the TCP connect and the TLS handshake of one dial.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle window after which a live fronted connection is torn down.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(70);

/// Initial vetting parallelism, reduced one-for-one by cache-restored
/// masquerades.
pub const DEFAULT_VET_PARALLELISM: usize = 1000;

/// Cap on persisted masquerades; the oldest are evicted first.
pub const DEFAULT_MAX_CACHE_SIZE: usize = 1000;

/// Persisted entries older than this are ignored at load time.
pub const DEFAULT_MAX_CACHE_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Minimum spacing between cache writes; commits in between coalesce.
pub const DEFAULT_CACHE_SAVE_INTERVAL: Duration = Duration::from_secs(5);

/// Fronts are dialed on the TLS port.
pub const DEFAULT_CONNECT_PORT: u16 = 443;

/// Options for [`Fronting::configure`]. Start from
/// [`FrontingOptions::new`] and override what you need; every field is
/// public.
pub struct FrontingOptions {
    /// Roots the CDN certificates must chain to. There is no insecure
    /// mode.
    pub trusted_roots: RootCertStore,
    /// The candidate set, grouped by provider. Closed at configuration
    /// time: the pool never discovers new masquerades.
    pub masquerades: Providers,
    /// Durable store for proven masquerades. `None` disables persistence.
    pub store: Option<Box<dyn MasqueradeStore>>,
    pub max_tries: usize,
    pub dial_timeout: Duration,
    pub idle_timeout: Duration,
    pub vet_parallelism: usize,
    pub max_cache_size: usize,
    pub max_cache_age: Duration,
    pub cache_save_interval: Duration,
    /// Refuse to buffer request bodies larger than this. `None` buffers
    /// anything, which is the historical behaviour and a capacity hazard
    /// under hostile callers.
    pub max_body_size: Option<usize>,
    pub connect_port: u16,
    /// Override the network seam; mainly for tests and exotic transports.
    pub dialer: Option<Arc<dyn FrontDialer>>,
}

impl FrontingOptions {
    pub fn new(trusted_roots: RootCertStore, masquerades: Providers) -> Self {
        Self {
            trusted_roots,
            masquerades,
            store: None,
            max_tries: DEFAULT_MAX_TRIES,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            vet_parallelism: DEFAULT_VET_PARALLELISM,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            max_cache_age: DEFAULT_MAX_CACHE_AGE,
            cache_save_interval: DEFAULT_CACHE_SAVE_INTERVAL,
            max_body_size: None,
            connect_port: DEFAULT_CONNECT_PORT,
            dialer: None,
        }
    }

    pub fn with_store(mut self, store: Box<dyn MasqueradeStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_max_tries(mut self, max_tries: usize) -> Self {
        self.max_tries = max_tries;
        self
    }

    pub fn with_vet_parallelism(mut self, workers: usize) -> Self {
        self.vet_parallelism = workers;
        self
    }

    pub fn with_max_body_size(mut self, limit: usize) -> Self {
        self.max_body_size = Some(limit);
        self
    }

    pub fn with_connect_port(mut self, port: u16) -> Self {
        self.connect_port = port;
        self
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn FrontDialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Unproven entries awaiting a first successful use.
    pub candidates: usize,
    /// Entries with a successful handshake and probe behind them.
    pub masquerades: usize,
    /// Successful commits since configuration.
    pub commits: u64,
}

/// A configured fronted transport.
///
/// Cheap to clone; all clones share the pool and its background workers.
#[derive(Clone, Debug)]
pub struct Fronting {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner").finish_non_exhaustive()
    }
}

struct Inner {
    pool: Arc<Pool>,
    cache: Option<CacheHandle>,
    max_tries: usize,
    max_body_size: Option<usize>,
}

impl Fronting {
    /// Build the pool, restore the cache, and start the background
    /// vetting and write-back workers.
    ///
    /// Fails with [`Error::EmptyMasquerades`] when the flattened input is
    /// empty. Cache entries still inside the age window are injected
    /// straight into the vetted tier and reduce the vetting budget
    /// one-for-one; they proved themselves in a previous run.
    pub async fn configure(options: FrontingOptions) -> Result<Self, Error> {
        crate::tls::ensure_crypto_provider();

        let size: usize = options.masquerades.values().map(Vec::len).sum();
        if size == 0 {
            return Err(Error::EmptyMasquerades);
        }

        let restored = match &options.store {
            Some(store) => cache::live_entries(store.as_ref(), options.max_cache_age),
            None => Vec::new(),
        };
        let restored_count = restored.len();

        let dialer: Arc<dyn FrontDialer> = match options.dialer {
            Some(dialer) => dialer,
            None => Arc::new(TlsFrontDialer::new(
                options.trusted_roots,
                options.connect_port,
                options.dial_timeout,
            )),
        };

        let (to_cache, offers) = mpsc::channel(options.max_cache_size.max(1));
        let pool = Arc::new(Pool::new(
            size,
            size + restored_count,
            dialer,
            options.idle_timeout,
            to_cache,
        ));
        pool.load_candidates(options.masquerades);
        for entry in &restored {
            pool.restore(Arc::new(Masquerade::restored(
                entry.domain.clone(),
                entry.ip_address.clone(),
                entry.last_vetted,
            )));
        }

        let cache = options.store.map(|store| {
            cache::spawn_writeback(
                store,
                WritebackPolicy {
                    max_size: options.max_cache_size,
                    save_interval: options.cache_save_interval,
                },
                restored,
                offers,
            )
        });

        let vet_budget = options.vet_parallelism.saturating_sub(restored_count);
        if vet_budget > 0 {
            vet::spawn(&pool, vet_budget);
        } else {
            debug!("skipping initial vetting, cache restored enough masquerades");
        }

        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                cache,
                max_tries: options.max_tries,
                max_body_size: options.max_body_size,
            }),
        })
    }

    /// Issue `request` through the pool, retrying across masquerades until
    /// a usable response arrives or the attempt budget runs out.
    ///
    /// The body is buffered up front so it can be replayed on every
    /// attempt; streaming-only bodies are unsupported. A 2xx or 3xx
    /// response commits the carrying masquerade and is returned with its
    /// body buffered, since the connection does not outlive the call. 3xx
    /// responses come back unmodified: following redirects is the
    /// caller's decision, not this transport's. Other statuses (notably
    /// the 403 some providers return for blocked targets) burn an attempt
    /// and move on to another masquerade.
    pub async fn round_trip(&self, request: Request<Body>) -> Result<Response<Body>, Error> {
        let (parts, body) = request.into_parts();
        let body = hyper::body::to_bytes(body).await.map_err(Error::Body)?;
        if let Some(limit) = self.inner.max_body_size {
            if body.len() > limit {
                return Err(Error::BodyTooLarge {
                    size: body.len(),
                    limit,
                });
            }
        }

        for attempt in 1..=self.inner.max_tries {
            // A dial failure means the pool is empty; more attempts cannot
            // help, so it aborts the whole call.
            let Dialed { stream, grant } = self.inner.pool.dial().await?;
            let request = rebuild_request(&parts, body.clone());

            match http::exchange(stream, request).await {
                Ok(response)
                    if response.status().is_success() || response.status().is_redirection() =>
                {
                    // Read the body while the connection is alive, then
                    // let the grant return the masquerade to duty.
                    let (head, response_body) = response.into_parts();
                    match hyper::body::to_bytes(response_body).await {
                        Ok(bytes) => {
                            grant.commit();
                            #[cfg(feature = "metrics")]
                            metrics::counter!("fronted_roundtrip_total", "result" => "ok")
                                .increment(1);
                            return Ok(Response::from_parts(head, Body::from(bytes)));
                        }
                        Err(err) => {
                            warn!(attempt, error = %err, "response body aborted mid-transfer");
                        }
                    }
                }
                Ok(response) => {
                    debug!(attempt, status = %response.status(), "unusable response status");
                    #[cfg(feature = "metrics")]
                    metrics::counter!("fronted_roundtrip_total", "result" => "bad_status")
                        .increment(1);
                }
                Err(err) => {
                    warn!(attempt, error = %err, "fronted exchange failed");
                    #[cfg(feature = "metrics")]
                    metrics::counter!("fronted_roundtrip_total", "result" => "error").increment(1);
                }
            }
        }

        Err(Error::RetriesExhausted {
            attempts: self.inner.max_tries,
        })
    }

    /// Flush and stop the cache write-back worker. Safe to call
    /// repeatedly, or when no cache was configured. The pool itself keeps
    /// serving.
    pub async fn close(&self) {
        if let Some(cache) = &self.inner.cache {
            cache.close().await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            candidates: self.inner.pool.candidate_count(),
            masquerades: self.inner.pool.masquerade_count(),
            commits: self.inner.pool.commit_count(),
        }
    }
}

/// Fresh request for one attempt: same head, replayed body. The caller's
/// original is never touched after buffering.
fn rebuild_request(parts: &Parts, body: Bytes) -> Request<Body> {
    let mut request = Request::new(if body.is_empty() {
        Body::empty()
    } else {
        Body::from(body)
    });
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = parts.uri.clone();
    *request.version_mut() = parts.version;
    *request.headers_mut() = parts.headers.clone();
    request
}
