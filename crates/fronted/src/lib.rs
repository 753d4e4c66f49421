//! Domain-fronted HTTP transport.
//!
//! An HTTP request issued against a "front" CDN hostname is carried to an
//! arbitrary target origin under the cover of the CDN's certificate for
//! that front. The crate maintains a self-healing pool of masquerades,
//! `(front domain, front IP)` pairs, that are shuffled in, vetted by live
//! TLS dials and HEAD probes, ranked into candidate and proven tiers,
//! reused per request, and persisted across runs, so callers always hold a
//! working covert channel without knowing which front carries their
//! traffic.
//!
//! Two wire-level choices define the transport:
//!
//! - The TLS dial **omits SNI**: the ClientHello names no host, while
//!   certificate verification still runs against the front domain.
//! - The request is serialised with an `http` scheme inside the fronted
//!   connection, whose TLS layer is the only one; the caller-supplied Host
//!   header is the covert routing signal.
//!
//! Connections are deliberately single-use: each request gets a fresh
//! fronted connection so masquerade health stays measurable per request.
//!
//! ```no_run
//! use fronted::{Fronting, FrontingOptions, Masquerade, Providers};
//!
//! # async fn demo() -> Result<(), fronted::Error> {
//! let mut providers = Providers::new();
//! providers.insert(
//!     "cloudfront".to_string(),
//!     vec![Masquerade::new("dxxxxxxxxxxxx.cloudfront.net", "203.0.113.7")],
//! );
//! let roots = rustls::RootCertStore::empty(); // supply real trust anchors
//!
//! let fronting = Fronting::configure(FrontingOptions::new(roots, providers)).await?;
//! let request = hyper::Request::get("https://target.example.com/resource")
//!     .body(hyper::Body::empty())
//!     .expect("static request");
//! let response = fronting.round_trip(request).await?;
//! # let _ = response;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod dial;
pub mod error;
pub mod front;
pub mod global;
mod http;
mod idle;
pub mod masquerade;
mod pool;
mod queue;
pub mod tls;
mod vet;

pub use cache::{CachedMasquerade, FileStore, MasqueradeStore};
pub use dial::{AsyncReadWrite, DialError, FaultKind, FrontDialer, IoStream, TlsFrontDialer};
pub use error::Error;
pub use front::{Fronting, FrontingOptions, PoolStats};
pub use global::{close_cache, configure, new_direct, try_new_direct};
pub use masquerade::{Masquerade, Providers};
pub use tls::root_store_from_pem;
pub use vet::PROBE_URL;
