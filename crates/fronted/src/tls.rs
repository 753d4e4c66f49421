//! Per-front-domain TLS client configuration.
//!
//! Two settings here are load-bearing and deliberately paired: the
//! ClientHello carries no server_name extension, while certificate
//! verification still runs against the front domain. SNI on the wire would
//! name the front to any observer; verification without a server name
//! would accept any interceptor. Neither setting is ever relaxed, and
//! there is no insecure bypass.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rustls::client::{ClientSessionMemoryCache, Resumption};
use rustls::{ClientConfig, RootCertStore};

/// Session-resumption entries kept per front domain, so repeat dials to
/// the same front resume instead of full-handshaking.
const SESSION_CACHE_SIZE: usize = 1000;

static CRYPTO_PROVIDER: OnceLock<()> = OnceLock::new();

/// Install the ring crypto provider process-wide. Idempotent; only the
/// first call has effect.
pub(crate) fn ensure_crypto_provider() {
    CRYPTO_PROVIDER.get_or_init(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Parse PEM trust anchors into a root store.
///
/// Anchors the store refuses are skipped with a warning; whether an empty
/// result is acceptable is the caller's call.
pub fn root_store_from_pem(pem: &[u8]) -> io::Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let mut reader = io::BufReader::new(pem);
    for item in rustls_pemfile::certs(&mut reader) {
        let der = item?;
        if let Err(err) = roots.add(der) {
            tracing::warn!(error = %err, "skipping trust anchor that failed to parse");
        }
    }
    Ok(roots)
}

/// Lazily built, memoised client configs keyed by front domain.
///
/// Memoisation keeps one resumption store per domain alive for the life of
/// the pool, and spares re-deriving the config on every dial. The critical
/// section is a map lookup; config construction happens at most once per
/// domain.
pub(crate) struct TlsConfigCache {
    roots: Arc<RootCertStore>,
    configs: Mutex<HashMap<String, Arc<ClientConfig>>>,
}

impl TlsConfigCache {
    pub fn new(roots: RootCertStore) -> Self {
        Self {
            roots: Arc::new(roots),
            configs: Mutex::new(HashMap::new()),
        }
    }

    pub fn config_for(&self, domain: &str) -> Arc<ClientConfig> {
        let mut configs = self.configs.lock();
        if let Some(config) = configs.get(domain) {
            return Arc::clone(config);
        }

        let mut config = ClientConfig::builder()
            .with_root_certificates(Arc::clone(&self.roots))
            .with_no_client_auth();
        // Anonymous handshake on the wire; the ServerName handed to the
        // connector still drives certificate verification.
        config.enable_sni = false;
        config.resumption =
            Resumption::store(Arc::new(ClientSessionMemoryCache::new(SESSION_CACHE_SIZE)));

        let config = Arc::new(config);
        configs.insert(domain.to_string(), Arc::clone(&config));
        config
    }
}
