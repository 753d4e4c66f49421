//! Shared scaffolding: scripted dialers serving canned HTTP responses over
//! in-memory streams, and an in-memory masquerade store.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use fronted::{
    CachedMasquerade, DialError, FrontDialer, FrontingOptions, IoStream, Masquerade,
    MasqueradeStore, Providers,
};
use hyper::service::service_fn;
use hyper::{Body, Request, Response};
use parking_lot::Mutex;
use rustls::RootCertStore;
use tokio::io::DuplexStream;

/// One request as the scripted origin saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub host: Option<String>,
    pub body: Vec<u8>,
}

/// What a dial against a given front domain should do.
pub enum Behavior {
    /// Serve one connection per dial, answering with the scripted
    /// statuses in order; the last status repeats.
    Statuses(Vec<u16>),
    /// Fail the handshake with a certificate-class (permanent) fault.
    UntrustedCertificate,
    /// Fail with a transient connect error.
    Refused,
}

struct Script {
    behavior: Behavior,
    served: usize,
}

/// A [`FrontDialer`] that never touches the network: every successful dial
/// hands back one half of an in-memory duplex whose other half is served
/// by a single-connection hyper origin.
pub struct ScriptedDialer {
    scripts: Mutex<HashMap<String, Script>>,
    dials: AtomicUsize,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl ScriptedDialer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            dials: AtomicUsize::new(0),
            requests: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn script(&self, domain: &str, behavior: Behavior) {
        self.scripts.lock().insert(
            domain.to_string(),
            Script {
                behavior,
                served: 0,
            },
        );
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn recorded(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl FrontDialer for ScriptedDialer {
    async fn dial(&self, masquerade: &Masquerade) -> Result<IoStream, DialError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let status = {
            let mut scripts = self.scripts.lock();
            let script = scripts
                .get_mut(masquerade.domain())
                .unwrap_or_else(|| panic!("no script for {masquerade}"));
            match &script.behavior {
                Behavior::UntrustedCertificate => {
                    return Err(DialError::Handshake(io::Error::new(
                        io::ErrorKind::InvalidData,
                        rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer),
                    )));
                }
                Behavior::Refused => {
                    return Err(DialError::Connect(io::Error::from(
                        io::ErrorKind::ConnectionRefused,
                    )));
                }
                Behavior::Statuses(statuses) => {
                    let index = script.served.min(statuses.len() - 1);
                    script.served += 1;
                    statuses[index]
                }
            }
        };

        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_one(server, status, Arc::clone(&self.requests)));
        Ok(Box::new(client))
    }
}

/// Serve exactly one in-memory connection, recording what arrives.
async fn serve_one(io: DuplexStream, status: u16, log: Arc<Mutex<Vec<RecordedRequest>>>) {
    let service = service_fn(move |request: Request<Body>| {
        let log = Arc::clone(&log);
        async move {
            let (parts, body) = request.into_parts();
            let body = hyper::body::to_bytes(body)
                .await
                .unwrap_or_default()
                .to_vec();
            log.lock().push(RecordedRequest {
                method: parts.method.to_string(),
                path: parts.uri.path().to_string(),
                host: parts
                    .headers
                    .get(hyper::header::HOST)
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string),
                body,
            });
            Response::builder()
                .status(status)
                .body(Body::from("fronted-test"))
        }
    });
    // The client hangs up after its single exchange; errors here are the
    // normal end of the connection.
    let _ = hyper::server::conn::Http::new()
        .serve_connection(io, service)
        .await;
}

/// Masquerade input under a single "test" provider label.
pub fn providers(entries: &[(&str, &str)]) -> Providers {
    let mut map = Providers::new();
    map.insert(
        "test".to_string(),
        entries
            .iter()
            .map(|(domain, ip)| Masquerade::new(*domain, *ip))
            .collect(),
    );
    map
}

/// Options wired to the scripted dialer, with background vetting off so
/// tests drive the pool deterministically.
pub fn scripted_options(dialer: &Arc<ScriptedDialer>, entries: &[(&str, &str)]) -> FrontingOptions {
    FrontingOptions::new(RootCertStore::empty(), providers(entries))
        .with_dialer(Arc::clone(dialer) as Arc<dyn FrontDialer>)
        .with_vet_parallelism(0)
}

/// In-memory [`MasqueradeStore`], doubling as a way to seed the vetted
/// tier (restored entries land there directly) and to observe write-backs.
#[derive(Clone, Default)]
pub struct MemoryStore {
    pub entries: Arc<Mutex<Vec<CachedMasquerade>>>,
    pub saves: Arc<AtomicUsize>,
}

impl MemoryStore {
    /// A store holding fresh entries, ordered as given.
    pub fn seeded(entries: &[(&str, &str)]) -> Self {
        let base = SystemTime::now() - Duration::from_secs(3600);
        let store = Self::default();
        *store.entries.lock() = entries
            .iter()
            .enumerate()
            .map(|(index, (domain, ip))| CachedMasquerade {
                domain: domain.to_string(),
                ip_address: ip.to_string(),
                last_vetted: base + Duration::from_secs(index as u64),
            })
            .collect();
        store
    }
}

impl MasqueradeStore for MemoryStore {
    fn load(&self) -> io::Result<Vec<CachedMasquerade>> {
        Ok(self.entries.lock().clone())
    }

    fn save(&self, entries: &[CachedMasquerade]) -> io::Result<()> {
        *self.entries.lock() = entries.to_vec();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
