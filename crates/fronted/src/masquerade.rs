//! Masquerade records: the `(front domain, front IP)` pairs the pool trades in.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::SystemTime;

use parking_lot::Mutex;

/// Masquerades grouped by the provider (CDN) they belong to.
///
/// The grouping only matters at load time: each provider's entries are
/// shuffled independently, so consumption order interleaves providers
/// instead of walking one CDN's address block back to back.
pub type Providers = HashMap<String, Vec<Masquerade>>;

/// A front-host candidate: a CDN hostname together with one of its edge
/// addresses.
///
/// Identity is the `(domain, ip_address)` pair; both are treated as opaque
/// strings. `last_vetted` records the most recent successful use in this
/// process or a prior persisted run, and is `None` until then.
#[derive(Debug)]
pub struct Masquerade {
    domain: String,
    ip_address: String,
    last_vetted: Mutex<Option<SystemTime>>,
}

impl Masquerade {
    pub fn new(domain: impl Into<String>, ip_address: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            ip_address: ip_address.into(),
            last_vetted: Mutex::new(None),
        }
    }

    /// A masquerade restored from persistence, carrying its recorded
    /// timestamp.
    pub fn restored(
        domain: impl Into<String>,
        ip_address: impl Into<String>,
        last_vetted: SystemTime,
    ) -> Self {
        Self {
            domain: domain.into(),
            ip_address: ip_address.into(),
            last_vetted: Mutex::new(Some(last_vetted)),
        }
    }

    /// The front hostname: the certificate subject checked during the dial
    /// and the cover name for the covert Host header.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The edge address dialed on the front port. Always a literal; the
    /// pool never resolves names.
    pub fn ip_address(&self) -> &str {
        &self.ip_address
    }

    pub fn last_vetted(&self) -> Option<SystemTime> {
        *self.last_vetted.lock()
    }

    pub(crate) fn mark_vetted(&self, when: SystemTime) {
        *self.last_vetted.lock() = Some(when);
    }
}

impl Clone for Masquerade {
    fn clone(&self) -> Self {
        Self {
            domain: self.domain.clone(),
            ip_address: self.ip_address.clone(),
            last_vetted: Mutex::new(self.last_vetted()),
        }
    }
}

impl PartialEq for Masquerade {
    fn eq(&self, other: &Self) -> bool {
        self.domain == other.domain && self.ip_address == other.ip_address
    }
}

impl Eq for Masquerade {}

impl Hash for Masquerade {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.domain.hash(state);
        self.ip_address.hash(state);
    }
}

impl fmt::Display for Masquerade {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.domain, self.ip_address)
    }
}
