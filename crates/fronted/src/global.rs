//! Process-wide facade over a single [`Fronting`] instance.
//!
//! [`configure`] installs (and replaces) the instance; [`new_direct`] and
//! [`try_new_direct`] hand it out, waiting up to a deadline for a
//! configuration racing in from another task.

use std::path::PathBuf;
use std::time::Duration;

use once_cell::sync::Lazy;
use rustls::RootCertStore;
use tokio::sync::watch;
use tracing::error;

use crate::cache::FileStore;
use crate::error::Error;
use crate::front::{Fronting, FrontingOptions};
use crate::masquerade::Providers;

static INSTANCE: Lazy<watch::Sender<Option<Fronting>>> =
    Lazy::new(|| watch::channel(None).0);

/// Install a new process-wide transport.
///
/// Any previously installed instance has its cache loop flushed and
/// stopped before the replacement is built. An empty input installs
/// nothing: the failure is logged and pending [`new_direct`] waiters keep
/// waiting, because a transport with no masquerades can serve no one.
pub async fn configure(
    trusted_roots: RootCertStore,
    masquerades: Providers,
    cache_file: Option<PathBuf>,
) {
    if let Some(previous) = INSTANCE.send_replace(None) {
        previous.close().await;
    }

    let mut options = FrontingOptions::new(trusted_roots, masquerades);
    if let Some(path) = cache_file {
        options = options.with_store(Box::new(FileStore::new(path)));
    }
    match Fronting::configure(options).await {
        Ok(instance) => {
            let _ = INSTANCE.send_replace(Some(instance));
        }
        Err(err) => error!(error = %err, "fronting not configured, no instance published"),
    }
}

/// Wait up to `timeout` for the process-wide transport.
pub async fn try_new_direct(timeout: Duration) -> Result<Fronting, Error> {
    let mut updates = INSTANCE.subscribe();
    let result = match tokio::time::timeout(timeout, updates.wait_for(Option::is_some)).await {
        Ok(Ok(instance)) => instance
            .as_ref()
            .cloned()
            .ok_or(Error::ConfigurationUnavailable(timeout)),
        _ => Err(Error::ConfigurationUnavailable(timeout)),
    };
    result
}

/// Like [`try_new_direct`], but panics when the deadline passes: a caller
/// that depends on fronting has no degraded mode worth limping along in.
pub async fn new_direct(timeout: Duration) -> Fronting {
    match try_new_direct(timeout).await {
        Ok(instance) => instance,
        Err(err) => panic!("{err}"),
    }
}

/// Flush and stop the current instance's cache write-back loop. Safe to
/// call when none is open.
pub async fn close_cache() {
    let current = INSTANCE.borrow().as_ref().cloned();
    if let Some(instance) = current {
        instance.close().await;
    }
}
