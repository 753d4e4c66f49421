//! Background vetting of candidate masquerades.

use std::sync::Arc;

use hyper::{Body, Request, StatusCode};
use tracing::{debug, trace};

use crate::http;
use crate::pool::{Dialed, Pool, Tier};

/// The probe target: a stable, innocuous CloudFront object. A HEAD that
/// reaches it through a front proves the TLS path terminates at the CDN's
/// HTTP layer rather than at a middlebox that merely completes
/// handshakes. The `http` scheme keeps the probe from negotiating a
/// second TLS layer inside the already-encrypted fronted connection.
pub const PROBE_URL: &str = "http://dlymairwlc89h.cloudfront.net/index.html";

/// Spawn `workers` vetting tasks draining the candidate queue.
///
/// Each worker dials candidates until it either promotes one (at which
/// point its job is done) or the queue runs dry. A failed probe discards
/// the candidate and the worker keeps drawing.
pub(crate) fn spawn(pool: &Arc<Pool>, workers: usize) {
    debug!(workers, "vetting candidates");
    for _ in 0..workers {
        let pool = Arc::clone(pool);
        tokio::spawn(async move { while vet_one(&pool).await {} });
    }
}

/// Vet a single candidate; returns whether the worker should keep going.
async fn vet_one(pool: &Arc<Pool>) -> bool {
    let Ok(Dialed { stream, grant }) = pool.dial_with(Tier::Candidates).await else {
        // Queue drained; nothing left to vet in this process.
        return false;
    };

    let request = match Request::head(PROBE_URL).body(Body::empty()) {
        Ok(request) => request,
        Err(err) => {
            debug!(error = %err, "probe request could not be built");
            grant.discard();
            return false;
        }
    };

    // A HEAD is the cheapest request that still exercises the CDN's HTTP
    // layer; anything but a clean 200 (regional error pages, non-CDN
    // content) disqualifies the candidate.
    match http::exchange(stream, request).await {
        Ok(response) if response.status() == StatusCode::OK => {
            trace!("masquerade vetted");
            #[cfg(feature = "metrics")]
            metrics::counter!("fronted_vet_total", "result" => "ok").increment(1);
            grant.commit();
            false
        }
        Ok(response) => {
            trace!(status = %response.status(), "probe rejected, discarding masquerade");
            #[cfg(feature = "metrics")]
            metrics::counter!("fronted_vet_total", "result" => "bad_status").increment(1);
            grant.discard();
            true
        }
        Err(err) => {
            trace!(error = %err, "probe failed, discarding masquerade");
            #[cfg(feature = "metrics")]
            metrics::counter!("fronted_vet_total", "result" => "error").increment(1);
            grant.discard();
            true
        }
    }
}
