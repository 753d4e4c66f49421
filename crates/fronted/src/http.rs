//! One-shot HTTP exchange over an established fronted connection.

use hyper::header::{HeaderValue, HOST};
use hyper::http::uri::{PathAndQuery, Scheme};
use hyper::{Body, Request, Response, Uri};
use thiserror::Error;

use crate::dial::IoStream;

#[derive(Debug, Error)]
pub(crate) enum ExchangeError {
    #[error("request rewrite: {0}")]
    Rewrite(#[from] hyper::http::Error),

    #[error("{0}")]
    Http(#[from] hyper::Error),
}

/// Issue a single request over `stream` and return the response.
///
/// The connection carries exactly one exchange, never keep-alive, so every
/// request's outcome is attributable to exactly one masquerade. The
/// connection driver runs in its own task and winds down once the response
/// (and its body) has been delivered.
pub(crate) async fn exchange(
    stream: IoStream,
    req: Request<Body>,
) -> Result<Response<Body>, ExchangeError> {
    let req = to_wire_request(req)?;
    let (mut sender, connection) = hyper::client::conn::handshake(stream).await?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            tracing::trace!(error = %err, "fronted connection terminated");
        }
    });
    Ok(sender.send_request(req).await?)
}

/// Normalise a request for the wire.
///
/// The fronted connection is already TLS, so the scheme is forced to
/// `http`: nothing may negotiate a second TLS layer inside it. When the
/// Host header is absent it is filled from the request authority; that
/// header, not the connection, names the covert target. The caller's
/// request is rebuilt rather than mutated in place.
pub(crate) fn to_wire_request(req: Request<Body>) -> Result<Request<Body>, hyper::http::Error> {
    let (mut parts, body) = req.into_parts();
    let mut uri = std::mem::take(&mut parts.uri).into_parts();
    if uri.path_and_query.is_none() {
        uri.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    match &uri.authority {
        Some(authority) => {
            if !parts.headers.contains_key(HOST) {
                parts
                    .headers
                    .insert(HOST, HeaderValue::from_str(authority.as_str())?);
            }
            uri.scheme = Some(Scheme::HTTP);
        }
        None => {
            // Relative target: nothing to rewrite, the caller must have
            // set Host already.
            uri.scheme = None;
        }
    }
    parts.uri = Uri::from_parts(uri)?;
    Ok(Request::from_parts(parts, body))
}
