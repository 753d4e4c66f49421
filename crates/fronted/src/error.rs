//! Externally visible failures.
//!
//! Everything below the pool-empty error is handled inside the dial loop
//! and surfaced only through logging; callers see the variants here and
//! nothing else.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Both the vetted and candidate queues were empty. Retrying cannot
    /// help until new masquerades are configured.
    #[error("no masquerades available")]
    NoMasqueradesAvailable,

    /// Every attempt either failed in transit or came back with an
    /// unusable status.
    #[error("request not completed after {attempts} attempts")]
    RetriesExhausted { attempts: usize },

    /// The flattened masquerade input was empty; there is nothing to pool.
    #[error("no masquerades provided")]
    EmptyMasquerades,

    /// The request body exceeds the configured buffering cap.
    #[error("request body of {size} bytes exceeds the {limit}-byte limit")]
    BodyTooLarge { size: usize, limit: usize },

    /// The request body could not be read into the replay buffer.
    #[error("unable to buffer request body: {0}")]
    Body(#[source] hyper::Error),

    /// No transport was published before the caller's deadline.
    #[error("no fronted transport configured within {0:?}")]
    ConfigurationUnavailable(Duration),
}
