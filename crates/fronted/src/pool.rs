//! The two-tier masquerade pool and its dial loop.
//!
//! `candidates` holds unproven entries in per-provider shuffled order;
//! `masquerades` holds entries with at least one successful handshake and
//! probe behind them. Dials prefer the proven tier and fall back to
//! candidates. A popped masquerade is owned exclusively by its
//! [`DialGrant`] until the grant decides its fate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::dial::{FaultKind, FrontDialer, IoStream};
use crate::error::Error;
use crate::idle::IdleTimeout;
use crate::masquerade::{Masquerade, Providers};
use crate::queue::Queue;

/// Which tier a dial prefers. Non-permanent failures flow back into the
/// preferred tier when the dial call returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tier {
    Masquerades,
    Candidates,
}

pub(crate) struct Pool {
    candidates: Queue<Arc<Masquerade>>,
    masquerades: Queue<Arc<Masquerade>>,
    dialer: Arc<dyn FrontDialer>,
    idle_timeout: Duration,
    to_cache: mpsc::Sender<Arc<Masquerade>>,
    commits: AtomicU64,
}

/// A live fronted connection plus custody of the masquerade that carried
/// it.
#[derive(Debug)]
pub(crate) struct Dialed {
    pub stream: IoStream,
    pub grant: DialGrant,
}

impl Pool {
    pub fn new(
        candidate_capacity: usize,
        vetted_capacity: usize,
        dialer: Arc<dyn FrontDialer>,
        idle_timeout: Duration,
        to_cache: mpsc::Sender<Arc<Masquerade>>,
    ) -> Self {
        Self {
            candidates: Queue::with_capacity(candidate_capacity),
            masquerades: Queue::with_capacity(vetted_capacity),
            dialer,
            idle_timeout,
            to_cache,
            commits: AtomicU64::new(0),
        }
    }

    /// Feed the candidate queue, shuffling each provider's entries so that
    /// consumption interleaves providers instead of probing one CDN's
    /// address block back to back.
    pub fn load_candidates(&self, providers: Providers) {
        for (provider, entries) in providers {
            let mut entries: Vec<Arc<Masquerade>> = entries.into_iter().map(Arc::new).collect();
            entries.shuffle(&mut rand::thread_rng());
            trace!(provider = %provider, count = entries.len(), "loading candidates");
            for masquerade in entries {
                self.push(Tier::Candidates, masquerade);
            }
        }
    }

    /// Inject a previously proven masquerade straight into the vetted
    /// tier.
    pub fn restore(&self, masquerade: Arc<Masquerade>) {
        self.push(Tier::Masquerades, masquerade);
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    pub fn masquerade_count(&self) -> usize {
        self.masquerades.len()
    }

    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Dial for runtime traffic: proven masquerades first, candidates as
    /// the fallback.
    pub async fn dial(self: &Arc<Self>) -> Result<Dialed, Error> {
        self.dial_with(Tier::Masquerades).await
    }

    /// Pop, dial, and classify until a connection is made or the pool runs
    /// dry.
    ///
    /// Permanent faults drop the masquerade for the rest of the process;
    /// transient faults park it on a retry-later list that flows back into
    /// the preferred tier when the call returns. One call therefore
    /// attempts each masquerade at most once.
    pub async fn dial_with(self: &Arc<Self>, preferred: Tier) -> Result<Dialed, Error> {
        let mut retry_later: Vec<Arc<Masquerade>> = Vec::new();
        let outcome = loop {
            let Some(masquerade) = self.pop_from(preferred) else {
                break Err(Error::NoMasqueradesAvailable);
            };
            match self.dialer.dial(&masquerade).await {
                Ok(stream) => {
                    trace!(masquerade = %masquerade, "fronted connection established");
                    #[cfg(feature = "metrics")]
                    metrics::counter!("fronted_dial_total", "result" => "ok").increment(1);
                    let stream: IoStream = Box::new(IdleTimeout::new(stream, self.idle_timeout));
                    break Ok(Dialed {
                        stream,
                        grant: DialGrant {
                            pool: Arc::clone(self),
                            target: preferred,
                            masquerade: Some(masquerade),
                        },
                    });
                }
                Err(err) => match err.fault_kind() {
                    FaultKind::Permanent => {
                        debug!(masquerade = %masquerade, error = %err, "discarding masquerade after permanent fault");
                        #[cfg(feature = "metrics")]
                        metrics::counter!("fronted_dial_total", "result" => "permanent_fault")
                            .increment(1);
                    }
                    FaultKind::Transient => {
                        trace!(masquerade = %masquerade, error = %err, "transient dial failure, keeping masquerade");
                        #[cfg(feature = "metrics")]
                        metrics::counter!("fronted_dial_total", "result" => "transient_fault")
                            .increment(1);
                        retry_later.push(masquerade);
                    }
                },
            }
        };
        for masquerade in retry_later {
            self.push(preferred, masquerade);
        }
        outcome
    }

    fn pop_from(&self, preferred: Tier) -> Option<Arc<Masquerade>> {
        if let Some(masquerade) = self.queue(preferred).try_pop() {
            return Some(masquerade);
        }
        if preferred != Tier::Candidates {
            trace!("no vetted masquerade, falling back to a candidate");
            return self.candidates.try_pop();
        }
        None
    }

    fn queue(&self, tier: Tier) -> &Queue<Arc<Masquerade>> {
        match tier {
            Tier::Masquerades => &self.masquerades,
            Tier::Candidates => &self.candidates,
        }
    }

    fn push(&self, tier: Tier, masquerade: Arc<Masquerade>) {
        if let Err(masquerade) = self.queue(tier).try_push(masquerade) {
            // Queues are sized for every configured entry; this only fires
            // if an entry was duplicated upstream.
            warn!(masquerade = %masquerade, "queue full, dropping masquerade");
        }
    }

    fn offer_to_cache(&self, masquerade: Arc<Masquerade>) {
        match self.to_cache.try_send(masquerade) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Write-back has fallen behind. Dropping is safe: the
                // masquerade is back in the vetted queue and will be
                // offered again on its next use.
                trace!("cache write-back behind, dropping offer");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Exclusive custody of a masquerade between its pop and its verdict.
///
/// Exactly one of three things happens: [`commit`](Self::commit) proves it
/// (vetted tier, fresh timestamp, offered to persistence),
/// [`discard`](Self::discard) drops it, or the grant is dropped and the
/// masquerade flows back to its tier unproven.
pub(crate) struct DialGrant {
    pool: Arc<Pool>,
    target: Tier,
    masquerade: Option<Arc<Masquerade>>,
}

impl std::fmt::Debug for DialGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialGrant")
            .field("target", &self.target)
            .field("masquerade", &self.masquerade)
            .finish_non_exhaustive()
    }
}

impl DialGrant {
    pub fn commit(mut self) {
        if let Some(masquerade) = self.masquerade.take() {
            masquerade.mark_vetted(SystemTime::now());
            self.pool.push(Tier::Masquerades, Arc::clone(&masquerade));
            self.pool.offer_to_cache(masquerade);
            self.pool.commits.fetch_add(1, Ordering::Relaxed);
            #[cfg(feature = "metrics")]
            metrics::counter!("fronted_commit_total").increment(1);
        }
    }

    pub fn discard(mut self) {
        if let Some(masquerade) = self.masquerade.take() {
            trace!(masquerade = %masquerade, "masquerade discarded");
        }
    }
}

impl Drop for DialGrant {
    fn drop(&mut self) {
        if let Some(masquerade) = self.masquerade.take() {
            self.pool.push(self.target, masquerade);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dial::{DialError, IoStream};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::io;

    /// Replays a queue of scripted dial outcomes.
    struct SequenceDialer {
        outcomes: Mutex<VecDeque<Result<(), DialError>>>,
    }

    impl SequenceDialer {
        fn new(outcomes: Vec<Result<(), DialError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
            })
        }
    }

    #[async_trait]
    impl FrontDialer for SequenceDialer {
        async fn dial(&self, _masquerade: &Masquerade) -> Result<IoStream, DialError> {
            match self.outcomes.lock().pop_front() {
                Some(Ok(())) => {
                    let (client, server) = tokio::io::duplex(64);
                    // Keep the peer half alive for the test's duration.
                    tokio::spawn(async move {
                        let _server = server;
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    });
                    Ok(Box::new(client))
                }
                Some(Err(err)) => Err(err),
                None => Err(DialError::Connect(io::Error::from(
                    io::ErrorKind::ConnectionRefused,
                ))),
            }
        }
    }

    fn pool_with(dialer: Arc<dyn FrontDialer>, capacity: usize) -> Arc<Pool> {
        let (to_cache, _offers) = mpsc::channel(capacity.max(1));
        Arc::new(Pool::new(
            capacity,
            capacity,
            dialer,
            Duration::from_secs(70),
            to_cache,
        ))
    }

    fn seed_candidates(pool: &Pool, count: usize) {
        let mut providers: Providers = HashMap::new();
        providers.insert(
            "test".into(),
            (0..count)
                .map(|n| Masquerade::new(format!("m{n}.example.net"), format!("192.0.2.{n}")))
                .collect(),
        );
        pool.load_candidates(providers);
    }

    fn cert_error() -> DialError {
        DialError::Handshake(io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer),
        ))
    }

    #[test]
    fn loading_keeps_every_candidate() {
        let pool = pool_with(SequenceDialer::new(vec![]), 16);
        seed_candidates(&pool, 16);
        assert_eq!(pool.candidate_count(), 16);
        assert_eq!(pool.masquerade_count(), 0);
    }

    #[tokio::test]
    async fn transient_failures_keep_the_masquerade() {
        let dialer = SequenceDialer::new(vec![Err(DialError::Connect(io::Error::from(
            io::ErrorKind::ConnectionRefused,
        )))]);
        let pool = pool_with(dialer, 1);
        seed_candidates(&pool, 1);

        let err = pool.dial().await.unwrap_err();
        assert!(matches!(err, Error::NoMasqueradesAvailable));
        // Flushed back to the preferred (vetted) tier after the call.
        assert_eq!(pool.masquerade_count(), 1);
        assert_eq!(pool.candidate_count(), 0);
    }

    #[tokio::test]
    async fn permanent_failures_evict_the_masquerade() {
        let dialer = SequenceDialer::new(vec![Err(cert_error()), Ok(())]);
        let pool = pool_with(dialer, 2);
        seed_candidates(&pool, 2);

        let dialed = pool.dial().await.unwrap();
        drop(dialed);
        // One evicted for good, the survivor re-queued on grant drop.
        assert_eq!(pool.candidate_count() + pool.masquerade_count(), 1);
    }

    #[tokio::test]
    async fn committed_masquerades_are_promoted_and_stamped() {
        let dialer = SequenceDialer::new(vec![Ok(())]);
        let pool = pool_with(dialer, 1);
        seed_candidates(&pool, 1);

        let before = SystemTime::now();
        let dialed = pool.dial().await.unwrap();
        dialed.grant.commit();

        assert_eq!(pool.masquerade_count(), 1);
        assert_eq!(pool.candidate_count(), 0);
        assert_eq!(pool.commit_count(), 1);

        let promoted = pool.masquerades.try_pop().unwrap();
        assert!(promoted.last_vetted().unwrap() >= before);
    }

    #[tokio::test]
    async fn dropped_grants_requeue_without_vetting() {
        let dialer = SequenceDialer::new(vec![Ok(())]);
        let pool = pool_with(dialer, 1);
        seed_candidates(&pool, 1);

        let dialed = pool.dial().await.unwrap();
        drop(dialed);

        assert_eq!(pool.masquerade_count(), 1);
        assert_eq!(pool.commit_count(), 0);
        let kept = pool.masquerades.try_pop().unwrap();
        assert!(kept.last_vetted().is_none());
    }

    #[tokio::test]
    async fn vetting_dials_do_not_fall_back_anywhere() {
        let dialer = SequenceDialer::new(vec![]);
        let pool = pool_with(dialer, 1);
        // Vetted tier populated, candidates empty: a candidate-tier dial
        // must not steal proven masquerades.
        pool.restore(Arc::new(Masquerade::new("m.example.net", "192.0.2.1")));

        let err = pool.dial_with(Tier::Candidates).await.unwrap_err();
        assert!(matches!(err, Error::NoMasqueradesAvailable));
        assert_eq!(pool.masquerade_count(), 1);
    }

    #[tokio::test]
    async fn cache_offers_never_block() {
        let (to_cache, _offers) = mpsc::channel(1);
        let dialer = SequenceDialer::new(vec![Ok(()), Ok(())]);
        let pool = Arc::new(Pool::new(2, 2, dialer, Duration::from_secs(70), to_cache));
        seed_candidates(&pool, 2);

        // Nobody drains the channel; the second offer overflows silently.
        pool.dial().await.unwrap().grant.commit();
        pool.dial().await.unwrap().grant.commit();
        assert_eq!(pool.commit_count(), 2);
        assert_eq!(pool.masquerade_count(), 2);
    }
}
