//! Per-SPN security context cache.
//!
//! Each SPN owns one slot guarded by a `tokio::sync::Mutex` in a `DashMap`
//! lock table. A [`ContextLease`] is the owned guard over that slot, so
//! negotiation for one SPN is totally ordered while different SPNs proceed
//! independently. Committed outcomes are mirrored into a lock-free status
//! table for observers.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::kerberos::ContextHandle;
use crate::spn::Spn;

/// Handshake states of one security context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    NotStarted,
    TokenGenerated,
    Sent,
    ContinueChallenge,
    Accepted,
    Rejected,
}

impl NegotiationState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected)
    }
}

/// The security context bound to one SPN.
pub struct SecurityContext {
    spn: Spn,
    pub(crate) state: NegotiationState,
    pub(crate) handle: Option<Box<dyn ContextHandle>>,
    pub(crate) established_at: Option<Instant>,
    pub(crate) expires_at: Option<Instant>,
    pub(crate) credential_expires_at: Option<Instant>,
    pub(crate) failed: bool,
    generation: u64,
}

impl SecurityContext {
    fn stub(spn: Spn, generation: u64) -> Self {
        Self {
            spn,
            state: NegotiationState::NotStarted,
            handle: None,
            established_at: None,
            expires_at: None,
            credential_expires_at: None,
            failed: false,
            generation,
        }
    }

    #[must_use]
    pub fn spn(&self) -> &Spn {
        &self.spn
    }

    #[must_use]
    pub fn state(&self) -> NegotiationState {
        self.state
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn established_at(&self) -> Option<Instant> {
        self.established_at
    }

    #[must_use]
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Accepted by the backend and not failed since.
    #[must_use]
    pub fn is_established(&self) -> bool {
        self.state == NegotiationState::Accepted && !self.failed && self.handle.is_some()
    }

    /// Established with more than `margin` of lifetime left at `now`.
    #[must_use]
    pub fn is_reusable(&self, now: Instant, margin: Duration) -> bool {
        self.is_established()
            && self
                .expires_at
                .is_some_and(|exp| exp.saturating_duration_since(now) > margin)
    }

    pub(crate) fn mark_failed(&mut self) {
        self.failed = true;
        self.state = NegotiationState::Rejected;
        self.handle = None;
    }
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("spn", &self.spn)
            .field("state", &self.state)
            .field("has_handle", &self.handle.is_some())
            .field("expires_at", &self.expires_at)
            .field("failed", &self.failed)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Last committed outcome for an SPN, readable without the slot lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextStatus {
    pub state: NegotiationState,
    pub generation: u64,
    pub expires_at: Option<Instant>,
}

/// Concurrency-safe store of security contexts keyed by SPN.
pub struct ContextCache {
    slots: DashMap<Spn, Arc<Mutex<SecurityContext>>>,
    committed: Arc<DashMap<Spn, ContextStatus>>,
    next_generation: AtomicU64,
    margin: Duration,
}

impl ContextCache {
    /// Create a cache that stops reusing contexts `margin` before they expire.
    #[must_use]
    pub fn new(margin: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            committed: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
            margin,
        }
    }

    fn generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    fn slot(&self, spn: &Spn) -> Arc<Mutex<SecurityContext>> {
        // Clone the Arc out so no DashMap shard lock is held across an await.
        self.slots
            .entry(spn.clone())
            .or_insert_with(|| Arc::new(Mutex::new(SecurityContext::stub(spn.clone(), 0))))
            .clone()
    }

    /// Take the exclusive lease for `spn`.
    ///
    /// The lease holds the existing context if it is still reusable, or a
    /// fresh `NotStarted` stub otherwise. Other callers for the same SPN wait
    /// here until the lease is released.
    pub async fn acquire(&self, spn: &Spn) -> ContextLease {
        let mut guard = self.slot(spn).lock_owned().await;

        let reused = guard.is_reusable(Instant::now(), self.margin);
        if !reused {
            trace!(spn = %spn, previous_generation = guard.generation, "installing fresh context");
            *guard = SecurityContext::stub(spn.clone(), self.generation());
        }

        ContextLease {
            guard,
            committed: Arc::clone(&self.committed),
            reused,
        }
    }

    /// Evict the context for `spn` if it is still the given generation.
    ///
    /// Returns whether anything was evicted. A newer context is left alone.
    pub async fn invalidate(&self, spn: &Spn, generation: u64) -> bool {
        let Some(slot) = self.slots.get(spn).map(|s| Arc::clone(s.value())) else {
            return false;
        };

        let mut guard = slot.lock().await;
        if guard.generation != generation || guard.failed {
            return false;
        }

        guard.mark_failed();
        self.committed.insert(
            spn.clone(),
            ContextStatus {
                state: NegotiationState::Rejected,
                generation,
                expires_at: None,
            },
        );
        debug!(spn = %spn, generation, "invalidated security context");
        true
    }

    /// Last committed status for `spn`.
    #[must_use]
    pub fn status(&self, spn: &Spn) -> Option<ContextStatus> {
        self.committed.get(spn).map(|s| *s.value())
    }

    /// Number of SPNs with a committed, accepted context that has not
    /// expired yet.
    #[must_use]
    pub fn established_count(&self) -> usize {
        let now = Instant::now();
        self.committed
            .iter()
            .filter(|s| {
                let status = s.value();
                status.state == NegotiationState::Accepted
                    && status.expires_at.is_some_and(|exp| exp > now)
            })
            .count()
    }

    /// Number of SPNs that have a slot.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn margin(&self) -> Duration {
        self.margin
    }
}

/// Exclusive access to one SPN's security context.
///
/// Dropping the lease releases the SPN without touching its committed
/// status; [`commit`](Self::commit) and [`invalidate`](Self::invalidate)
/// publish an outcome first.
pub struct ContextLease {
    guard: OwnedMutexGuard<SecurityContext>,
    committed: Arc<DashMap<Spn, ContextStatus>>,
    reused: bool,
}

impl ContextLease {
    /// Whether the lease came with an already established context.
    #[must_use]
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Publish the context's current state and release the SPN.
    pub fn commit(self) {
        let status = ContextStatus {
            state: self.guard.state,
            generation: self.guard.generation,
            expires_at: self.guard.expires_at,
        };
        self.committed.insert(self.guard.spn.clone(), status);
    }

    /// Mark the context failed, publish that, and release the SPN.
    pub fn invalidate(mut self) {
        self.guard.mark_failed();
        let status = ContextStatus {
            state: NegotiationState::Rejected,
            generation: self.guard.generation,
            expires_at: None,
        };
        self.committed.insert(self.guard.spn.clone(), status);
    }
}

impl Deref for ContextLease {
    type Target = SecurityContext;

    fn deref(&self) -> &SecurityContext {
        &self.guard
    }
}

impl DerefMut for ContextLease {
    fn deref_mut(&mut self) -> &mut SecurityContext {
        &mut self.guard
    }
}
