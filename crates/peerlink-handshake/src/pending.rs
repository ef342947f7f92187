//! Outstanding handshake replies, at most one per peer.

use peerlink_core::PeerScheme;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

type Slot<C, T> = watch::Sender<Option<(T, C)>>;

struct Entry<C, T> {
    generation: u64,
    context: C,
    tx: Slot<C, T>,
    /// Superseded requests whose replies are still due, oldest first.
    superseded: VecDeque<u64>,
}

impl<C, T> Entry<C, T> {
    fn new(generation: u64, context: C, tx: Slot<C, T>) -> Self {
        Self {
            generation,
            context,
            tx,
            superseded: VecDeque::new(),
        }
    }
}

/// Pending replies keyed by peer scheme.
///
/// `C` is the context the request was sent with (the session token for a
/// wakeup); it is handed back alongside the reply so every waiter sees the
/// context that actually produced it.
pub(crate) struct PendingTable<C, T> {
    entries: Mutex<HashMap<PeerScheme, Entry<C, T>>>,
    next_generation: AtomicU64,
}

/// A waiter's view of one pending entry.
pub(crate) struct Join<C, T> {
    pub generation: u64,
    pub context: C,
    /// The caller must send the request; otherwise one is already in flight.
    pub fresh: bool,
    rx: watch::Receiver<Option<(T, C)>>,
}

/// What [`PendingTable::resolve`] did with a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution {
    Delivered,
    /// The reply answered a superseded request and was discarded.
    Stale,
    /// Nothing was pending.
    Unsolicited,
}

pub(crate) enum Wait<C, T> {
    Resolved(T, C),
    /// The entry was dropped without a reply.
    Abandoned,
    TimedOut,
}

impl<C: Clone, T: Clone> Join<C, T> {
    pub async fn wait(mut self, timeout: Duration) -> Wait<C, T> {
        match tokio::time::timeout(timeout, self.rx.wait_for(Option::is_some)).await {
            Err(_) => Wait::TimedOut,
            Ok(Err(_)) => Wait::Abandoned,
            Ok(Ok(value)) => match (*value).clone() {
                Some((reply, context)) => Wait::Resolved(reply, context),
                None => Wait::Abandoned,
            },
        }
    }
}

impl<C: Clone, T: Clone> PendingTable<C, T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PeerScheme, Entry<C, T>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Wait on the pending entry for `scheme`, creating one with
    /// `context()` if none exists.
    pub fn join(&self, scheme: &PeerScheme, context: impl FnOnce() -> C) -> Join<C, T> {
        let mut entries = self.lock();
        if let Some(entry) = entries.get(scheme) {
            return Join {
                generation: entry.generation,
                context: entry.context.clone(),
                fresh: false,
                rx: entry.tx.subscribe(),
            };
        }

        let generation = self.generation();
        let context = context();
        let (tx, rx) = watch::channel(None);
        entries.insert(scheme.clone(), Entry::new(generation, context.clone(), tx));
        Join {
            generation,
            context,
            fresh: true,
            rx,
        }
    }

    /// Replace the context of any pending entry. Existing waiters stay
    /// attached and will see the reply to the new request; the reply to the
    /// request being replaced is discarded when it arrives.
    pub fn supersede(&self, scheme: &PeerScheme, context: C) -> Join<C, T> {
        let generation = self.generation();
        let mut entries = self.lock();
        let rx = match entries.get_mut(scheme) {
            Some(entry) => {
                entry.superseded.push_back(entry.generation);
                entry.generation = generation;
                entry.context = context.clone();
                entry.tx.subscribe()
            }
            None => {
                let (tx, rx) = watch::channel(None);
                entries.insert(scheme.clone(), Entry::new(generation, context.clone(), tx));
                rx
            }
        };
        Join {
            generation,
            context,
            fresh: true,
            rx,
        }
    }

    /// Deliver `reply` to every waiter on `scheme`, running `before_wake`
    /// first.
    ///
    /// Replies arrive in request order, so while superseded requests are
    /// outstanding the oldest one is taken to be answered and the reply is
    /// dropped.
    pub fn resolve(
        &self,
        scheme: &PeerScheme,
        reply: T,
        before_wake: impl FnOnce(&C, &T),
    ) -> Resolution {
        let entry = {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(scheme) else {
                return Resolution::Unsolicited;
            };
            if entry.superseded.pop_front().is_some() {
                return Resolution::Stale;
            }
            match entries.remove(scheme) {
                Some(entry) => entry,
                None => return Resolution::Unsolicited,
            }
        };
        before_wake(&entry.context, &reply);
        entry.tx.send_replace(Some((reply, entry.context)));
        Resolution::Delivered
    }

    /// The request for `generation` was never delivered, so no reply will
    /// come for it. Drops the entry if that request is the current one.
    pub fn unsent(&self, scheme: &PeerScheme, generation: u64) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(scheme) else {
            return false;
        };
        if entry.generation == generation {
            entries.remove(scheme);
            return true;
        }
        entry.superseded.retain(|g| *g != generation);
        false
    }

    /// Drop the entry for `scheme` if it still belongs to `generation`.
    pub fn abandon(&self, scheme: &PeerScheme, generation: u64) -> bool {
        let mut entries = self.lock();
        match entries.get(scheme) {
            Some(entry) if entry.generation == generation => {
                entries.remove(scheme);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, scheme: &PeerScheme) -> bool {
        self.lock().contains_key(scheme)
    }

    /// Drop every entry; waiters see `Abandoned`.
    pub fn clear(&self) {
        self.lock().clear();
    }
}
