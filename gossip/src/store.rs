// Copyright (c) 2018-2022 The Botho Foundation

//! The Message Store (L2): a deduplicating, optionally-expiring set of
//! recently seen signed messages, parameterized by a comparator (spec.md
//! §4.2). Used for alive-message dedup per peer and chain-state dedup per
//! chainMac.

use std::time::{Duration, Instant};

/// The outcome of comparing an incoming message against one already held by
/// the store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Comparison {
    /// The two messages are the same message.
    Equal,
    /// The incoming message supersedes the existing one (existing is
    /// removed, incoming is kept).
    Supersedes,
    /// The incoming message invalidates the existing one without itself
    /// being stored (e.g. a revocation).
    Invalidates,
    /// The incoming message is older/weaker than the existing one; rejected
    /// without disturbing the existing entry.
    Stale,
    /// The two messages are unrelated; both may coexist.
    Distinct,
}

/// Decides how two messages of type `T` relate to each other. Implementors
/// typically group by some key embedded in `T` (peer pki-id, chainMac) and
/// compare a monotonic field (timestamp, seqNum) within that group,
/// returning [`Comparison::Distinct`] across groups.
pub trait MessageComparator<T>: Send + Sync {
    /// Compare `incoming` against `existing`.
    fn compare(&self, incoming: &T, existing: &T) -> Comparison;
}

struct StoredMessage<T> {
    message: T,
    expiry: Option<Instant>,
}

/// A deduplicating, optionally-expiring set of messages of type `T`.
pub struct MessageStore<T, C> {
    entries: std::sync::RwLock<Vec<StoredMessage<T>>>,
    comparator: C,
    pre_expire: Box<dyn Fn(&T) + Send + Sync>,
    post_expire: Box<dyn Fn(&T) + Send + Sync>,
}

impl<T: Clone, C: MessageComparator<T>> MessageStore<T, C> {
    /// Build a store around `comparator`, with no-op expire hooks.
    pub fn new(comparator: C) -> Self {
        Self {
            entries: std::sync::RwLock::new(Vec::new()),
            comparator,
            pre_expire: Box::new(|_| {}),
            post_expire: Box::new(|_| {}),
        }
    }

    /// Attach hooks invoked immediately before and after an entry is swept
    /// for expiry.
    pub fn with_expire_hooks(
        mut self,
        pre_expire: impl Fn(&T) + Send + Sync + 'static,
        post_expire: impl Fn(&T) + Send + Sync + 'static,
    ) -> Self {
        self.pre_expire = Box::new(pre_expire);
        self.post_expire = Box::new(post_expire);
        self
    }

    /// Insert `message`, optionally expiring at `expiry`. Returns `true` iff
    /// the message was inserted (i.e. not itself superseded or invalidated
    /// by an existing entry). Existing entries the message supersedes or
    /// invalidates are removed as a side effect.
    pub fn add(&self, message: T, expiry: Option<Instant>) -> bool {
        let mut entries = self.entries.write().unwrap();

        let mut blocked = false;
        let mut i = 0;
        while i < entries.len() {
            match self.comparator.compare(&message, &entries[i].message) {
                Comparison::Equal | Comparison::Stale => {
                    blocked = true;
                    i += 1;
                }
                Comparison::Supersedes => {
                    entries.remove(i);
                }
                Comparison::Invalidates => {
                    entries.remove(i);
                    blocked = true;
                }
                Comparison::Distinct => {
                    i += 1;
                }
            }
        }

        if blocked {
            return false;
        }

        entries.push(StoredMessage { message, expiry });
        true
    }

    /// Sweep entries whose expiry has passed as of `now`, invoking the
    /// pre/post-expire hooks around each removal.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut entries = self.entries.write().unwrap();
        let mut removed = 0;
        let mut i = 0;
        while i < entries.len() {
            let expired = matches!(entries[i].expiry, Some(expiry) if expiry <= now);
            if expired {
                (self.pre_expire)(&entries[i].message);
                let entry = entries.remove(i);
                (self.post_expire)(&entry.message);
                removed += 1;
            } else {
                i += 1;
            }
        }
        removed
    }

    /// Snapshot every currently-held message.
    pub fn snapshot(&self) -> Vec<T> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }

    /// Remove every entry matching `predicate`, invoking neither expire hook
    /// (used for outright eviction, not time-based expiry). Returns the
    /// number of entries removed.
    pub fn remove_where(&self, predicate: impl Fn(&T) -> bool) -> usize {
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|e| !predicate(&e.message));
        before - entries.len()
    }

    /// Number of currently-held messages.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A fixed duration from "now", for building an entry's expiry.
pub fn expiry_after(ttl: Duration) -> Instant {
    Instant::now() + ttl
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Timestamped {
        key: &'static str,
        seq: u64,
    }

    struct HighestSeqWins;

    impl MessageComparator<Timestamped> for HighestSeqWins {
        fn compare(&self, incoming: &Timestamped, existing: &Timestamped) -> Comparison {
            if incoming.key != existing.key {
                return Comparison::Distinct;
            }
            if incoming.seq == existing.seq {
                Comparison::Equal
            } else if incoming.seq > existing.seq {
                Comparison::Supersedes
            } else {
                Comparison::Stale
            }
        }
    }

    #[test]
    fn higher_seq_supersedes_lower() {
        let store = MessageStore::new(HighestSeqWins);
        assert!(store.add(Timestamped { key: "a", seq: 1 }, None));
        assert!(store.add(Timestamped { key: "a", seq: 2 }, None));
        assert_eq!(store.len(), 1);
        assert_eq!(store.snapshot()[0].seq, 2);
    }

    #[test]
    fn stale_message_is_rejected_without_disturbing_existing() {
        let store = MessageStore::new(HighestSeqWins);
        store.add(Timestamped { key: "a", seq: 5 }, None);
        assert!(!store.add(Timestamped { key: "a", seq: 3 }, None));
        assert_eq!(store.len(), 1);
        assert_eq!(store.snapshot()[0].seq, 5);
    }

    #[test]
    fn duplicate_message_is_rejected() {
        let store = MessageStore::new(HighestSeqWins);
        assert!(store.add(Timestamped { key: "a", seq: 1 }, None));
        assert!(!store.add(Timestamped { key: "a", seq: 1 }, None));
    }

    #[test]
    fn unrelated_messages_coexist() {
        let store = MessageStore::new(HighestSeqWins);
        store.add(Timestamped { key: "a", seq: 1 }, None);
        store.add(Timestamped { key: "b", seq: 1 }, None);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn sweep_removes_expired_entries_and_fires_hooks() {
        let pre: std::sync::Arc<std::sync::Mutex<Vec<&'static str>>> = Default::default();
        let post = pre.clone();
        let store = MessageStore::new(HighestSeqWins).with_expire_hooks(
            move |m| pre.lock().unwrap().push(m.key),
            move |m| post.lock().unwrap().push(m.key),
        );

        let past = Instant::now() - Duration::from_secs(1);
        store.add(Timestamped { key: "a", seq: 1 }, Some(past));
        store.add(Timestamped { key: "b", seq: 1 }, None);

        let removed = store.sweep(Instant::now());
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.snapshot()[0].key, "b");
    }
}
