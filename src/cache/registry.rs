//! Filter-indexed invalidation registry.
//!
//! Subscriptions live in a multi-way tree whose edges are `(field, value)`
//! pairs. A filter `{a: 1, c: 3, b: 2}` is inserted along the chain
//! `(a,1) → (b,2) → (c,3)` and its callback hangs off the last node:
//!
//! ```text
//! <root>
//!   (a,1)
//!     (b,2)          {I}
//!       (c,3)        {F}
//!     (b,3)          {G}
//!   (b,4)
//!     (d,5)          {H}
//! ```
//!
//! Publishing walks the tree with the event's sorted pairs. Every node the
//! walk reaches fires its callbacks, and at every node each remaining pair is
//! tried as an edge, so one event can descend into several siblings. A
//! subscription fires iff its sorted pairs are a subsequence of the event's.
//! Callbacks are single-shot: they are detached when they fire.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::counter;
use tracing::debug;

use super::events::{FieldValue, InvalidationFilter, MutationEvent};
use super::lock::mutex_lock;

const SOURCE: &str = "cache::registry";
const METRIC_INVALIDATION_FIRED: &str = "peercache_invalidation_fired_total";

type Pair = (String, FieldValue);

/// Invoked once when a matching mutation is published.
pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// Handle for removing a subscription before it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Node {
    children: HashMap<Pair, Node>,
    callbacks: Vec<(SubscriptionId, Callback)>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.callbacks.is_empty() && self.children.is_empty()
    }

    fn collect(&mut self, remaining: &[Pair], fired: &mut Vec<(SubscriptionId, Callback)>) {
        fired.append(&mut self.callbacks);

        for (index, pair) in remaining.iter().enumerate() {
            if let Some(child) = self.children.get_mut(pair) {
                child.collect(&remaining[index + 1..], fired);
            }
        }
    }

    /// Remove `id` from the node at `path`, pruning nodes left empty.
    fn detach(&mut self, path: &[Pair], id: SubscriptionId) -> bool {
        let Some((head, rest)) = path.split_first() else {
            let before = self.callbacks.len();
            self.callbacks.retain(|(existing, _)| *existing != id);
            return self.callbacks.len() != before;
        };

        let Some(child) = self.children.get_mut(head) else {
            return false;
        };
        let removed = child.detach(rest, id);
        if child.is_empty() {
            self.children.remove(head);
        }
        removed
    }

    fn prune(&mut self, path: &[Pair]) {
        let Some((head, rest)) = path.split_first() else {
            return;
        };
        if let Some(child) = self.children.get_mut(head) {
            child.prune(rest);
            if child.is_empty() {
                self.children.remove(head);
            }
        }
    }
}

#[derive(Default)]
struct Tree {
    root: Node,
    paths: HashMap<SubscriptionId, Vec<Pair>>,
}

/// Publish/subscribe broker keyed by field filters.
#[derive(Default)]
pub struct InvalidationRegistry {
    tree: Mutex<Tree>,
    next_id: AtomicU64,
}

impl InvalidationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `callback` to the node addressed by `filter`.
    ///
    /// An empty filter (or one made only of wildcards) sits on the root and
    /// fires on the next event of any shape.
    pub fn subscribe(&self, filter: &InvalidationFilter, callback: Callback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let path = filter.sorted_pairs();

        let mut tree = mutex_lock(&self.tree, SOURCE, "subscribe");
        let mut node = &mut tree.root;
        for pair in &path {
            node = node.children.entry(pair.clone()).or_default();
        }
        node.callbacks.push((id, callback));
        tree.paths.insert(id, path);

        id
    }

    /// Remove a subscription that has not fired yet.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut tree = mutex_lock(&self.tree, SOURCE, "unsubscribe");
        let Some(path) = tree.paths.remove(&id) else {
            return false;
        };
        tree.root.detach(&path, id)
    }

    /// Fire and detach every subscription matched by `event`.
    ///
    /// Callbacks run after the tree lock is released, so they may subscribe,
    /// unsubscribe or publish again. Returns the number fired.
    pub fn publish(&self, event: &MutationEvent) -> usize {
        let pairs = event.sorted_pairs();
        let mut fired = Vec::new();

        {
            let mut tree = mutex_lock(&self.tree, SOURCE, "publish");
            tree.root.collect(&pairs, &mut fired);
            for (id, _) in &fired {
                if let Some(path) = tree.paths.remove(id) {
                    tree.root.prune(&path);
                }
            }
        }

        for (_, callback) in &fired {
            callback();
        }

        if !fired.is_empty() {
            counter!(METRIC_INVALIDATION_FIRED).increment(fired.len() as u64);
            debug!(
                action = %event.action,
                fired = fired.len(),
                "invalidation subscriptions fired"
            );
        }

        fired.len()
    }

    /// Number of subscriptions waiting to fire.
    pub fn len(&self) -> usize {
        mutex_lock(&self.tree, SOURCE, "len").paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for InvalidationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationRegistry")
            .field("subscriptions", &self.len())
            .finish()
    }
}
