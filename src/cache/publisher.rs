//! Mutation publishing for the persistence layer.
//!
//! Each model owns one [`InvalidationRegistry`]. Write paths call the
//! model's [`MutationPublisher`] once per affected record after the change
//! has been applied.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use super::events::{Action, Fields, MutationEvent};
use super::registry::InvalidationRegistry;

/// Per-model invalidation registries, shared across a service.
#[derive(Clone, Default)]
pub struct Signals {
    models: Arc<DashMap<&'static str, Arc<InvalidationRegistry>>>,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry for `model`, created on first use.
    pub fn model(&self, model: &'static str) -> Arc<InvalidationRegistry> {
        self.models
            .entry(model)
            .or_insert_with(|| Arc::new(InvalidationRegistry::new()))
            .clone()
    }

    pub fn publisher(&self, model: &'static str) -> MutationPublisher {
        MutationPublisher {
            model,
            registry: self.model(model),
        }
    }
}

/// Emits one [`MutationEvent`] per affected record of a model.
#[derive(Clone)]
pub struct MutationPublisher {
    model: &'static str,
    registry: Arc<InvalidationRegistry>,
}

impl MutationPublisher {
    /// Publish a change and return how many subscriptions fired.
    pub fn publish(&self, action: Action, fields: Fields) -> usize {
        let event = MutationEvent::new(action, fields);
        let fired = self.registry.publish(&event);
        trace!(model = self.model, action = %action, fired, "mutation published");
        fired
    }

    pub fn created(&self, fields: Fields) -> usize {
        self.publish(Action::Create, fields)
    }

    pub fn updated(&self, fields: Fields) -> usize {
        self.publish(Action::Update, fields)
    }

    pub fn deleted(&self, fields: Fields) -> usize {
        self.publish(Action::Delete, fields)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cache::events::{InvalidationFilter, fields};

    #[test]
    fn models_get_independent_registries() {
        let signals = Signals::new();
        let lists = signals.model("lists");
        let entries = signals.model("entries");

        assert!(Arc::ptr_eq(&lists, &signals.model("lists")));
        assert!(!Arc::ptr_eq(&lists, &entries));
    }

    #[test]
    fn publisher_reaches_only_its_model() {
        let signals = Signals::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        signals.model("lists").subscribe(
            &InvalidationFilter::new().with("list_id", "l1"),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let record = fields([("list_id", "l1"), ("name", "groceries")]);
        assert_eq!(signals.publisher("entries").created(record.clone()), 0);
        assert_eq!(signals.publisher("lists").updated(record), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
