use std::sync::Arc;

use parley_storage::{MessageId, ScopeKey};

use crate::cache::ScopeCache;
use crate::events::{EventKind, LiveEvent};
use crate::live::{LiveChannel, Subscription};

/// A live event that could not be folded into the cache and was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryAnomaly {
    /// An update for a message outside the loaded window.
    UpdateForUnloadedMessage { message_id: MessageId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    OtherScope,
    Inserted,
    Duplicate,
    Replaced,
    Discarded(DeliveryAnomaly),
}

/// Folds live events for one scope into its page cache.
#[derive(Clone)]
pub struct Reconciler {
    scope: ScopeKey,
    cache: Arc<ScopeCache>,
}

impl Reconciler {
    pub fn new(cache: Arc<ScopeCache>) -> Self {
        Self {
            scope: cache.scope(),
            cache,
        }
    }

    pub fn apply(&self, event: &LiveEvent) -> ApplyOutcome {
        if event.scope() != self.scope {
            return ApplyOutcome::OtherScope;
        }

        let message = event.message().clone();
        let message_id = message.id;
        let outcome = match event {
            LiveEvent::Created(_) => self.cache.mutate(|set| {
                if set.prepend_created(message) {
                    (ApplyOutcome::Inserted, true)
                } else {
                    (ApplyOutcome::Duplicate, false)
                }
            }),
            LiveEvent::Updated(_) => self.cache.mutate(|set| {
                if set.replace_updated(message) {
                    (ApplyOutcome::Replaced, true)
                } else {
                    let anomaly = DeliveryAnomaly::UpdateForUnloadedMessage { message_id };
                    (ApplyOutcome::Discarded(anomaly), false)
                }
            }),
        };

        match outcome {
            ApplyOutcome::Discarded(anomaly) => {
                tracing::warn!(scope = %self.scope, ?anomaly, "live update discarded");
            }
            ApplyOutcome::Duplicate => {
                tracing::debug!(scope = %self.scope, %message_id, "duplicate live insert ignored");
            }
            _ => {
                tracing::trace!(scope = %self.scope, %message_id, ?outcome, "live event applied");
            }
        }
        outcome
    }

    /// Subscribes to both event kinds. Dropping the returned handles detaches the reconciler.
    pub fn attach(&self, channel: &LiveChannel) -> Vec<Subscription> {
        EventKind::ALL
            .into_iter()
            .map(|kind| {
                let reconciler = self.clone();
                channel.subscribe(kind, move |event| {
                    reconciler.apply(event);
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Page;
    use crate::page::tests::{message, scope};

    #[test]
    fn created_then_duplicate_then_update() {
        let scope = scope();
        let cache = Arc::new(ScopeCache::new(scope));
        let reconciler = Reconciler::new(cache.clone());

        let live = message(scope, "A", 1);
        assert_eq!(
            reconciler.apply(&LiveEvent::Created(live.clone())),
            ApplyOutcome::Inserted
        );
        assert_eq!(
            reconciler.apply(&LiveEvent::Created(live.clone())),
            ApplyOutcome::Duplicate
        );

        let mut edited = live.clone();
        edited.content = "A2".to_string();
        assert_eq!(
            reconciler.apply(&LiveEvent::Updated(edited.clone())),
            ApplyOutcome::Replaced
        );
        assert_eq!(cache.snapshot(), vec![edited]);
    }

    #[test]
    fn update_outside_window_is_discarded() {
        let scope = scope();
        let cache = Arc::new(ScopeCache::new(scope));
        cache.mutate(|set| {
            set.append_fetched(Page::from_fetch(scope, vec![message(scope, "x", 1)], 10));
            ((), true)
        });
        let reconciler = Reconciler::new(cache.clone());
        let before = cache.revision();

        let ghost = message(scope, "ghost", 2);
        let outcome = reconciler.apply(&LiveEvent::Updated(ghost.clone()));
        assert_eq!(
            outcome,
            ApplyOutcome::Discarded(DeliveryAnomaly::UpdateForUnloadedMessage {
                message_id: ghost.id
            })
        );
        assert_eq!(cache.revision(), before);
        assert_eq!(cache.snapshot().len(), 1);
    }

    #[test]
    fn events_for_other_scopes_are_ignored() {
        let cache = Arc::new(ScopeCache::new(scope()));
        let reconciler = Reconciler::new(cache.clone());
        let outcome = reconciler.apply(&LiveEvent::Created(message(scope(), "elsewhere", 1)));
        assert_eq!(outcome, ApplyOutcome::OtherScope);
        assert!(cache.snapshot().is_empty());
    }

    #[test]
    fn attach_routes_channel_events() {
        let scope = scope();
        let cache = Arc::new(ScopeCache::new(scope));
        let channel = LiveChannel::new();
        let subscriptions = Reconciler::new(cache.clone()).attach(&channel);
        assert_eq!(subscriptions.len(), 2);

        channel.dispatch(&LiveEvent::Created(message(scope, "A", 1)));
        assert_eq!(cache.snapshot().len(), 1);

        drop(subscriptions);
        channel.dispatch(&LiveEvent::Created(message(scope, "B", 2)));
        assert_eq!(cache.snapshot().len(), 1);
    }
}
