use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::cache::QueryCache;
use crate::ordering::{ApplyDecision, OrderingGuard};
use crate::types::{AvailabilityTarget, CacheKey, DomainEvent, EventEnvelope, Topic};

#[derive(Debug, Clone, PartialEq)]
pub enum CacheAction {
    Patch { key: CacheKey, value: Value },
    PatchField {
        key: CacheKey,
        field: &'static str,
        value: Value,
    },
    MarkStale { key: CacheKey },
    MarkStaleEntity { entity: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied,
    Duplicate,
    Recovered,
}

pub struct CacheSynchronizer {
    cache: Arc<QueryCache>,
    ordering: OrderingGuard,
}

impl CacheSynchronizer {
    pub fn new(cache: Arc<QueryCache>) -> Self {
        Self {
            cache,
            ordering: OrderingGuard::new(),
        }
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub async fn apply(&self, envelope: &EventEnvelope) -> SyncOutcome {
        let decision = self.ordering.classify(&envelope.topic, envelope.seq);
        debug!(topic = %envelope.topic, seq = envelope.seq, ?decision, "classified event");

        let outcome = match decision {
            ApplyDecision::DropOld => return SyncOutcome::Duplicate,
            ApplyDecision::ApplyInOrder => SyncOutcome::Applied,
            ApplyDecision::GapDetected { expected, got } => {
                warn!(topic = %envelope.topic, expected, got, "sequence gap, marking topic stale");
                for key in keys_for_topic(&envelope.topic) {
                    self.cache.mark_stale(&key).await;
                }
                SyncOutcome::Recovered
            }
        };

        for action in actions_for(&envelope.event) {
            self.run(action).await;
        }

        outcome
    }

    async fn run(&self, action: CacheAction) {
        match action {
            CacheAction::Patch { key, value } => {
                self.cache.put(key, value).await;
            }
            CacheAction::PatchField { key, field, value } => {
                if !self.cache.patch_field(&key, field, value).await {
                    debug!(%key, field, "nothing cached to patch");
                }
            }
            CacheAction::MarkStale { key } => {
                self.cache.mark_stale(&key).await;
            }
            CacheAction::MarkStaleEntity { entity } => {
                self.cache.mark_stale_by_entity(entity).await;
            }
        }
    }

    // next event on the topic becomes the baseline
    pub fn forget(&self, topic: &Topic) {
        self.ordering.reset(topic);
    }

    pub fn reset(&self) {
        self.ordering.clear();
    }
}

fn replace_or_stale(key: CacheKey, value: &Option<Value>) -> CacheAction {
    match value {
        Some(value) => CacheAction::Patch {
            key,
            value: value.clone(),
        },
        None => CacheAction::MarkStale { key },
    }
}

/// Maps an event to cache actions. Every action is a set, never a delta, so
/// re-applying an event leaves the cache unchanged.
pub fn actions_for(event: &DomainEvent) -> Vec<CacheAction> {
    match event {
        DomainEvent::OrderStatusChanged {
            order_id, order, ..
        } => vec![
            replace_or_stale(CacheKey::order(order_id), order),
            CacheAction::MarkStaleEntity { entity: "orders" },
        ],
        DomainEvent::DriverAssigned {
            order_id, order, ..
        } => vec![
            replace_or_stale(CacheKey::order(order_id), order),
            CacheAction::MarkStaleEntity {
                entity: "available-orders",
            },
        ],
        DomainEvent::DriverLocationUpdated {
            order_id,
            driver_id,
            location,
        } => vec![CacheAction::Patch {
            key: CacheKey::driver_location(order_id),
            value: json!({ "driver_id": driver_id, "location": location }),
        }],
        DomainEvent::NewOrderReceived {
            restaurant_id,
            order_id,
            order,
        } => {
            let mut actions = vec![CacheAction::MarkStale {
                key: CacheKey::restaurant_orders(restaurant_id),
            }];
            if let Some(order) = order {
                actions.push(CacheAction::Patch {
                    key: CacheKey::order(order_id),
                    value: order.clone(),
                });
            }
            actions
        }
        DomainEvent::AvailabilityChanged { target, available } => match target {
            AvailabilityTarget::Restaurant { restaurant_id } => vec![CacheAction::PatchField {
                key: CacheKey::restaurant(restaurant_id),
                field: "is_open",
                value: json!(available),
            }],
            AvailabilityTarget::MenuItem {
                restaurant_id,
                item_id,
            } => vec![
                CacheAction::PatchField {
                    key: CacheKey::menu_item(restaurant_id, item_id),
                    field: "available",
                    value: json!(available),
                },
                CacheAction::MarkStale {
                    key: CacheKey::menu(restaurant_id),
                },
            ],
            AvailabilityTarget::Driver { driver_id } => vec![CacheAction::PatchField {
                key: CacheKey::driver_profile(driver_id),
                field: "is_available",
                value: json!(available),
            }],
        },
    }
}

pub fn keys_for_topic(topic: &Topic) -> Vec<CacheKey> {
    match topic {
        Topic::Order(id) => vec![CacheKey::order(id), CacheKey::driver_location(id)],
        Topic::Restaurant(id) => vec![
            CacheKey::restaurant(id),
            CacheKey::restaurant_orders(id),
            CacheKey::menu(id),
        ],
        Topic::Driver(id) => vec![CacheKey::driver_profile(id), CacheKey::available_orders()],
    }
}
