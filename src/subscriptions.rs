use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::types::{EventEnvelope, Topic};

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
    #[error("malformed topic: {0}")]
    MalformedTopic(String),
    #[error("subscription to {topic} rejected: {reason}")]
    Rejected { topic: Topic, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicRequest {
    Subscribe(Topic),
    Unsubscribe(Topic),
}

pub trait TopicHandler: Send + Sync {
    fn on_event(&self, event: &EventEnvelope) -> anyhow::Result<()>;

    fn on_subscription_error(&self, error: &SubscriptionError) {
        warn!(error = %error, "subscription error");
    }
}

impl<F> TopicHandler for F
where
    F: Fn(&EventEnvelope) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &EventEnvelope) -> anyhow::Result<()> {
        self(event)
    }
}

pub type HandlerId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub topic: Topic,
    pub id: HandlerId,
}

type HandlerList = Vec<(HandlerId, Arc<dyn TopicHandler>)>;

pub struct Registry {
    handlers: DashMap<Topic, HandlerList>,
    requests: mpsc::UnboundedSender<TopicRequest>,
}

impl Registry {
    pub fn new(requests: mpsc::UnboundedSender<TopicRequest>) -> Self {
        Self {
            handlers: DashMap::new(),
            requests,
        }
    }

    pub fn subscribe(&self, topic: Topic, handler: impl TopicHandler + 'static) -> SubscriptionHandle {
        let id = Uuid::new_v4();
        let handler: Arc<dyn TopicHandler> = Arc::new(handler);
        {
            // wire requests are sent under the entry guard so they reach the
            // channel in the same order as the membership changes
            let mut list = self.handlers.entry(topic.clone()).or_default();
            list.push((id, handler));
            if list.len() == 1 {
                self.request(TopicRequest::Subscribe(topic.clone()));
            }
        }

        debug!(%topic, handler_id = %id, "subscribed");
        SubscriptionHandle { topic, id }
    }

    /// Removes one handler. Returns false if the handle was already gone.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let Entry::Occupied(mut slot) = self.handlers.entry(handle.topic.clone()) else {
            return false;
        };

        let before = slot.get().len();
        slot.get_mut().retain(|(id, _)| *id != handle.id);
        let removed = slot.get().len() != before;
        if slot.get().is_empty() {
            self.request(TopicRequest::Unsubscribe(handle.topic.clone()));
            slot.remove();
        }

        debug!(topic = %handle.topic, handler_id = %handle.id, removed, "unsubscribed");
        removed
    }

    /// Invokes every handler of the event's topic in registration order. A failing or
    /// panicking handler is logged and does not stop the remaining handlers.
    pub fn dispatch(&self, event: &EventEnvelope) -> usize {
        let handlers = self.snapshot(&event.topic);

        for (id, handler) in &handlers {
            match catch_unwind(AssertUnwindSafe(|| handler.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(topic = %event.topic, handler_id = %id, error = %e, "handler failed");
                }
                Err(_) => {
                    error!(topic = %event.topic, handler_id = %id, "handler panicked");
                }
            }
        }

        handlers.len()
    }

    pub fn reject(&self, topic: &Topic, reason: &str) {
        let error = SubscriptionError::Rejected {
            topic: topic.clone(),
            reason: reason.to_string(),
        };
        for (id, handler) in self.snapshot(topic) {
            if catch_unwind(AssertUnwindSafe(|| handler.on_subscription_error(&error))).is_err() {
                error!(%topic, handler_id = %id, "subscription error callback panicked");
            }
        }
    }

    pub fn active_topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.handlers.iter().map(|e| e.key().clone()).collect();
        topics.sort();
        topics
    }

    pub fn clear(&self) {
        for topic in self.active_topics() {
            if let Entry::Occupied(slot) = self.handlers.entry(topic.clone()) {
                self.request(TopicRequest::Unsubscribe(topic));
                slot.remove();
            }
        }
    }

    fn snapshot(&self, topic: &Topic) -> HandlerList {
        self.handlers
            .get(topic)
            .map(|l| l.value().clone())
            .unwrap_or_default()
    }

    fn request(&self, request: TopicRequest) {
        if self.requests.send(request).is_err() {
            debug!("channel gone, topic request dropped");
        }
    }
}
