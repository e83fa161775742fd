pub mod api;
pub mod auth;
pub mod backoff;
pub mod cache;
pub mod channel;
pub mod config;
pub mod location;
pub mod optimistic;
pub mod ordering;
pub mod session;
pub mod subscriptions;
pub mod synchronizer;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use channel::{ChannelClient, ChannelError, ConnectionState, ConnectionStatus};
pub use session::{LoginError, SessionContext};
pub use types::{CacheKey, DomainEvent, EventEnvelope, Topic};
