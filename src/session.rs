use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::api::{ApiError, RemoteApi};
use crate::auth::{AuthError, Session};
use crate::cache::QueryCache;
use crate::channel::{ChannelClient, ChannelError};
use crate::config::Config;
use crate::location::{LocationReporter, PositionSource};
use crate::optimistic::MutationCoordinator;
use crate::subscriptions::{Registry, SubscriptionHandle, TopicHandler};
use crate::synchronizer::CacheSynchronizer;
use crate::transport::Connector;
use crate::types::{CacheKey, Topic};

#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

pub struct SessionContext {
    pub session: Session,
    pub cache: Arc<QueryCache>,
    pub channel: Arc<ChannelClient>,
    pub mutations: MutationCoordinator,
    api: Arc<dyn RemoteApi>,
    config: Config,
    location: tokio::sync::Mutex<Option<Arc<LocationReporter>>>,
}

impl SessionContext {
    pub async fn login(
        config: Config,
        token: &str,
        api: Arc<dyn RemoteApi>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, LoginError> {
        let session = Session::from_token(token)?;
        let cache = Arc::new(QueryCache::new());
        let sync = Arc::new(CacheSynchronizer::new(cache.clone()));
        let channel = Arc::new(ChannelClient::new(config.channel.clone(), connector, sync));
        let mutations = MutationCoordinator::new(cache.clone(), api.clone());

        channel.connect(session.token()).await?;
        info!(user_id = %session.user_id, role = ?session.role, "session started");

        Ok(Self {
            session,
            cache,
            channel,
            mutations,
            api,
            config,
            location: tokio::sync::Mutex::new(None),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.channel.registry()
    }

    pub fn subscribe(&self, topic: Topic, handler: impl TopicHandler + 'static) -> SubscriptionHandle {
        self.registry().subscribe(topic, handler)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.registry().unsubscribe(handle)
    }

    pub async fn query(&self, key: &CacheKey) -> Result<Value, ApiError> {
        self.cache.get_or_fetch(key, self.api.as_ref()).await
    }

    pub async fn refresh_token(&mut self, token: &str) -> Result<(), LoginError> {
        let session = Session::from_token(token)?;
        self.channel.refresh_token(session.token()).await?;
        self.session = session;
        Ok(())
    }

    pub async fn location_reporter(&self, source: Arc<dyn PositionSource>) -> Arc<LocationReporter> {
        let mut slot = self.location.lock().await;
        slot.get_or_insert_with(|| {
            Arc::new(LocationReporter::new(
                source,
                self.channel.clone(),
                self.config.location_interval,
            ))
        })
        .clone()
    }

    pub async fn logout(self) {
        if let Some(reporter) = self.location.lock().await.take() {
            reporter.stop().await;
        }
        self.channel.registry().clear();
        self.channel.disconnect().await;
        self.channel.synchronizer().reset();
        self.cache.clear();
        info!(user_id = %self.session.user_id, "session ended");
    }
}
