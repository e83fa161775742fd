//! In-crate doubles for the transport, REST and geolocation collaborators.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use futures::{channel::mpsc as fmpsc, SinkExt};
use serde_json::Value;
use tokio::{sync::mpsc, time::Instant};

use crate::api::{ApiError, RemoteApi};
use crate::channel::ChannelError;
use crate::location::{PositionError, PositionSource};
use crate::transport::{Connector, FrameSink, FrameStream};
use crate::types::{CacheKey, ClientFrame, GeoPoint, ServerFrame};

pub(crate) enum Script {
    /// Open the link and acknowledge auth.
    Accept,
    /// Open the link and reject auth.
    Reject(String),
    /// Open the link and never answer.
    Silent,
    /// Fail to open.
    Refuse,
}

/// Server half of a mock link.
pub(crate) struct ServerSide {
    pub inbound: fmpsc::UnboundedReceiver<ClientFrame>,
    outbound: fmpsc::UnboundedSender<Result<ServerFrame, ChannelError>>,
}

impl ServerSide {
    pub fn push(&self, frame: ServerFrame) {
        let _ = self.outbound.unbounded_send(Ok(frame));
    }
}

pub(crate) struct MockConnector {
    script: Mutex<VecDeque<Script>>,
    opened: Mutex<Vec<Instant>>,
    links_tx: mpsc::UnboundedSender<ServerSide>,
    links_rx: Mutex<Option<mpsc::UnboundedReceiver<ServerSide>>>,
}

impl MockConnector {
    pub fn new(script: Vec<Script>) -> Arc<Self> {
        let (links_tx, links_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            script: Mutex::new(script.into()),
            opened: Mutex::new(Vec::new()),
            links_tx,
            links_rx: Mutex::new(Some(links_rx)),
        })
    }

    /// Server sides of opened links, in open order. Can be taken once.
    pub fn links(&self) -> mpsc::UnboundedReceiver<ServerSide> {
        self.links_rx
            .lock()
            .unwrap()
            .take()
            .expect("links already taken")
    }

    pub fn opened_at(&self) -> Vec<Instant> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self) -> Result<(FrameSink, FrameStream), ChannelError> {
        self.opened.lock().unwrap().push(Instant::now());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Refuse);

        let greeting = match step {
            Script::Refuse => return Err(ChannelError::Connection("connection refused".into())),
            Script::Accept => Some(ServerFrame::AuthOk {
                user_id: Some("user-1".into()),
            }),
            Script::Reject(reason) => Some(ServerFrame::AuthRejected { reason }),
            Script::Silent => None,
        };

        let (client_tx, inbound) = fmpsc::unbounded();
        let (outbound, server_rx) = fmpsc::unbounded();
        let side = ServerSide { inbound, outbound };
        if let Some(frame) = greeting {
            side.push(frame);
        }
        let _ = self.links_tx.send(side);

        let sink = client_tx.sink_map_err(|e| ChannelError::Connection(e.to_string()));
        Ok((Box::pin(sink), Box::pin(server_rx)))
    }
}

#[derive(Default)]
pub(crate) struct MockApi {
    fetches: Mutex<HashMap<CacheKey, Value>>,
    fetch_count: AtomicUsize,
    mutation: Mutex<Option<Result<Value, String>>>,
    calls: Mutex<Vec<String>>,
}

impl MockApi {
    pub fn set_fetch(&self, key: &CacheKey, value: Value) {
        self.fetches.lock().unwrap().insert(key.clone(), value);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    /// Result of the next mutation calls: `Ok(canonical)` or `Err(message)`.
    pub fn set_mutation(&self, result: Result<Value, String>) {
        *self.mutation.lock().unwrap() = Some(result);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn mutation_result(&self, call: String) -> Result<Value, ApiError> {
        self.calls.lock().unwrap().push(call);
        match self.mutation.lock().unwrap().clone() {
            Some(Ok(value)) => Ok(value),
            Some(Err(message)) => Err(ApiError::Status {
                status: 500,
                message,
            }),
            None => Ok(Value::Null),
        }
    }
}

#[async_trait]
impl RemoteApi for MockApi {
    async fn fetch(&self, key: &CacheKey) -> Result<Value, ApiError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        self.fetches
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| ApiError::UnknownEntity(key.entity.to_string()))
    }

    async fn toggle_favorite(&self, restaurant_id: &str) -> Result<Value, ApiError> {
        self.mutation_result(format!("favorite:{restaurant_id}"))
    }

    async fn set_item_availability(
        &self,
        restaurant_id: &str,
        item_id: &str,
        available: bool,
    ) -> Result<Value, ApiError> {
        self.mutation_result(format!("item:{restaurant_id}/{item_id}={available}"))
    }

    async fn set_driver_availability(
        &self,
        driver_id: &str,
        available: bool,
    ) -> Result<Value, ApiError> {
        self.mutation_result(format!("driver:{driver_id}={available}"))
    }
}

/// Position source replaying scripted samples, then repeating the last one.
pub(crate) struct ScriptedPositions {
    samples: Mutex<VecDeque<Result<GeoPoint, PositionError>>>,
    reads: AtomicUsize,
}

impl ScriptedPositions {
    pub fn new(samples: Vec<Result<GeoPoint, PositionError>>) -> Arc<Self> {
        Arc::new(Self {
            samples: Mutex::new(samples.into()),
            reads: AtomicUsize::new(0),
        })
    }

    pub fn fixed(point: GeoPoint) -> Arc<Self> {
        Self::new(vec![Ok(point)])
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PositionSource for ScriptedPositions {
    async fn current_position(&self) -> Result<GeoPoint, PositionError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut samples = self.samples.lock().unwrap();
        if samples.len() > 1 {
            return samples.pop_front().expect("non-empty");
        }
        samples
            .front()
            .cloned()
            .unwrap_or(Err(PositionError::Unavailable("no samples".into())))
    }
}
