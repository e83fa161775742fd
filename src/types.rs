use std::{fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::subscriptions::SubscriptionError;

/// Entity scope for real-time events: `order:<id>`, `restaurant:<id>` or `driver:<id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    Order(Arc<str>),
    Restaurant(Arc<str>),
    Driver(Arc<str>),
}

impl Topic {
    pub fn order(id: &str) -> Self {
        Topic::Order(Arc::from(id))
    }

    pub fn restaurant(id: &str) -> Self {
        Topic::Restaurant(Arc::from(id))
    }

    pub fn driver(id: &str) -> Self {
        Topic::Driver(Arc::from(id))
    }

    pub fn id(&self) -> &str {
        match self {
            Topic::Order(id) | Topic::Restaurant(id) | Topic::Driver(id) => id,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Order(id) => write!(f, "order:{id}"),
            Topic::Restaurant(id) => write!(f, "restaurant:{id}"),
            Topic::Driver(id) => write!(f, "driver:{id}"),
        }
    }
}

impl FromStr for Topic {
    type Err = SubscriptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| SubscriptionError::MalformedTopic(s.to_string()))?;

        if id.is_empty() || id.contains(char::is_whitespace) {
            return Err(SubscriptionError::MalformedTopic(s.to_string()));
        }

        match kind {
            "order" => Ok(Topic::order(id)),
            "restaurant" => Ok(Topic::restaurant(id)),
            "driver" => Ok(Topic::driver(id)),
            _ => Err(SubscriptionError::MalformedTopic(s.to_string())),
        }
    }
}

impl Serialize for Topic {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Topic {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub entity: Arc<str>,
    pub params_canonical: Arc<str>,
}

impl CacheKey {
    pub fn new(entity: &str, params: &Value) -> Self {
        let params_canonical = serde_jcs::to_string(params)
            .or_else(|_| serde_json::to_string(params))
            .unwrap_or_else(|_| "null".to_string());

        Self {
            entity: Arc::from(entity),
            params_canonical: Arc::from(params_canonical.as_str()),
        }
    }

    pub fn params(&self) -> Value {
        serde_json::from_str(&self.params_canonical).unwrap_or(Value::Null)
    }

    pub fn order(order_id: &str) -> Self {
        Self::new("order", &serde_json::json!({ "id": order_id }))
    }

    pub fn orders() -> Self {
        Self::new("orders", &serde_json::json!({}))
    }

    pub fn driver_location(order_id: &str) -> Self {
        Self::new("driver-location", &serde_json::json!({ "order_id": order_id }))
    }

    pub fn restaurant(restaurant_id: &str) -> Self {
        Self::new("restaurant", &serde_json::json!({ "id": restaurant_id }))
    }

    pub fn restaurant_orders(restaurant_id: &str) -> Self {
        Self::new(
            "restaurant-orders",
            &serde_json::json!({ "restaurant_id": restaurant_id }),
        )
    }

    pub fn menu(restaurant_id: &str) -> Self {
        Self::new("menu", &serde_json::json!({ "restaurant_id": restaurant_id }))
    }

    pub fn menu_item(restaurant_id: &str, item_id: &str) -> Self {
        Self::new(
            "menu-item",
            &serde_json::json!({ "restaurant_id": restaurant_id, "item_id": item_id }),
        )
    }

    pub fn driver_profile(driver_id: &str) -> Self {
        Self::new("driver-profile", &serde_json::json!({ "driver_id": driver_id }))
    }

    pub fn available_orders() -> Self {
        Self::new("available-orders", &serde_json::json!({}))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.entity, self.params_canonical)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    pub revision: u64,
    pub stale: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Preparing,
    ReadyForPickup,
    PickedUp,
    InTransit,
    Delivered,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AvailabilityTarget {
    Restaurant { restaurant_id: String },
    MenuItem { restaurant_id: String, item_id: String },
    Driver { driver_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    OrderStatusChanged {
        order_id: String,
        status: OrderStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        order: Option<Value>,
    },
    DriverAssigned {
        order_id: String,
        driver_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        order: Option<Value>,
    },
    DriverLocationUpdated {
        order_id: String,
        driver_id: String,
        location: GeoPoint,
    },
    NewOrderReceived {
        restaurant_id: String,
        order_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        order: Option<Value>,
    },
    AvailabilityChanged {
        target: AvailabilityTarget,
        available: bool,
    },
}

impl DomainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::OrderStatusChanged { .. } => "order_status_changed",
            DomainEvent::DriverAssigned { .. } => "driver_assigned",
            DomainEvent::DriverLocationUpdated { .. } => "driver_location_updated",
            DomainEvent::NewOrderReceived { .. } => "new_order_received",
            DomainEvent::AvailabilityChanged { .. } => "availability_changed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub topic: Topic,
    pub seq: u64,
    pub event: DomainEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth { token: String },
    Subscribe { topic: Topic },
    Unsubscribe { topic: Topic },
    Ping { nonce: u64 },
    DriverLocation { order_id: String, location: GeoPoint },
    AcceptOrder { order_id: String },
    DeliveryStatus { order_id: String, status: OrderStatus },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    AuthOk {
        #[serde(default)]
        user_id: Option<String>,
    },
    AuthRejected { reason: String },
    Pong { nonce: u64 },
    Subscribed { topic: Topic },
    SubscriptionRejected { topic: Topic, reason: String },
    Event(EventEnvelope),
    Error { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
}
