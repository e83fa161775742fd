use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use crate::types::{CacheKey, Page};

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("no endpoint for cache entity {0}")]
    UnknownEntity(String),
}

#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn fetch(&self, key: &CacheKey) -> Result<Value, ApiError>;

    async fn toggle_favorite(&self, restaurant_id: &str) -> Result<Value, ApiError>;

    async fn set_item_availability(
        &self,
        restaurant_id: &str,
        item_id: &str,
        available: bool,
    ) -> Result<Value, ApiError>;

    async fn set_driver_availability(
        &self,
        driver_id: &str,
        available: bool,
    ) -> Result<Value, ApiError>;
}

pub struct HttpApi {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn path_for(key: &CacheKey) -> Result<(String, bool), ApiError> {
        let params = key.params();
        let param = |name: &str| params[name].as_str().unwrap_or_default().to_string();

        let (path, is_list) = match &*key.entity {
            "order" => (format!("/orders/{}", param("id")), false),
            "orders" => ("/orders".to_string(), true),
            "driver-location" => (format!("/orders/{}/driver-location", param("order_id")), false),
            "restaurant" => (format!("/restaurants/{}", param("id")), false),
            "restaurant-orders" => (
                format!("/restaurants/{}/orders", param("restaurant_id")),
                true,
            ),
            "menu" => (format!("/restaurants/{}/menu", param("restaurant_id")), false),
            "menu-item" => (
                format!(
                    "/restaurants/{}/menu/{}",
                    param("restaurant_id"),
                    param("item_id")
                ),
                false,
            ),
            "driver-profile" => ("/drivers/profile".to_string(), false),
            "available-orders" => ("/drivers/available-orders".to_string(), true),
            other => return Err(ApiError::UnknownEntity(other.to_string())),
        };
        Ok((path, is_list))
    }

    async fn read_json(resp: reqwest::Response) -> Result<Value, ApiError> {
        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .json::<Value>()
                .await
                .ok()
                .and_then(|body| body["message"].as_str().map(String::from))
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("").to_string());
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }
        if status == StatusCode::NO_CONTENT {
            return Ok(Value::Null);
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl RemoteApi for HttpApi {
    async fn fetch(&self, key: &CacheKey) -> Result<Value, ApiError> {
        let (path, is_list) = Self::path_for(key)?;
        let resp = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .send()
            .await?;

        let body = Self::read_json(resp).await?;
        if is_list {
            // reject bodies that are not a list envelope
            serde_json::from_value::<Page<Value>>(body.clone())?;
        }
        Ok(body)
    }

    async fn toggle_favorite(&self, restaurant_id: &str) -> Result<Value, ApiError> {
        let resp = self
            .client
            .post(format!(
                "{}/restaurants/{}/favorite",
                self.base_url, restaurant_id
            ))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::read_json(resp).await
    }

    async fn set_item_availability(
        &self,
        restaurant_id: &str,
        item_id: &str,
        available: bool,
    ) -> Result<Value, ApiError> {
        let resp = self
            .client
            .patch(format!(
                "{}/restaurants/{}/menu/{}/availability",
                self.base_url, restaurant_id, item_id
            ))
            .bearer_auth(&self.token)
            .json(&json!({ "available": available }))
            .send()
            .await?;
        Self::read_json(resp).await
    }

    async fn set_driver_availability(
        &self,
        driver_id: &str,
        available: bool,
    ) -> Result<Value, ApiError> {
        let resp = self
            .client
            .patch(format!("{}/drivers/{}/status", self.base_url, driver_id))
            .bearer_auth(&self.token)
            .json(&json!({ "is_available": available }))
            .send()
            .await?;
        Self::read_json(resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_keys_map_to_endpoints() {
        let cases = [
            (CacheKey::order("o1"), "/orders/o1", false),
            (CacheKey::orders(), "/orders", true),
            (CacheKey::restaurant_orders("r1"), "/restaurants/r1/orders", true),
            (CacheKey::menu_item("r1", "i9"), "/restaurants/r1/menu/i9", false),
            (CacheKey::driver_location("o1"), "/orders/o1/driver-location", false),
            (CacheKey::available_orders(), "/drivers/available-orders", true),
        ];

        for (key, path, is_list) in cases {
            assert_eq!(HttpApi::path_for(&key).unwrap(), (path.to_string(), is_list));
        }
    }

    #[test]
    fn unknown_entity_has_no_endpoint() {
        let key = CacheKey::new("weather", &json!({}));
        assert!(matches!(
            HttpApi::path_for(&key),
            Err(ApiError::UnknownEntity(e)) if e == "weather"
        ));
    }
}
