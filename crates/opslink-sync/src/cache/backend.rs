use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

use crate::clock::now_millis;
use crate::error::RequestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::Get)
    }
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub endpoint: String,
    pub body: Option<Value>,
}

/// One request/response round trip. The cache layers TTL, coalescing, and
/// retry on top of whichever backend it is given.
#[async_trait]
pub trait ApiBackend: Send + Sync {
    async fn execute(&self, request: &ApiRequest) -> Result<Value, RequestError>;
}

/// HTTP backend over reqwest.
pub struct HttpBackend {
    base: String,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base = base_url.into().trim_end_matches('/').to_string();
        Self {
            base,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ApiBackend for HttpBackend {
    async fn execute(&self, request: &ApiRequest) -> Result<Value, RequestError> {
        let url = format!("{}{}", self.base, request.endpoint);
        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
            Method::Delete => self.client.delete(&url),
        };
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                RequestError::Timeout
            } else {
                RequestError::Network(err.to_string())
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<Value>()
                .await
                .ok()
                .and_then(|body| body.get("message").and_then(|m| m.as_str()).map(String::from));
            return Err(RequestError::Api {
                status: status.as_u16(),
                message,
            });
        }
        response
            .json::<Value>()
            .await
            .map_err(|err| RequestError::Decode(err.to_string()))
    }
}

/// Development backend for environments without a reachable API: answers
/// reads with synthetic payloads of the expected shape, seeded per endpoint
/// so repeated reads agree.
#[derive(Debug, Default)]
pub struct FallbackBackend;

impl FallbackBackend {
    pub fn new() -> Self {
        Self
    }

    fn rng_for(endpoint: &str) -> StdRng {
        let mut hasher = DefaultHasher::new();
        endpoint.hash(&mut hasher);
        StdRng::seed_from_u64(hasher.finish())
    }

    fn transit(rng: &mut StdRng) -> Value {
        let statuses = ["pending", "active", "completed"];
        json!({
            "id": Uuid::from_u128(rng.gen()),
            "route": format!("{}-crosstown", rng.gen_range(1..30u32)),
            "status": statuses[rng.gen_range(0..statuses.len())],
            "origin": "north-yard",
            "destination": "depot-7",
            "updated_at": now_millis(),
        })
    }

    fn alert(rng: &mut StdRng) -> Value {
        let severities = ["info", "warning", "critical"];
        json!({
            "id": Uuid::from_u128(rng.gen()),
            "severity": severities[rng.gen_range(0..severities.len())],
            "message": format!("synthetic condition #{}", rng.gen_range(100..999u32)),
            "source": "signal-controller",
            "acknowledged": false,
            "raised_at": now_millis(),
        })
    }

    fn asset(rng: &mut StdRng) -> Value {
        json!({
            "id": Uuid::from_u128(rng.gen()),
            "name": format!("asset-{}", rng.gen_range(1..32u32)),
            "kind": "gps-unit",
            "online": rng.gen_bool(0.8),
            "battery_pct": rng.gen_range(5..100u8),
            "last_seen": now_millis(),
        })
    }
}

#[async_trait]
impl ApiBackend for FallbackBackend {
    async fn execute(&self, request: &ApiRequest) -> Result<Value, RequestError> {
        if request.method.is_mutation() {
            return Ok(json!({ "ok": true }));
        }
        let mut rng = Self::rng_for(&request.endpoint);
        let count = rng.gen_range(3..7usize);
        let value = if request.endpoint.starts_with("/transits") {
            Value::Array((0..count).map(|_| Self::transit(&mut rng)).collect())
        } else if request.endpoint.starts_with("/alerts") {
            Value::Array((0..count).map(|_| Self::alert(&mut rng)).collect())
        } else if request.endpoint.starts_with("/assets") {
            Value::Array((0..count).map(|_| Self::asset(&mut rng)).collect())
        } else if request.endpoint.starts_with("/metrics") {
            json!({
                "cpu_pct": rng.gen_range(5.0..95.0),
                "memory_pct": rng.gen_range(20.0..80.0),
                "active_connections": rng.gen_range(1..200u64),
                "events_per_second": rng.gen_range(0.1..50.0),
                "captured_at": now_millis(),
            })
        } else {
            json!({})
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fallback_reads_match_domain_shapes() {
        let backend = FallbackBackend::new();
        let request = ApiRequest {
            method: Method::Get,
            endpoint: "/transits/pending".into(),
            body: None,
        };
        let value = backend.execute(&request).await.unwrap();
        let list = value.as_array().unwrap();
        assert!(!list.is_empty());
        assert!(list[0].get("route").is_some());
    }

    #[tokio::test]
    async fn fallback_ids_are_stable_per_endpoint() {
        let backend = FallbackBackend::new();
        let request = ApiRequest {
            method: Method::Get,
            endpoint: "/alerts/active".into(),
            body: None,
        };
        let first = backend.execute(&request).await.unwrap();
        let second = backend.execute(&request).await.unwrap();
        assert_eq!(
            first[0].get("id").unwrap(),
            second[0].get("id").unwrap()
        );
    }

    #[tokio::test]
    async fn fallback_mutations_succeed() {
        let backend = FallbackBackend::new();
        let request = ApiRequest {
            method: Method::Post,
            endpoint: "/alerts/123/ack".into(),
            body: Some(json!({ "acknowledged": true })),
        };
        assert_eq!(
            backend.execute(&request).await.unwrap(),
            json!({ "ok": true })
        );
    }
}
