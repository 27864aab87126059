use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, StatusCode, Url};
use serde::{Deserialize, Serialize};

use crate::order::OrderPayload;

use super::{NetworkError, SubmitError};

/// Server acknowledgement of an order submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitAck {
    pub server_id: String,
    /// False when the server recognised the `local_id` and returned the order
    /// it created earlier.
    pub created: bool,
}

/// Order submission boundary.
///
/// Implementations must forward `local_id` as the idempotency key. The
/// server returns the previously created order for a repeated key instead of
/// creating a second one.
#[async_trait]
pub trait OrderApi: Send + Sync {
    async fn submit_order(
        &self,
        local_id: &str,
        payload: &OrderPayload,
    ) -> Result<SubmitAck, SubmitError>;
}

#[derive(Serialize)]
struct SubmitBody<'a> {
    local_id: &'a str,
    #[serde(flatten)]
    payload: &'a OrderPayload,
}

#[derive(Deserialize)]
struct AckBody {
    #[serde(alias = "id")]
    server_id: String,
}

/// `OrderApi` over the REST backend: `POST {base}/orders`.
pub struct HttpOrderApi {
    http: reqwest::Client,
    orders_url: Url,
    token: Option<String>,
}

impl HttpOrderApi {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, NetworkError> {
        let orders_url = endpoint_url(base_url, "orders")?;
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            orders_url,
            token,
        })
    }

    pub fn orders_url(&self) -> &Url {
        &self.orders_url
    }
}

#[async_trait]
impl OrderApi for HttpOrderApi {
    async fn submit_order(
        &self,
        local_id: &str,
        payload: &OrderPayload,
    ) -> Result<SubmitAck, SubmitError> {
        let mut request = self
            .http
            .post(self.orders_url.clone())
            .header("Idempotency-Key", local_id)
            .json(&SubmitBody { local_id, payload });
        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| SubmitError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            // The server may have committed even if the body is unreadable;
            // retrying with the same key is safe.
            let ack: AckBody = response
                .json()
                .await
                .map_err(|e| SubmitError::Transient(format!("unreadable acknowledgement: {e}")))?;
            return Ok(SubmitAck {
                server_id: ack.server_id,
                created: status == StatusCode::CREATED,
            });
        }

        let message = response.text().await.unwrap_or_default();
        Err(SubmitError::from_status(
            status.as_u16(),
            truncate(message, 512),
        ))
    }
}

/// Join `path` onto `base_url`, treating the base as a directory.
pub fn endpoint_url(base_url: &str, path: &str) -> Result<Url, NetworkError> {
    let mut base = base_url.to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Url::parse(&base)
        .and_then(|url| url.join(path))
        .map_err(|e| NetworkError::InvalidUrl(format!("{base_url}: {e}")))
}

fn truncate(mut message: String, max: usize) -> String {
    if message.len() > max {
        let mut end = max;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrderItem;

    #[test]
    fn endpoint_url_keeps_base_path() {
        let url = endpoint_url("http://pos.local/api/v1", "orders").unwrap();
        assert_eq!(url.as_str(), "http://pos.local/api/v1/orders");

        let url = endpoint_url("http://pos.local/api/v1/", "health").unwrap();
        assert_eq!(url.as_str(), "http://pos.local/api/v1/health");
    }

    #[test]
    fn endpoint_url_rejects_garbage() {
        assert!(matches!(
            endpoint_url("not a url", "orders"),
            Err(NetworkError::InvalidUrl(_))
        ));
    }

    #[test]
    fn submit_body_carries_local_id_next_to_payload() {
        let payload = OrderPayload {
            notes: Some("no onions".into()),
            ..OrderPayload::new("T5", vec![OrderItem::new("x", 2u32)])
        };
        let body = serde_json::to_value(SubmitBody {
            local_id: "loc_1",
            payload: &payload,
        })
        .unwrap();

        assert_eq!(body["local_id"], "loc_1");
        assert_eq!(body["table_id"], "T5");
        assert_eq!(body["items"][0]["qty"], 2);
        assert_eq!(body["notes"], "no onions");
    }

    #[test]
    fn submit_body_forwards_fields_it_does_not_know() {
        let payload: OrderPayload = serde_json::from_value(serde_json::json!({
            "table_id": "T5",
            "items": [{"id": "x", "qty": 0.5, "modifiers": ["no onion"], "price": 4.5}],
            "guest_count": 3
        }))
        .unwrap();
        let body = serde_json::to_value(SubmitBody {
            local_id: "loc_1",
            payload: &payload,
        })
        .unwrap();

        assert_eq!(
            body,
            serde_json::json!({
                "local_id": "loc_1",
                "table_id": "T5",
                "items": [{"id": "x", "qty": 0.5, "modifiers": ["no onion"], "price": 4.5}],
                "guest_count": 3
            })
        );
    }

    #[test]
    fn ack_accepts_id_alias() {
        let ack: AckBody = serde_json::from_str(r#"{"id":"ord_9","status":"open"}"#).unwrap();
        assert_eq!(ack.server_id, "ord_9");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo".to_string(), 2), "h");
        assert_eq!(truncate("short".to_string(), 64), "short");
    }
}
