//! Coffeeji vending API client.
//!
//! Every request carries `key`, `timestamp` (unix millis) and
//! `key-md5 = md5(key + secret + timestamp)` headers.

use async_trait::async_trait;
use chrono::Utc;
use md5::{Digest, Md5};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument};
use url::Url;

use super::{OrderLookup, VoucherVerifier};
use crate::{config::CoffeejiConfig, errors::ProviderError};

const SERVICE: &str = "coffeeji";
const ORDER_INFO_PATH: &str = "/coffee/newThird/order/getOrderInfo";
const ORDER_LIST_PATH: &str = "/coffee/newThird/order/getOrderList";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    success: bool,
    data: Option<T>,
    #[serde(default)]
    msg: String,
}

impl<T> Envelope<T> {
    /// Transport-level success can still carry an application error in the envelope
    fn ensure_success(self) -> Result<Self, ProviderError> {
        if !self.success || self.code != 200 {
            return Err(ProviderError::Decode {
                service: SERVICE,
                message: format!("unsuccessful response: code={} msg={}", self.code, self.msg),
            });
        }
        Ok(self)
    }
}

#[derive(Debug, Default, Deserialize)]
struct OrderList {
    #[serde(default)]
    records: Vec<OrderRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderRecord {
    goods_name: Option<String>,
}

/// `key-md5` header value
pub fn sign(key: &str, secret: &str, timestamp_millis: i64) -> String {
    let mut hasher = Md5::new();
    hasher.update(key.as_bytes());
    hasher.update(secret.as_bytes());
    hasher.update(timestamp_millis.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Order data that is absent, `null` or an empty object means the code was never redeemed
fn shows_order_data(data: Option<&Value>) -> bool {
    match data {
        None | Some(Value::Null) => false,
        Some(Value::Object(map)) => !map.is_empty(),
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(_) => true,
    }
}

pub struct CoffeejiClient {
    client: Client,
    base_url: Url,
    key: String,
    secret: String,
}

impl CoffeejiClient {
    pub fn new(config: &CoffeejiConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|source| ProviderError::Http { service: SERVICE, source })?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            key: config.key.clone().unwrap_or_default(),
            secret: config.secret.clone().unwrap_or_default(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ProviderError> {
        self.base_url.join(path).map_err(|e| ProviderError::Decode {
            service: SERVICE,
            message: format!("invalid endpoint {path}: {e}"),
        })
    }

    fn signed(&self, request: RequestBuilder) -> RequestBuilder {
        let timestamp = Utc::now().timestamp_millis();
        request
            .header("key", &self.key)
            .header("key-md5", sign(&self.key, &self.secret, timestamp))
            .header("timestamp", timestamp.to_string())
            .header("Accept", "application/json")
    }

    async fn send<T: serde::de::DeserializeOwned>(&self, request: RequestBuilder) -> Result<Envelope<T>, ProviderError> {
        let response = self.signed(request).send().await.map_err(|source| {
            if source.is_timeout() {
                ProviderError::Timeout { service: SERVICE }
            } else {
                ProviderError::Http { service: SERVICE, source }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                service: SERVICE,
                status: status.as_u16(),
                body,
            });
        }

        response.json::<Envelope<T>>().await.map_err(|e| ProviderError::Decode {
            service: SERVICE,
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl VoucherVerifier for CoffeejiClient {
    #[instrument(skip(self, code), err)]
    async fn is_used(&self, code: &str) -> Result<bool, ProviderError> {
        let url = self.endpoint(ORDER_INFO_PATH)?;
        let envelope: Envelope<Value> = self
            .send(self.client.post(url).json(&json!({ "code": code })))
            .await?
            .ensure_success()?;
        debug!(code = envelope.code, msg = %envelope.msg, "Voucher order info");
        Ok(shows_order_data(envelope.data.as_ref()))
    }
}

#[async_trait]
impl OrderLookup for CoffeejiClient {
    #[instrument(skip(self), err)]
    async fn product_name(&self, order_no: &str) -> Result<Option<String>, ProviderError> {
        let mut url = self.endpoint(ORDER_LIST_PATH)?;
        url.query_pairs_mut().append_pair("orderNo", order_no);

        let envelope: Envelope<OrderList> = self.send(self.client.get(url)).await?.ensure_success()?;

        Ok(envelope
            .data
            .unwrap_or_default()
            .records
            .into_iter()
            .next()
            .and_then(|record| record.goods_name)
            .filter(|name| !name.trim().is_empty()))
    }
}
