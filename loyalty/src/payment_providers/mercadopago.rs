//! MercadoPago payments API client.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument, warn};
use url::Url;

use super::{PaymentProvider, PaymentSearch, ProviderPayment, Result, STATUS_APPROVED};
use crate::{config::MercadoPagoConfig, errors::ProviderError};

const SERVICE: &str = "mercadopago";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<ProviderPayment>,
    paging: Paging,
}

#[derive(Debug, Deserialize)]
struct Paging {
    total: u64,
    #[serde(default)]
    limit: u64,
}

pub struct MercadoPagoProvider {
    client: Client,
    base_url: Url,
    access_token: String,
    page_size: u32,
    max_pages: u32,
}

impl MercadoPagoProvider {
    pub fn new(config: &MercadoPagoConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|source| ProviderError::Http { service: SERVICE, source })?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            access_token: config.access_token.clone().unwrap_or_default(),
            page_size: config.page_size,
            max_pages: config.max_pages,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(|e| ProviderError::Decode {
            service: SERVICE,
            message: format!("invalid endpoint {path}: {e}"),
        })
    }

    async fn fetch_page(&self, search: &PaymentSearch, offset: u64) -> Result<SearchResponse> {
        let mut url = self.endpoint("/v1/payments/search")?;
        url.query_pairs_mut()
            .append_pair("sort", "date_created")
            .append_pair("criteria", "asc")
            .append_pair("range", "date_created")
            .append_pair("begin_date", &format_instant(search.begin))
            .append_pair("end_date", &format_instant(search.end))
            .append_pair("status", STATUS_APPROVED)
            .append_pair("limit", &self.page_size.to_string())
            .append_pair("offset", &offset.to_string());

        let response = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(http_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                service: SERVICE,
                status: status.as_u16(),
                body,
            });
        }

        response.json::<SearchResponse>().await.map_err(decode_error)
    }
}

fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn http_error(source: reqwest::Error) -> ProviderError {
    if source.is_timeout() {
        ProviderError::Timeout { service: SERVICE }
    } else {
        ProviderError::Http { service: SERVICE, source }
    }
}

fn decode_error(source: reqwest::Error) -> ProviderError {
    ProviderError::Decode {
        service: SERVICE,
        message: source.to_string(),
    }
}

#[async_trait]
impl PaymentProvider for MercadoPagoProvider {
    #[instrument(skip(self, search), fields(begin = %search.begin, end = %search.end), err)]
    async fn search_payments(&self, search: &PaymentSearch) -> Result<Vec<ProviderPayment>> {
        let mut payments = Vec::new();
        let mut offset = 0u64;

        for page in 0..self.max_pages {
            let response = self.fetch_page(search, offset).await?;
            let fetched = response.results.len() as u64;
            debug!(page, fetched, total = response.paging.total, "Fetched payment search page");

            payments.extend(
                response
                    .results
                    .into_iter()
                    .filter(|p| p.is_approved() && p.matches_amount(search.amount, search.epsilon)),
            );

            let step = if response.paging.limit > 0 { response.paging.limit } else { fetched };
            offset += step;
            if fetched == 0 || offset >= response.paging.total {
                return Ok(payments);
            }
        }

        warn!(max_pages = self.max_pages, "Payment search truncated at page limit");
        Ok(payments)
    }

    #[instrument(skip(self), err)]
    async fn get_payment(&self, payment_id: &str) -> Result<Option<ProviderPayment>> {
        let url = self.endpoint(&format!("/v1/payments/{payment_id}"))?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(http_error)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response.json::<ProviderPayment>().await.map(Some).map_err(decode_error),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ProviderError::Status {
                    service: SERVICE,
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}
