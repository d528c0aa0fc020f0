use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use rust_decimal::{prelude::ToPrimitive, Decimal};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::{GatewayTransaction, PaymentGateway, TransferReceipt, TransferRequest, TransferStatus};
use crate::error::GatewayError;
use crate::ledger::models::PaymentStatus;

const PAGE_SIZE: u32 = 100;
/// Upper bound on pages fetched for one reconciliation window
const MAX_PAGES: u32 = 500;

/// Paystack-style REST client. Amounts travel in minor units (kobo).
pub struct PaystackGateway {
    client: reqwest::Client,
    base_url: String,
    secret_key: String,
}

/// Response envelope shared by every endpoint
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: bool,
    #[serde(default)]
    message: String,
    data: Option<T>,
    #[serde(default)]
    meta: Option<PageMeta>,
}

#[derive(Debug, Deserialize)]
struct PageMeta {
    #[serde(default, rename = "pageCount")]
    page_count: Option<u32>,
}

#[derive(Debug, Serialize)]
struct TransferBody<'a> {
    source: &'a str,
    amount: i64,
    recipient: &'a str,
    reference: &'a str,
    reason: &'a str,
    currency: &'a str,
}

#[derive(Debug, Deserialize)]
struct TransferData {
    reference: String,
    transfer_code: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct TransactionData {
    reference: String,
    amount: i64,
    status: String,
    paid_at: Option<DateTime<Utc>>,
}

impl From<TransferData> for TransferReceipt {
    fn from(data: TransferData) -> Self {
        Self {
            reference: data.reference,
            transfer_code: data.transfer_code,
            status: TransferStatus::from_gateway(&data.status),
        }
    }
}

impl From<TransactionData> for GatewayTransaction {
    fn from(data: TransactionData) -> Self {
        Self {
            reference: data.reference,
            amount: from_minor_units(data.amount),
            status: PaymentStatus::from_gateway(&data.status),
            paid_at: data.paid_at,
        }
    }
}

/// Convert a major-unit amount to minor units, rejecting sub-kobo precision
pub fn to_minor_units(amount: Decimal) -> Result<i64, GatewayError> {
    let minor = amount * Decimal::ONE_HUNDRED;
    if minor.fract() != Decimal::ZERO {
        return Err(GatewayError::InvalidRequest(format!(
            "Amount {} has more than two decimal places",
            amount
        )));
    }
    minor
        .to_i64()
        .ok_or_else(|| GatewayError::InvalidRequest(format!("Amount {} out of range", amount)))
}

pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

impl PaystackGateway {
    pub fn new(base_url: impl Into<String>, secret_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Decode an envelope, turning non-2xx or `status: false` into a rejection
    async fn decode<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<Envelope<T>, GatewayError> {
        let status = response.status();
        let body = response.text().await?;

        let envelope: Envelope<T> = serde_json::from_str(&body).map_err(|e| {
            if status.is_success() {
                GatewayError::Decode(format!("{}: {}", e, body))
            } else {
                GatewayError::Rejected {
                    status: status.as_u16(),
                    message: body.clone(),
                }
            }
        })?;

        if !status.is_success() || !envelope.status {
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                message: envelope.message,
            });
        }

        Ok(envelope)
    }
}

#[async_trait]
impl PaymentGateway for PaystackGateway {
    fn name(&self) -> &'static str {
        "paystack"
    }

    async fn initiate_transfer(
        &self,
        request: &TransferRequest,
    ) -> Result<TransferReceipt, GatewayError> {
        let body = TransferBody {
            source: "balance",
            amount: to_minor_units(request.amount)?,
            recipient: &request.recipient_code,
            reference: &request.reference,
            reason: &request.reason,
            currency: &request.currency,
        };

        info!("💸 Initiating transfer {} ({} {})", request.reference, request.amount, request.currency);

        let response = self
            .client
            .post(self.url("/transfer"))
            .bearer_auth(&self.secret_key)
            .json(&body)
            .send()
            .await?;

        let envelope: Envelope<TransferData> = Self::decode(response).await?;
        envelope
            .data
            .map(TransferReceipt::from)
            .ok_or_else(|| GatewayError::Decode("transfer response without data".to_string()))
    }

    async fn fetch_transfer(
        &self,
        reference: &str,
    ) -> Result<Option<TransferReceipt>, GatewayError> {
        let response = self
            .client
            .get(self.url(&format!("/transfer/verify/{}", reference)))
            .bearer_auth(&self.secret_key)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("Transfer {} unknown to gateway", reference);
            return Ok(None);
        }

        let envelope: Envelope<TransferData> = Self::decode(response).await?;
        Ok(envelope.data.map(TransferReceipt::from))
    }

    async fn list_transactions(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<GatewayTransaction>, GatewayError> {
        let mut transactions = Vec::new();
        let mut page = 1u32;

        loop {
            let response = self
                .client
                .get(self.url("/transaction"))
                .bearer_auth(&self.secret_key)
                .query(&[
                    ("from", from.to_rfc3339()),
                    ("to", to.to_rfc3339()),
                    ("perPage", PAGE_SIZE.to_string()),
                    ("page", page.to_string()),
                ])
                .send()
                .await?;

            let envelope: Envelope<Vec<TransactionData>> = Self::decode(response).await?;
            let batch = envelope.data.unwrap_or_default();
            let fetched = batch.len();
            transactions.extend(batch.into_iter().map(GatewayTransaction::from));

            let page_count = envelope.meta.and_then(|m| m.page_count).unwrap_or(page);
            if fetched == 0 || page >= page_count || page >= MAX_PAGES {
                break;
            }
            page += 1;
        }

        debug!("Fetched {} gateway transactions in {} page(s)", transactions.len(), page);
        Ok(transactions)
    }
}
