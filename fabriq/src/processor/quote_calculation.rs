//! Processor for quote calculation jobs.
//!
//! Pricing math lives in the pricing service; this processor owns the
//! lifecycle: validation, per-item pricing with cancellation checkpoints,
//! and totals aggregation.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{elapsed_ms, ActiveJob, JobError, JobResult, Processor, ProcessorError, ServiceError};
use crate::job::JobType;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteCalculationJobData {
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub correlation_id: Option<String>,
    pub quote_id: String,
    pub items: Vec<QuoteItem>,
    pub rush_order: Option<bool>,
    pub currency: Option<String>,
    #[serde(default)]
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteItem {
    pub file_id: String,
    pub quantity: u32,
    pub material: String,
    pub process: String,
    pub finish_options: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPrice {
    pub unit_price: f64,
    pub lead_time_days: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteTotals {
    pub quote_id: String,
    pub currency: String,
    pub item_count: usize,
    pub subtotal: f64,
    pub rush_order: bool,
    pub lead_time_days: u32,
}

/// The external pricing service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PricingService: Send + Sync {
    async fn price_item(
        &self,
        item: &QuoteItem,
        currency: &str,
        rush_order: bool,
    ) -> Result<ItemPrice, ServiceError>;
}

pub struct QuoteCalculationProcessor {
    pricing: Arc<dyn PricingService>,
}

impl QuoteCalculationProcessor {
    pub fn new(pricing: Arc<dyn PricingService>) -> Self {
        Self { pricing }
    }
}

#[async_trait]
impl Processor for QuoteCalculationProcessor {
    const KIND: JobType = JobType::QuoteCalculation;
    type Data = QuoteCalculationJobData;

    async fn process(&self, job: ActiveJob<Self::Data>) -> Result<JobResult, ProcessorError> {
        let started = Instant::now();
        let data = job.data().clone();
        tracing::info!(
            job_id = %job.id(),
            tenant_id = %data.tenant_id,
            "Starting quote calculation for {}",
            data.quote_id
        );

        job.report_progress(10, "Validating quote items", "validating").await;
        if data.items.is_empty() {
            return Ok(JobResult::failure(
                JobError::new("EMPTY_QUOTE", "Quote has no items to price"),
                elapsed_ms(started),
            ));
        }

        let currency = data.currency.as_deref().unwrap_or("USD");
        let rush_order = data.rush_order.unwrap_or(false);

        job.report_progress(30, "Pricing items", "pricing").await;
        let mut subtotal = 0.0;
        let mut lead_time_days = 0;
        for item in &data.items {
            if job.is_cancelled().await {
                return Ok(JobResult::failure(
                    JobError::new("CANCELLED", "Job cancelled during pricing"),
                    elapsed_ms(started),
                ));
            }
            let price = match self.pricing.price_item(item, currency, rush_order).await {
                Ok(price) => price,
                Err(ServiceError::Unavailable(message)) => {
                    return Err(ProcessorError::new("pricing_unavailable", message));
                }
                Err(ServiceError::Failed { code, message }) => {
                    return Ok(JobResult::failure(
                        JobError::new(code, message)
                            .with_details(serde_json::json!({"fileId": item.file_id})),
                        elapsed_ms(started),
                    ));
                }
            };
            subtotal += price.unit_price * f64::from(item.quantity);
            lead_time_days = lead_time_days.max(price.lead_time_days);
        }

        job.report_progress(80, "Aggregating totals", "aggregating").await;
        let totals = QuoteTotals {
            quote_id: data.quote_id.clone(),
            currency: currency.to_owned(),
            item_count: data.items.len(),
            subtotal,
            rush_order,
            lead_time_days,
        };
        let result = serde_json::to_value(&totals)?;
        job.report_progress(100, "Quote calculation completed", "done").await;

        Ok(JobResult::success(result, elapsed_ms(started)))
    }
}
