//! Processor for report generation jobs.
//!
//! Rendering internals (PDF/Excel/CSV) live in the renderer service. The
//! processor plans the report's sections from the requested options, renders
//! them one by one with a cancellation checkpoint between sections, and
//! returns size/section metadata.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{elapsed_ms, ActiveJob, JobError, JobResult, Processor, ProcessorError, ServiceError};
use crate::job::JobType;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportGenerationJobData {
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub correlation_id: Option<String>,
    pub report_type: ReportType,
    pub entity_id: String,
    pub format: ReportFormat,
    pub options: Option<ReportOptions>,
    #[serde(default)]
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportType {
    Quote,
    Order,
    Invoice,
    Analytics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Pdf,
    Excel,
    Csv,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReportOptions {
    pub include_item_details: bool,
    pub include_terms: bool,
    pub include_technical_specs: bool,
    pub language: Option<String>,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            include_item_details: true,
            include_terms: false,
            include_technical_specs: false,
            language: None,
        }
    }
}

/// One renderable section of a report.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionRequest {
    pub report_type: ReportType,
    pub entity_id: String,
    pub format: ReportFormat,
    pub section: &'static str,
    pub language: String,
}

/// The external document renderer.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReportRenderer: Send + Sync {
    async fn render_section(&self, request: &SectionRequest) -> Result<Vec<u8>, ServiceError>;
}

pub struct ReportGenerationProcessor {
    renderer: Arc<dyn ReportRenderer>,
}

impl ReportGenerationProcessor {
    pub fn new(renderer: Arc<dyn ReportRenderer>) -> Self {
        Self { renderer }
    }
}

fn plan_sections(options: &ReportOptions) -> Vec<&'static str> {
    let mut sections = vec!["summary"];
    if options.include_item_details {
        sections.push("line-items");
    }
    if options.include_technical_specs {
        sections.push("technical-specs");
    }
    if options.include_terms {
        sections.push("terms");
    }
    sections
}

#[async_trait]
impl Processor for ReportGenerationProcessor {
    const KIND: JobType = JobType::ReportGeneration;
    type Data = ReportGenerationJobData;

    async fn process(&self, job: ActiveJob<Self::Data>) -> Result<JobResult, ProcessorError> {
        let started = Instant::now();
        let data = job.data().clone();
        tracing::info!(
            job_id = %job.id(),
            tenant_id = %data.tenant_id,
            report_type = ?data.report_type,
            "Starting report generation for {}",
            data.entity_id
        );

        job.report_progress(10, "Planning report sections", "planning").await;
        let options = data.options.clone().unwrap_or_default();
        let language = options.language.clone().unwrap_or_else(|| "en".to_owned());
        let sections = plan_sections(&options);

        let mut size_bytes = 0usize;
        for (index, section) in sections.iter().copied().enumerate() {
            // Rendering can take a while per section; honour cancellation
            // between sections.
            if job.is_cancelled().await {
                return Ok(JobResult::failure(
                    JobError::new("CANCELLED", "Job cancelled during rendering"),
                    elapsed_ms(started),
                ));
            }

            let percentage = 20 + (index * 70 / sections.len()) as u8;
            job.report_progress(percentage, &format!("Rendering {section}"), "rendering")
                .await;

            let request = SectionRequest {
                report_type: data.report_type,
                entity_id: data.entity_id.clone(),
                format: data.format,
                section,
                language: language.clone(),
            };
            let rendered = match self.renderer.render_section(&request).await {
                Ok(rendered) => rendered,
                Err(ServiceError::Unavailable(message)) => {
                    return Err(ProcessorError::new("renderer_unavailable", message));
                }
                Err(ServiceError::Failed { code, message }) => {
                    return Ok(JobResult::failure(
                        JobError::new(code, message)
                            .with_details(serde_json::json!({"section": section})),
                        elapsed_ms(started),
                    ));
                }
            };
            size_bytes += rendered.len();
        }

        job.report_progress(95, "Assembling document", "assembling").await;
        let result = serde_json::json!({
            "entityId": data.entity_id,
            "reportType": data.report_type,
            "format": data.format,
            "sections": sections,
            "sizeBytes": size_bytes,
        });
        job.report_progress(100, "Report generation completed", "done").await;

        Ok(JobResult::success(result, elapsed_ms(started)))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::processor::test::{active_job, RecordingContext};

    fn data(options: Option<ReportOptions>) -> ReportGenerationJobData {
        ReportGenerationJobData {
            tenant_id: "t1".to_owned(),
            user_id: None,
            correlation_id: None,
            report_type: ReportType::Quote,
            entity_id: "q1".to_owned(),
            format: ReportFormat::Pdf,
            options,
            cancelled: false,
        }
    }

    #[tokio::test]
    async fn renders_planned_sections_and_sums_their_sizes() {
        let mut renderer = MockReportRenderer::new();
        renderer
            .expect_render_section()
            .returning(|request| Ok(vec![0u8; request.section.len()]));

        let processor = ReportGenerationProcessor::new(Arc::new(renderer));
        let context = RecordingContext::default();
        let options = ReportOptions {
            include_terms: true,
            ..Default::default()
        };

        let result = processor
            .process(active_job(data(Some(options)), &context))
            .await
            .unwrap();

        assert!(result.success);
        let report = result.data.unwrap();
        assert_eq!(report["sections"], json!(["summary", "line-items", "terms"]));
        assert_eq!(
            report["sizeBytes"],
            json!("summary".len() + "line-items".len() + "terms".len())
        );
        assert_eq!(context.last_percentage(), Some(100));
    }

    #[tokio::test]
    async fn cancellation_aborts_between_sections() {
        let mut renderer = MockReportRenderer::new();
        renderer.expect_render_section().never();

        let processor = ReportGenerationProcessor::new(Arc::new(renderer));
        let context = RecordingContext::with_data(json!({"cancelled": true}));

        let result = processor
            .process(active_job(data(None), &context))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, "CANCELLED");
    }

    #[tokio::test]
    async fn renderer_rejection_is_a_business_failure_with_section_details() {
        let mut renderer = MockReportRenderer::new();
        renderer.expect_render_section().returning(|_| {
            Err(ServiceError::Failed {
                code: "TEMPLATE_MISSING".to_owned(),
                message: "No template for analytics/summary".to_owned(),
            })
        });

        let processor = ReportGenerationProcessor::new(Arc::new(renderer));
        let context = RecordingContext::default();

        let result = processor
            .process(active_job(data(None), &context))
            .await
            .unwrap();
        let error = result.error.unwrap();
        assert_eq!(error.code, "TEMPLATE_MISSING");
        assert_eq!(error.details.unwrap()["section"], json!("summary"));
    }

    #[tokio::test]
    async fn unreachable_renderer_is_thrown_for_retry() {
        let mut renderer = MockReportRenderer::new();
        renderer
            .expect_render_section()
            .returning(|_| Err(ServiceError::Unavailable("renderer down".to_owned())));

        let processor = ReportGenerationProcessor::new(Arc::new(renderer));
        let context = RecordingContext::default();

        let error = processor
            .process(active_job(data(None), &context))
            .await
            .unwrap_err();
        assert_eq!(error.kind(), "renderer_unavailable");
    }
}
