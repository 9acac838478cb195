//! Processor for CAD/drawing file analysis jobs.
//!
//! Geometry extraction and DFM scoring happen in an external analysis
//! service. When that service is unreachable the processor degrades to a
//! basic heuristic report instead of failing the job, so a single
//! dependency outage lowers quality rather than throughput.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{elapsed_ms, ActiveJob, JobError, JobResult, Processor, ProcessorError, ServiceError};
use crate::job::JobType;

const SUPPORTED_FORMATS: [&str; 11] = [
    "stl", "obj", "step", "stp", "iges", "igs", "3mf", "dxf", "dwg", "svg", "pdf",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAnalysisJobData {
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub correlation_id: Option<String>,
    pub file_id: String,
    pub file_url: String,
    pub file_name: String,
    pub file_type: String,
    pub analysis_options: Option<AnalysisOptions>,
    #[serde(default)]
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalysisOptions {
    pub perform_dfm: bool,
    pub extract_geometry: bool,
    pub calculate_volume: bool,
    pub detect_features: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub file_id: String,
    pub geometry: GeometryReport,
    pub dfm: Option<DfmReport>,
    pub complexity: Complexity,
    pub file_format: String,
    pub file_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeometryReport {
    pub volume: Option<f64>,
    pub surface_area: Option<f64>,
    pub bounding_box: Option<[f64; 3]>,
    pub part_count: u32,
    pub triangle_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DfmReport {
    pub issues: Vec<DfmIssue>,
    pub score: u8,
    pub manufacturable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DfmIssue {
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: Severity,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

/// Fetches raw file contents from blob storage.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FileFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, ServiceError>;
}

/// The external geometry/DFM analysis service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn analyze(
        &self,
        file_name: &str,
        file_type: &str,
        contents: &[u8],
        options: AnalysisOptions,
    ) -> Result<AnalysisReport, ServiceError>;
}

pub struct FileAnalysisProcessor {
    fetcher: Arc<dyn FileFetcher>,
    analysis: Arc<dyn AnalysisService>,
}

impl FileAnalysisProcessor {
    pub fn new(fetcher: Arc<dyn FileFetcher>, analysis: Arc<dyn AnalysisService>) -> Self {
        Self { fetcher, analysis }
    }
}

#[async_trait]
impl Processor for FileAnalysisProcessor {
    const KIND: JobType = JobType::FileAnalysis;
    type Data = FileAnalysisJobData;

    async fn process(&self, job: ActiveJob<Self::Data>) -> Result<JobResult, ProcessorError> {
        let started = Instant::now();
        let data = job.data().clone();
        tracing::info!(
            job_id = %job.id(),
            tenant_id = %data.tenant_id,
            file_name = %data.file_name,
            "Starting file analysis for {}",
            data.file_id
        );

        job.report_progress(10, "Downloading file", "downloading").await;
        let contents = match self.fetcher.fetch(&data.file_url).await {
            Ok(contents) => contents,
            Err(ServiceError::Unavailable(message)) => {
                return Err(ProcessorError::new("storage_unavailable", message));
            }
            Err(ServiceError::Failed { code, message }) => {
                return Ok(JobResult::failure(
                    JobError::new(code, message),
                    elapsed_ms(started),
                ));
            }
        };

        job.report_progress(20, "File downloaded successfully", "validating").await;
        if !is_supported_format(&data.file_type) {
            return Ok(JobResult::failure(
                JobError::new(
                    "UNSUPPORTED_FORMAT",
                    format!("Unsupported file format: {}", data.file_type),
                ),
                elapsed_ms(started),
            ));
        }

        if job.is_cancelled().await {
            return Ok(JobResult::failure(
                JobError::new("CANCELLED", "Job cancelled before analysis"),
                elapsed_ms(started),
            ));
        }

        job.report_progress(30, "Sending to analysis service", "analyzing").await;
        let options = data.analysis_options.unwrap_or_default();
        let report = match self
            .analysis
            .analyze(&data.file_name, &data.file_type, &contents, options)
            .await
        {
            Ok(report) => report,
            Err(ServiceError::Unavailable(message)) => {
                tracing::warn!(
                    job_id = %job.id(),
                    %message,
                    "Analysis service unavailable, using fallback analysis"
                );
                basic_analysis(&data, &contents)
            }
            Err(ServiceError::Failed { code, message }) => {
                return Ok(JobResult::failure(
                    JobError::new(code, message),
                    elapsed_ms(started),
                ));
            }
        };

        job.report_progress(90, "Analysis complete, saving results", "saving").await;
        let result = serde_json::to_value(&report)?;
        job.report_progress(100, "File analysis completed", "done").await;

        Ok(JobResult::success(result, elapsed_ms(started)))
    }
}

fn is_supported_format(file_type: &str) -> bool {
    let lowered = file_type.to_ascii_lowercase();
    SUPPORTED_FORMATS.contains(&lowered.as_str())
}

/// Basic analysis when the worker service is unavailable.
fn basic_analysis(data: &FileAnalysisJobData, contents: &[u8]) -> AnalysisReport {
    AnalysisReport {
        file_id: data.file_id.clone(),
        geometry: GeometryReport {
            part_count: 1,
            ..Default::default()
        },
        dfm: Some(DfmReport {
            issues: Vec::new(),
            score: 100,
            manufacturable: true,
        }),
        complexity: Complexity::Simple,
        file_format: data.file_type.clone(),
        file_size: contents.len() as u64,
    }
}
