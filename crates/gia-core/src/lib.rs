//! Core domain model for the image aggregation pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "gia-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Scheduled,
    Manual,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Finished,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Finished => "finished",
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Running,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    #[default]
    Image,
}

/// Registry of supported image sources. Parsing a name is the only way in,
/// so an unregistered name surfaces as [`UnknownSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceName {
    Civitai,
    Lexica,
    Midjourney,
    Prompthero,
}

impl SourceName {
    pub const ALL: [SourceName; 4] = [
        SourceName::Civitai,
        SourceName::Lexica,
        SourceName::Midjourney,
        SourceName::Prompthero,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Civitai => "civitai",
            Self::Lexica => "lexica",
            Self::Midjourney => "midjourney",
            Self::Prompthero => "prompthero",
        }
    }

    pub fn all_names() -> Vec<String> {
        Self::ALL.iter().map(|s| s.as_str().to_string()).collect()
    }
}

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown image source: {0}")]
pub struct UnknownSource(pub String);

impl FromStr for SourceName {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| UnknownSource(s.to_string()))
    }
}

/// Per-source result embedded in a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceOutcome {
    #[serde(default)]
    pub content_kind: ContentKind,
    pub source_name: String,
    pub fetched_count: u64,
    pub inserted_count: u64,
    pub status: SourceStatus,
}

impl SourceOutcome {
    pub fn running(source_name: impl Into<String>) -> Self {
        Self {
            content_kind: ContentKind::Image,
            source_name: source_name.into(),
            fetched_count: 0,
            inserted_count: 0,
            status: SourceStatus::Running,
        }
    }

    pub fn success(source_name: impl Into<String>, fetched_count: u64, inserted_count: u64) -> Self {
        Self {
            fetched_count,
            inserted_count,
            status: SourceStatus::Success,
            ..Self::running(source_name)
        }
    }

    pub fn failed(source_name: impl Into<String>) -> Self {
        Self {
            status: SourceStatus::Failed,
            ..Self::running(source_name)
        }
    }
}

/// One ingestion run across a set of sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationJob {
    pub id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub sources: Vec<SourceOutcome>,
}

impl AggregationJob {
    /// A fresh running job. An empty `source_names` means "every supported source".
    pub fn start(kind: JobKind, source_names: &[String]) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            status: JobStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            sources: source_names.iter().map(SourceOutcome::running).collect(),
        }
    }

    pub fn requested_sources(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.source_name.clone()).collect()
    }

    pub fn finish(&mut self, outcomes: Vec<SourceOutcome>) {
        self.status = JobStatus::Finished;
        self.finished_at = Some(Utc::now());
        self.sources = outcomes;
    }

    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    pub name: String,
    pub is_trusted: bool,
}

impl SourceRef {
    pub fn new(name: impl Into<String>, is_trusted: bool) -> Self {
        Self {
            name: name.into(),
            is_trusted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// One normalized image observation handed from a fetcher to persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestedImageRecord {
    pub source: SourceRef,
    pub original_id: Option<String>,
    pub image_url: String,
    pub dimensions: Option<Dimensions>,
    pub created_at: Option<DateTime<Utc>>,
    pub author: Option<String>,
    pub prompt: Option<String>,
    pub negative_prompt: Option<String>,
    pub model: Option<String>,
    pub format: Option<String>,
    #[serde(default)]
    pub content_tags: Vec<String>,
    #[serde(default)]
    pub technical_tags: Vec<String>,
    pub publication_url: Option<String>,
    pub job_id: Option<Uuid>,
}

impl IngestedImageRecord {
    pub fn new(source: SourceRef, image_url: impl Into<String>) -> Self {
        Self {
            source,
            original_id: None,
            image_url: image_url.into(),
            dimensions: None,
            created_at: None,
            author: None,
            prompt: None,
            negative_prompt: None,
            model: None,
            format: None,
            content_tags: Vec::new(),
            technical_tags: Vec::new(),
            publication_url: None,
            job_id: None,
        }
    }

    /// Uniqueness key; `None` for records that never recovered a stable id.
    pub fn dedup_key(&self) -> Option<(&str, &str)> {
        self.original_id
            .as_deref()
            .map(|id| (self.source.name.as_str(), id))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    pub fn offset(&self) -> u64 {
        u64::from(self.page.max(1) - 1) * u64::from(self.limit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPage {
    pub total: u64,
    pub page: u32,
    pub jobs: Vec<AggregationJob>,
}

/// Trim and drop empty strings so absent fields stay absent.
pub fn non_empty(value: impl AsRef<str>) -> Option<String> {
    let trimmed = value.as_ref().trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Collapse runs of whitespace into single spaces.
pub fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercased file extension of the last path segment, ignoring query and fragment.
pub fn format_from_url(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let path = path.split_once("://").map(|(_, rest)| rest).unwrap_or(path);
    let (_, segment) = path.rsplit_once('/')?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
