use serde::{Deserialize, Serialize};

/// Unix epoch microseconds, the timestamp unit used across repositories and
/// queue bookkeeping.
pub fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

pub const MICROS_PER_SEC: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<JobStatus> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// The legal transition table. Pending jobs can be dispatched, fail
    /// validation, or be cancelled; processing jobs can complete, fail, be
    /// cancelled, or go back to pending for a retry; failed jobs can be
    /// explicitly retried. Terminal states other than failed admit nothing.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Processing, Pending)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Failed, Pending)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Join,
    AudioOverlay,
    TextOverlay,
    Subtitles,
    VideoOverlay,
    Combined,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Join => "join",
            JobType::AudioOverlay => "audio_overlay",
            JobType::TextOverlay => "text_overlay",
            JobType::Subtitles => "subtitles",
            JobType::VideoOverlay => "video_overlay",
            JobType::Combined => "combined",
        }
    }

    pub fn parse(s: &str) -> Option<JobType> {
        match s {
            "join" => Some(JobType::Join),
            "audio_overlay" => Some(JobType::AudioOverlay),
            "text_overlay" => Some(JobType::TextOverlay),
            "subtitles" => Some(JobType::Subtitles),
            "video_overlay" => Some(JobType::VideoOverlay),
            "combined" => Some(JobType::Combined),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Probed container/stream metadata for a stored asset.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MediaInfo {
    pub duration_seconds: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<f64>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub bit_rate: Option<i64>,
}

/// One stored binary plus its metadata. Immutable after creation except for
/// the soft-delete flag and the probed media columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: i64,
    pub owner_id: i64,
    pub filename: String,
    pub object_name: String,
    pub size: i64,
    pub media_type: String,
    #[serde(default)]
    pub media_info: Option<MediaInfo>,
    pub is_deleted: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    pub owner_id: i64,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub config: serde_json::Value,
    pub input_file_ids: Vec<i64>,
    pub output_file_ids: Vec<i64>,
    pub error_message: Option<String>,
    pub progress: f64,
    pub result: Option<serde_json::Value>,
    pub retry_count: i32,
    pub priority: i32,
    pub created_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobStats {
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub processing: i64,
    pub pending: i64,
    pub cancelled: i64,
}

/// A durable queue entry. Workers resolve everything else from the job
/// repository, so only the job id and attempt number travel on the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: i64,
    pub job_id: i64,
    pub attempt: i32,
    pub priority: i32,
}

/// Ephemeral multi-part upload state kept in the shared store under a TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: String,
    pub owner_id: i64,
    pub filename: String,
    pub total_size: i64,
    pub total_chunks: u32,
    pub media_type: String,
    pub received: std::collections::BTreeSet<u32>,
    pub created_at: i64,
}

impl UploadSession {
    pub fn is_complete(&self) -> bool {
        self.received.len() as u32 == self.total_chunks
            && self.received.iter().next_back().is_none_or(|last| *last < self.total_chunks)
    }

    pub fn chunk_object_name(&self, index: u32) -> String {
        format!("temp/chunks/{}_{}", self.id, index)
    }
}
