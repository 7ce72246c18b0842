//! Job records exchanged with the coordinator.

use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

/// Coordinator-assigned stacking job identifier.
pub type JobId = i64;

/// Owner of the uploaded frames.
pub type UserId = i64;

/// Fallback subject label when the coordinator sends none.
pub const UNKNOWN_OBJECT: &str = "unknown";

/// A claimed stacking job, as returned by claim-next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub user_id: UserId,
    pub upload_session_id: i64,
    /// Partition key grouping the frames that are stacked together.
    pub chunk_key: String,
    /// Human-readable target name, e.g. `"M 31"`.
    #[serde(default)]
    pub object_name: Option<String>,
    #[serde(default)]
    pub frame_count: i64,
    #[serde(default)]
    pub session_ucloud_path: Option<String>,
}

impl Job {
    /// Subject label, falling back to [`UNKNOWN_OBJECT`] when absent or blank.
    pub fn subject(&self) -> &str {
        match self.object_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => UNKNOWN_OBJECT,
        }
    }
}

/// One raw input frame belonging to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputFile {
    /// The coordinator encodes this as either a JSON number or a string.
    #[serde(deserialize_with = "de_flexible_id")]
    pub id: i64,
    pub filename: String,
    /// Where the coordinator keeps the raw file. Informational only.
    #[serde(default)]
    pub ucloud_path: Option<String>,
}

impl InputFile {
    /// File name safe to join onto a local directory.
    ///
    /// Strips any directory components sent by the coordinator so a
    /// download can never land outside the job's workspace.
    pub fn local_name(&self) -> String {
        Path::new(&self.filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty() && n != "." && n != "..")
            .unwrap_or_else(|| format!("input_{}.fit", self.id))
    }
}

/// Envelope returned by fetch-inputs.
#[derive(Debug, Clone, Deserialize)]
pub struct JobFiles {
    #[serde(deserialize_with = "de_flexible_id")]
    pub job_id: JobId,
    #[serde(default)]
    pub chunk_key: Option<String>,
    #[serde(default)]
    pub files: Vec<InputFile>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FlexibleId {
    Number(i64),
    Text(String),
}

fn de_flexible_id<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    match FlexibleId::deserialize(deserializer)? {
        FlexibleId::Number(n) => Ok(n),
        FlexibleId::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid numeric id '{s}'"))),
    }
}
