//! Stack metadata reported back to the coordinator on completion.
//!
//! The processing step reports per-frame header values; this module
//! folds them into the single record the coordinator stores. Values are
//! passed through, never recomputed from pixel data.

use serde::{Deserialize, Serialize};

use crate::types::JobId;

/// Header values of one input frame, as read by the processing step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Exposure time in seconds.
    #[serde(default)]
    pub exptime: Option<f64>,
    /// ISO-8601 observation timestamp, compared as a plain string.
    #[serde(default)]
    pub date_obs: Option<String>,
    #[serde(default)]
    pub ra: Option<f64>,
    #[serde(default)]
    pub dec: Option<f64>,
}

/// What the processing step reports after writing its output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackSummary {
    pub n_frames_input: u32,
    pub n_aligned: u32,
    /// Present only when the step produced a star table.
    #[serde(default)]
    pub n_stars_detected: Option<u32>,
    #[serde(default)]
    pub frames: Vec<FrameHeader>,
}

/// Aggregated metadata for one stacked output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackMetadata {
    pub n_frames_input: u32,
    pub n_frames_aligned: u32,
    pub n_stars_detected: Option<u32>,
    pub total_exptime: Option<f64>,
    pub date_obs_start: Option<String>,
    pub date_obs_end: Option<String>,
    pub ra_deg: Option<f64>,
    pub dec_deg: Option<f64>,
}

impl From<&StackSummary> for StackMetadata {
    fn from(summary: &StackSummary) -> Self {
        let frames = &summary.frames;

        let exptimes: Vec<f64> = frames.iter().filter_map(|f| f.exptime).collect();
        let total_exptime = (!exptimes.is_empty()).then(|| exptimes.iter().sum::<f64>());

        let dates = frames.iter().filter_map(|f| f.date_obs.as_deref());
        let date_obs_start = dates.clone().min().map(str::to_string);
        let date_obs_end = dates.max().map(str::to_string);

        Self {
            n_frames_input: summary.n_frames_input,
            n_frames_aligned: summary.n_aligned,
            n_stars_detected: summary.n_stars_detected,
            total_exptime,
            date_obs_start,
            date_obs_end,
            ra_deg: mean(frames.iter().filter_map(|f| f.ra)),
            dec_deg: mean(frames.iter().filter_map(|f| f.dec)),
        }
    }
}

/// Arithmetic mean, or `None` for an empty sequence.
fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0u32), |(s, n), v| (s + v, n + 1));
    (count > 0).then(|| sum / f64::from(count))
}

/// Body of the report-success call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionReport {
    pub job_id: JobId,
    /// Bulk-storage path of the stacked output.
    pub ucloud_path: String,
    /// Bulk-storage path of the preview image, `null` when none was made.
    pub thumbnail_path: Option<String>,
    pub file_size_bytes: u64,
    #[serde(flatten)]
    pub metadata: StackMetadata,
}
