//! Remote layout and filename conventions for stacked outputs.
//!
//! Convention:
//! `{base}/stacks/user_{user_id}/{safe_object}/stack_{chunk_key}_{job_id}.fits`
//! with the preview alongside as `..._thumb.png`.

use crate::types::Job;

/// Longest error message accepted by the coordinator.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 500;

/// Make a subject label safe to use as a single path component.
///
/// ```
/// use crowdsky_core::naming::safe_object_name;
///
/// assert_eq!(safe_object_name("M 31"), "M_31");
/// assert_eq!(safe_object_name("NGC 7000/North"), "NGC_7000_North");
/// ```
pub fn safe_object_name(name: &str) -> String {
    name.replace(['/', ' '], "_")
}

/// Remote directory that receives a job's outputs.
pub fn remote_stack_dir(base_path: &str, job: &Job) -> String {
    format!(
        "{}/stacks/user_{}/{}",
        base_path.trim_end_matches('/'),
        job.user_id,
        safe_object_name(job.subject()),
    )
}

/// Filename of the stacked output.
pub fn stack_filename(job: &Job) -> String {
    format!("stack_{}_{}.fits", job.chunk_key, job.job_id)
}

/// Filename of the preview image derived from the stacked output.
pub fn thumbnail_filename(job: &Job) -> String {
    format!("stack_{}_{}_thumb.png", job.chunk_key, job.job_id)
}

/// Truncate an error message to [`MAX_ERROR_MESSAGE_CHARS`] characters.
///
/// Counts characters, not bytes, so multi-byte text is never split.
pub fn truncate_message(message: &str) -> String {
    message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
}
