use chrono::Utc;
use uuid::Uuid;

/// Job ids sort lexicographically by creation time: `YYYYmmdd_HHMMSS_<hex4>`.
pub fn new_job_id() -> String {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let suffix = &Uuid::new_v4().simple().to_string()[..4];
    format!("{stamp}_{suffix}")
}

/// Request ids embed the job id, a monotonic per-job sequence and a human
/// tag: `<job_id>_<seq>_<tag>`. The sequence keeps filename order equal to
/// submission order in the queue directory.
pub fn new_request_id(job_id: &str, seq: u64, tag: &str) -> String {
    format!("{job_id}_{seq:04}_{}", sanitize_component(tag))
}

pub fn validate_job_id(raw: &str) -> Result<(), String> {
    if raw.is_empty() {
        return Err("job id must be non-empty".to_string());
    }
    if raw
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Ok(());
    }
    Err(format!(
        "job id `{raw}` must use only ASCII letters, digits, '-' or '_'"
    ))
}

fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "req".to_string()
    } else {
        cleaned
    }
}
