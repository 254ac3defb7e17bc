pub mod clock;
pub mod fs_atomic;
pub mod ids;

pub use clock::{now_secs, utc_timestamp};
pub use fs_atomic::{atomic_write_file, tail_lines};
pub use ids::{new_job_id, new_request_id, validate_job_id};
