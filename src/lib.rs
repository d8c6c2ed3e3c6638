pub mod call;
pub mod config;
pub mod error;
pub mod event;
pub mod media;
pub mod negotiation;
pub mod presence;
pub mod useragent;
pub mod version;

pub use error::{DeskError, Result};

// get timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
