pub mod config;
pub mod error;
pub mod text;
pub mod types;

pub use config::Config;
pub use error::HarvestError;
pub use text::{bio_mentions, normalize_handle, parse_api_timestamp, parse_id};
pub use types::*;
