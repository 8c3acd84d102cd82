use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid handle {0:?}")]
    InvalidHandle(String),
}
