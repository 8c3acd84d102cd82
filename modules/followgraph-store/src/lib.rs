pub mod backlog;
pub mod error;
pub mod posts;
pub mod store;
#[cfg(feature = "test-utils")]
pub mod testutil;

pub use error::{Result, StoreError};
pub use store::PgStore;
