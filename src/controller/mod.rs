pub mod cluster_reconciler;
pub mod context;
pub mod error;
pub mod inspection_reconciler;

pub use context::Context;
pub use error::{BackoffConfig, Error, Result};
