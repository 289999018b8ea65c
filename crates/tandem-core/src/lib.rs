pub mod config;
pub mod error;
pub mod types;

pub use config::TandemConfig;
pub use error::{Result, TandemError};
pub use types::*;
