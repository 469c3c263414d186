// Core infrastructure shared by the router and the row stores

pub mod config;
pub mod errors;

// Re-export commonly used types
pub use config::{AbortScope, RouterConfig, RouterConfigBuilder};
pub use errors::{Result, RouterError};
