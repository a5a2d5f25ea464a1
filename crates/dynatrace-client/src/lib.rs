//! Dynatrace Management API Client
//!
//! A Rust client for the parts of the Dynatrace management API used by the
//! OneAgent operator: installer metadata, per-host agent versions, token scopes
//! and tenant connection info.
//!
//! # Example
//!
//! ```no_run
//! use dynatrace_client::{ClientOptions, DynatraceClient, DynatraceClientTrait, OS_UNIX, INSTALLER_TYPE_DEFAULT};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = DynatraceClient::new(
//!     "https://tenant.live.dynatrace.com/api".to_string(),
//!     "api-token".to_string(),
//!     "paas-token".to_string(),
//!     ClientOptions::default(),
//! )?;
//!
//! let latest = client.get_latest_agent_version(OS_UNIX, INSTALLER_TYPE_DEFAULT).await?;
//! let scopes = client.get_token_scopes("paas-token").await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod dynatrace_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::{ClientOptions, DynatraceClient};
pub use dynatrace_trait::DynatraceClientTrait;
pub use error::DynatraceError;
pub use models::*;
#[cfg(feature = "test-util")]
pub use mock::MockDynatraceClient;
