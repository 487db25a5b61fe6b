//! Muse Client SDK.
//!
//! A client library for applications that submit image generations on
//! behalf of a signed-in user.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use muse_client::{MuseClient, PollOptions};
//! use muse_core::GenerationRequest;
//!
//! # async fn example() -> Result<(), muse_client::ClientError> {
//! let client = MuseClient::new("http://muse.internal:8080", "user-jwt")?;
//!
//! let estimate = client.estimate(&GenerationRequest::new("a lighthouse at dusk")).await?;
//! println!("This will cost {} tokens", estimate.token_cost);
//!
//! let submitted = client
//!     .submit_generation(&GenerationRequest::new("a lighthouse at dusk"))
//!     .await?;
//!
//! let finished = client
//!     .wait_for_completion(&submitted.task_id, PollOptions::new(Duration::from_secs(2)))
//!     .await?;
//! for asset in &finished.assets {
//!     println!("{}", asset.url);
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod client;
mod error;
mod types;

pub use client::{ClientOptions, MuseClient, PollOptions};
pub use error::ClientError;
pub use types::*;
