//! Publish authentication
//!
//! Publishers are admitted with short-lived single-use tokens minted by the
//! control API and presented in the RTMP publishing name
//! (`streamKey?token=...`). Validation and consumption happen as one atomic
//! check-and-set, so two racing publishers can never both succeed on the
//! same token.

pub mod store;
pub mod token;

pub use store::{TokenStore, TokenStoreConfig};
pub use token::PublishToken;
