//! sift core library: fingerprint store, source tree cache, stability
//! classification and the session engine.
//!
//! The main entry point is [`session::Session`], which a test-runner
//! integration drives over a [`store::FingerprintStore`].

pub mod config;
pub mod error;
pub mod session;
pub mod source_tree;
pub mod stability;
pub mod store;
pub mod types;

pub use config::SiftConfig;
pub use error::{Result, SiftError};
pub use session::Session;
