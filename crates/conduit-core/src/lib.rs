//! Core types and error definitions for Conduit.
//!
//! This crate holds what every other Conduit crate shares: the error
//! taxonomy and the content request/result model exposed by the router.
//!
//! # Main types
//!
//! - [`ConduitError`]: Unified error enum; protocol variants carry the server name.
//! - [`ConduitResult`]: Convenience alias for `Result<T, ConduitError>`.
//! - [`ContentType`]: Kind of content requested (text, image, video, audio, data).
//! - [`ContentRequest`] / [`ContentResult`]: Router input and output.

/// Content request/result model.
pub mod content;
/// Error taxonomy.
pub mod error;

pub use content::{ContentRequest, ContentResult, ContentType, ResultMetadata};
pub use error::{ConduitError, ConduitResult};
