//! Types shared between the judge core and its callers.
//!
//! Everything here is plain data: no Docker, no tokio. The web application
//! talks JSON with camelCase keys, so every wire type is renamed accordingly.

pub mod status;
pub mod types;

pub use status::{BatchProgress, ExecutionStatus, ProcessedResult, StatusCode, StatusPatch, Verdict};
pub use types::{
    ExecutionRequest, Language, QuestionLimits, ResourceLimits, TestCase, Token, UnknownLanguage,
};
