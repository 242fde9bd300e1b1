// Admission Gate
//
// Per-request admission checks that run before a call is forwarded: the
// sliding-window rate limiter, the request deduplicator, the JSON-RPC
// envelope validator and the per-tool argument schema validator.

pub mod dedup;
pub mod ratelimit;
pub mod schema;
pub mod validator;

pub use dedup::{DedupConfig, FingerprintAlgorithm, RequestDeduplicator};
pub use ratelimit::{RateLimitConfig, RateLimitDecision, RateLimitSlidingWindow};
pub use schema::{SchemaError, ToolSchemaValidator};
pub use validator::{RequestValidator, ValidationOutcome, ValidatorConfig};
