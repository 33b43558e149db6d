pub mod body;
pub mod error;
pub mod redact;

pub use body::{BodyValue, CapturedBody, decompress_body, MAX_CAPTURED_BODY_BYTES};
pub use error::{ErrorKind, GatewayError, GatewayResult};
pub use redact::{api_key_hash, is_sensitive_header, redact_headers, REDACTED};
