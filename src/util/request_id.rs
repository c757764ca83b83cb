//! Request ids carried in `X-Request-Id`.

use uuid::Uuid;

/// Generate a new UUID-based request id.
pub fn generate_request_id() -> String {
    Uuid::new_v4().to_string()
}
