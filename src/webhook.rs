use http::StatusCode;
use serde_json::Value;

use crate::CallbackMessage;
use crate::pubsub::{PubSub, callback_topic};

/// Subscription id addressed by `request_path`, if it lies under `callback_path`.
pub fn callback_id<'a>(callback_path: &str, request_path: &'a str) -> Option<&'a str> {
    let id = request_path
        .strip_prefix(callback_path.trim_end_matches('/'))?
        .strip_prefix('/')?;
    (!id.is_empty() && !id.contains('/')).then_some(id)
}

/// Republishes an inbound callback onto the bus.
///
/// `204` when a live subscription took it, `404` when nobody listens on that
/// path any more (the subgraph should stop sending), `400` for bodies that
/// are not callback messages for this path.
pub fn accept_callback(
    bus: &dyn PubSub,
    callback_path: &str,
    request_path: &str,
    body: &[u8],
) -> StatusCode {
    let Some(id) = callback_id(callback_path, request_path) else {
        return StatusCode::NOT_FOUND;
    };

    let message: Value = match serde_json::from_slice(body) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(subscription_id = id, error = %e, "rejecting callback with invalid JSON");
            return StatusCode::BAD_REQUEST;
        }
    };
    match serde_json::from_value::<CallbackMessage>(message.clone()) {
        Ok(parsed) if parsed.id == id => {}
        Ok(_) => return StatusCode::BAD_REQUEST,
        Err(e) => {
            tracing::debug!(subscription_id = id, error = %e, "rejecting malformed callback");
            return StatusCode::BAD_REQUEST;
        }
    }

    match bus.publish(&callback_topic(callback_path, id), message) {
        0 => {
            tracing::debug!(subscription_id = id, "callback for unknown subscription");
            StatusCode::NOT_FOUND
        }
        _ => StatusCode::NO_CONTENT,
    }
}
