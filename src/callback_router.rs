use serde_json::Value;
use std::sync::Arc;

use crate::error::TransportError;
use crate::{CallbackAction, CallbackMessage};

/// What a subscription does with an accepted callback.
pub trait CallbackSink {
    fn heartbeat(&self);
    fn push(&self, payload: Value);
    fn stop(&self, error: Option<TransportError>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    Discarded,
    Checked,
    Pushed,
    Completed,
}

/// Authenticates bus messages against the transport's verifier and
/// dispatches them into a subscription.
#[derive(Clone)]
pub struct CallbackRouter {
    verifier: Arc<str>,
}

impl CallbackRouter {
    pub fn new(verifier: Arc<str>) -> Self {
        CallbackRouter { verifier }
    }

    pub fn route(&self, subscription_id: &str, message: Value, sink: &impl CallbackSink) -> Routed {
        let message: CallbackMessage = match serde_json::from_value(message) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(subscription_id, error = %e, "discarding malformed callback");
                return Routed::Discarded;
            }
        };

        // Foreign or forged traffic is expected on a shared bus.
        if message.verifier != *self.verifier
            || message.id != subscription_id
            || message.kind != "subscription"
        {
            tracing::debug!(subscription_id, "discarding unverified callback");
            return Routed::Discarded;
        }

        sink.heartbeat();

        match message.action {
            CallbackAction::Check => Routed::Checked,
            CallbackAction::Next { payload: Some(payload) } => {
                sink.push(payload);
                Routed::Pushed
            }
            CallbackAction::Next { payload: None } => {
                sink.stop(Some(TransportError::ProtocolMisuse(
                    "next callback without payload".to_string(),
                )));
                Routed::Completed
            }
            CallbackAction::Complete { errors } => {
                sink.stop(TransportError::from_remote(errors));
                Routed::Completed
            }
        }
    }
}
