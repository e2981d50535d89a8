//! Receiving side of the request/response protocol.

use super::message::{request_service_name, response_service_name, RequestMessage, ResponseMessage};
use crate::channel::MessageChannel;
use crate::fatal::InvalidMessagePolicy;
use crate::messaging::debug_dump;
use crate::Result;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Business logic answering a request payload.
pub type RequestHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

struct ReceiverInner {
    name: String,
    log_name: String,
    channel: Arc<dyn MessageChannel>,
    handler: RequestHandler,
    policy: InvalidMessagePolicy,
}

/// Serves requests of the requester named `name` with a handler.
///
/// The handler is invoked synchronously in arrival order; each result is sent
/// back once its future settles. Dropping the receiver stops serving.
pub struct RequestReceiver {
    inner: Arc<ReceiverInner>,
}

impl RequestReceiver {
    /// Serve requests on a trusted channel; undecodable requests abort.
    pub fn new(name: impl Into<String>, channel: Arc<dyn MessageChannel>, handler: RequestHandler) -> Self {
        Self::with_policy(name, channel, handler, InvalidMessagePolicy::Abort)
    }

    pub fn with_policy(
        name: impl Into<String>,
        channel: Arc<dyn MessageChannel>,
        handler: RequestHandler,
        policy: InvalidMessagePolicy,
    ) -> Self {
        let name = name.into();
        let inner = Arc::new(ReceiverInner {
            log_name: format!("RequestReceiver<\"{}\">", name),
            name,
            channel: Arc::clone(&channel),
            handler,
            policy,
        });
        let weak = Arc::downgrade(&inner);
        channel.register_service(
            &request_service_name(&inner.name),
            Arc::new(move |payload| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_request(payload);
                }
            }),
        );
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl Drop for RequestReceiver {
    fn drop(&mut self) {
        self.inner
            .channel
            .unregister_service(&request_service_name(&self.inner.name));
    }
}

impl ReceiverInner {
    fn on_request(&self, payload: Value) {
        let Some(request) = RequestMessage::parse(&payload) else {
            self.policy.handle(
                &self.log_name,
                &format!(
                    "failed to parse the received request message: {}",
                    debug_dump(&payload)
                ),
                self.channel.as_ref(),
            );
            return;
        };

        let request_id = request.request_id;
        debug!(
            "{}: received a request with identifier {}, the payload is: {}",
            self.log_name,
            request_id,
            debug_dump(&request.payload)
        );

        let outcome = (self.handler)(request.payload);
        let channel = Arc::clone(&self.channel);
        let service = response_service_name(&self.name);
        let log_name = self.log_name.clone();
        tokio::spawn(async move {
            let outcome = outcome.await;
            if channel.is_disposed() {
                debug!(
                    "{}: cannot send the result for the request with identifier {}: \
                     the message channel is disposed",
                    log_name, request_id
                );
                return;
            }
            let response = match outcome {
                Ok(value) => {
                    debug!(
                        "{}: sending the success response for the request with identifier {}: {}",
                        log_name,
                        request_id,
                        debug_dump(&value)
                    );
                    ResponseMessage::success(request_id, value)
                }
                Err(e) => {
                    debug!(
                        "{}: sending the failure response for the request with identifier {}: {}",
                        log_name, request_id, e
                    );
                    ResponseMessage::failure(request_id, e.to_string())
                }
            };
            if let Err(e) = channel.send(&service, response.to_value()) {
                debug!("{}: failed to send the response: {}", log_name, e);
            }
        });
    }
}
