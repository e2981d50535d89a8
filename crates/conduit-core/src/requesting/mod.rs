//! Request/response correlation over message channels.
//!
//! A [`Requester`] turns outgoing payloads into futures; a
//! [`RequestReceiver`] on the other end runs a handler per request and sends
//! the outcome back. Failures reported by the handler travel verbatim and
//! surface as [`ConduitError::Remote`](crate::ConduitError::Remote).

pub mod message;
pub mod receiver;
pub mod requester;

pub use message::{
    request_service_name, response_service_name, RequestMessage, ResponseMessage, ResponseOutcome,
};
pub use receiver::{RequestHandler, RequestReceiver};
pub use requester::{ReplyFuture, Requester};
