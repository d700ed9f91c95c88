//! Message processing between the store and the upstream relay.
//!
//! [`DecisionPipeline`] runs every dequeued message through the void
//! filter, alert diversion, recipient defaulting and subject rewriting
//! before handing it to the connection.

pub mod html;
pub mod message;
pub mod processor;
pub mod rules;

pub use message::MailMessage;
pub use processor::{Decision, DecisionPipeline};
