//! Local SMTP relay: store-and-forward with Alertmanager diversion and LLM
//! subject enrichment.

pub mod alerting;
pub mod breaker;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod llm;
pub mod pipeline;
pub mod relay;
pub mod startup;
pub mod store;
pub mod transport;

pub use error::{Error, Result};
pub use relay::{Relay, RelayDeps};
