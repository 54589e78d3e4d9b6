//! Session lifecycle, agent stream adapter, permission broker, and
//! persistent message log for the conductor server.
//!
//! [`Coordinator`] is the single entry point the gateway talks to; every
//! other type in this crate is a collaborator it composes.

pub mod adapter;
pub mod broker;
pub mod coordinator;
pub mod envelope;
pub mod error;
pub mod log_store;
pub mod model;
pub mod parser;
pub mod registry;
pub mod transport;

pub use broker::{PermissionBroker, PermissionDecision, PermissionOutcome};
pub use coordinator::{Coordinator, UiEvent};
pub use envelope::{ContentBlock, EnvelopeType, MessageEnvelope, PermissionSuggestion, Role};
pub use error::CoreError;
pub use log_store::{LogStore, Page};
pub use model::{CreateOptions, LastError, PermissionMode, Session, SessionState};
pub use registry::SessionRegistry;
pub use transport::{AgentTransport, ProcessTransportFactory, TransportFactory};
