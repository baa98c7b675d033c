//! Uniform chat-platform abstraction for the orchestrator.
//!
//! Every platform implements the [`Connector`] trait; the
//! [`router::ConnectorRouter`] owns connector lifecycles, routes inbound
//! messages to agents through the `AgentService` seam, and relays agent
//! state transitions to bound channels. Concrete platform SDK bindings are
//! registered by the embedding application via [`factory::ConnectorFactory`].

pub mod factory;
pub mod mock;
pub mod router;
pub mod state;
pub mod types;

pub use factory::{BuildOutcome, ConnectorFactory};
pub use router::{AgentNote, ConnectorRouter, ProjectNotifier};
pub use state::{next_state, transition, InstanceEvent, InstanceState};
pub use types::{
    chunk_text, ActionButton, Attachment, ButtonCallback, ChannelInfo, Connector, InboundMessage,
    MediaKind, OutboundMessage, PlatformError, CHUNK_LIMIT,
};
