//! Agent abstraction, registry and selection for Conductor.
//!
//! - [`AgentHandle`]: the trait every agent implements.
//! - [`AgentRegistry`]: owns registered agents and their type/capability indices.
//! - [`AgentSelector`]: routes tasks and ranks candidates for negotiation.
//! - [`HttpAgent`], [`LocalAgent`]: remote and in-process agents.
//! - [`Discovery`]: registers remote agents from their published cards.

/// Configuration sections for agents, health checks, discovery and routing.
pub mod config;
/// Agent discovery through published agent cards.
pub mod discovery;
/// The agent trait.
pub mod handle;
/// Agents reached over HTTP.
pub mod http;
/// In-process agents.
pub mod local;
/// Agent registry and health monitoring.
pub mod registry;
/// Task routing and negotiation.
pub mod selector;

pub use config::{AgentConfig, DiscoveryConfig, HealthConfig, SelectionConfig};
pub use discovery::{AgentCard, Discovery, DiscoveryReport, WELL_KNOWN_PATH};
pub use handle::AgentHandle;
pub use http::HttpAgent;
pub use local::{LocalAgent, LocalHandler};
pub use registry::{AgentRegistry, HealthSummary, RegistrySnapshot};
pub use selector::{
    AgentSelector, NegotiationCandidate, NegotiationOutcome, NegotiationRequest, Preferences,
};
