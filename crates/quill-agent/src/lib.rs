//! Session and event-stream coordination for an embedded agent.
//!
//! The crate is organized around a single reducer: engine events and caller
//! operations are transitions over [`state::CoordinatorState`], returning
//! [`effect::Effect`]s for the async [`coordinator::Coordinator`] to carry
//! out. Multi-session conversations persist through [`store::SessionStore`];
//! oversized conversations are condensed in the background by the
//! compaction pipeline in [`compact`].

pub mod compact;
pub mod config;
pub mod coordinator;
pub mod effect;
pub mod engine;
pub mod error;
pub mod estimate;
pub mod event;
pub mod reduce;
pub mod session;
pub mod state;
pub mod store;
pub mod types;

pub use config::AgentConfig;
pub use coordinator::Coordinator;
pub use effect::{Effect, Notification};
pub use engine::{ExecutionEngine, SessionSync, Summarizer, TaskContext};
pub use error::{Error, Result};
pub use event::EngineEvent;
pub use reduce::reduce;
pub use session::{AgentSession, AgentTag, Attachment, Message, Role, TaskInput};
pub use state::{AgentStatus, CoordinatorState, DurableState};
pub use store::{InMemorySessionStore, JsonSessionStore, SessionStore};
pub use types::{RequestId, SessionId};
