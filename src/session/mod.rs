//! Session ownership: state, persistence, transports and the coordinator.

pub mod coordinator;
pub mod state;
pub mod store;
pub mod tracker;
pub mod transport;

pub use coordinator::{SessionCoordinator, SessionHandle, SessionOptions};
pub use state::SessionState;
pub use store::{InMemorySessionStore, JsonFileSessionStore, SessionStore};
pub use tracker::{FileReadRecord, RuntimeStore};
pub use transport::{ChannelTransport, QuestionRequest, Transport, TransportSlot};
