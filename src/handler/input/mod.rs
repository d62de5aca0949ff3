//! Input action handling: per-context source state, key normalization and
//! the tick dispatcher translating action columns into CDP input events.

pub mod dispatcher;
pub mod keys;
pub mod sources;

pub use dispatcher::ActionDispatcher;
pub use sources::{ContextInput, InputState, InputStateManager};
