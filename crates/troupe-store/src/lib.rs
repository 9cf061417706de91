//! Session persistence for the troupe engine: the [`SessionStore`] contract and an
//! in-memory reference implementation.

pub mod error;
pub mod memory;
pub mod session;
pub mod store;

pub use error::StoreError;
pub use memory::InMemorySessionStore;
pub use session::{ResumableRun, Session, SuspendedRun, DEFAULT_MAX_HISTORY};
pub use store::SessionStore;
