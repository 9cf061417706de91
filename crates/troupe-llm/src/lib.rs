//! Model-side test doubles for the troupe engine.

pub mod mock;

pub use mock::{MockProvider, MockResponse};
