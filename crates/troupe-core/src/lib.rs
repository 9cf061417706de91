//! Core types shared by every troupe crate: messages, tool and model capabilities,
//! human-in-the-loop records, traces and the event vocabulary.

pub mod checkpoint;
pub mod context;
pub mod errors;
pub mod events;
pub mod hitl;
pub mod ids;
pub mod messages;
pub mod provider;
pub mod schema;
pub mod stream;
pub mod tools;
pub mod trace;
