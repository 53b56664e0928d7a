//! Connection state tracking.

pub mod machine;

pub use machine::{ConnectionState, StateCell, Transition};
