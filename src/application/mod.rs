//! Application layer - Use cases and application services
//!
//! This layer orchestrates domain objects to fulfill use cases.
//! It's responsible for:
//! - Turning an activation request into a call placement
//! - Enforcing the cooldown and single-call guards

pub mod trigger;

pub use trigger::{Activation, TriggerGateway};
