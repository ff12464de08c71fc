//! Agency — multi-tenant agent task scheduler core.

pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod nudge;
pub mod queue;
pub mod recovery;
pub mod runtime;
pub mod store;
pub mod tenant;
pub mod workflow;
pub mod workspace;
