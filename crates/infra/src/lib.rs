//! Infrastructure layer: event store, dispatch pipeline, read models.

pub mod command_dispatcher;
pub mod event_store;
pub mod projections;
pub mod read_model;
