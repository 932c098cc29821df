//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for the upstream socket and dispatch callbacks.
pub mod ports;

/// Application services for subscriptions, charting and catalog access.
pub mod services;
