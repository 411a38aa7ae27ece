//! # Core Types
//!
//! This crate defines the identifiers shared by the messaging crates.
//!
//! ## Philosophy
//!
//! - **Explicit over implicit**: Routing targets are typed, not bare integers
//! - **Stable encoding**: Identifiers have a fixed bit width so they can be
//!   packed into message ids without loss
//!
//! ## Key Types
//!
//! - [`RoutingId`]: The routing target a message is addressed to

pub mod ids;

pub use ids::RoutingId;
