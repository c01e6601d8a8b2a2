// ABOUTME: Library crate for data-router
// ABOUTME: Exports configuration, router and routing engine modules

pub mod config;
pub mod error;
pub mod routers;
pub mod routing;

pub use config::RoutingConfig;
pub use error::RouterError;
pub use routers::{DataRouter, RouterRegistry};
pub use routing::{RoutingDaemon, RoutingService};
