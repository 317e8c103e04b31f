pub mod catalog;
pub mod composition;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod invocation;
pub mod negotiation;
pub mod payload;
pub mod routing;
pub mod telemetry;
pub mod type_resolver;
