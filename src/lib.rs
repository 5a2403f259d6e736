pub mod config;
pub mod error;
pub mod observability;
pub mod pipeline;

// Domain data shapes shared across layers
pub mod domain;

// Layered boundaries for application and infrastructure
pub mod app;
pub mod infra;
