//! endpoint-operator: registers pod-declared IPs in service Endpoints

pub mod client;
pub mod config;
pub mod controllers;
pub mod endpoint;
pub mod health;
pub mod operator;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::Cli;
pub use endpoint::{Endpoint, EndpointError, ReconcileResource};
pub use operator::{BootState, Operator};
