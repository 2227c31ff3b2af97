//! Speechgate - a stable local endpoint in front of short-lived speech backends
//!
//! Backends are provisioned on demand by an external collaborator, live for a
//! few hours at most and are reachable only through a tunnel address assigned
//! when they come up. This library:
//! - Serves the synthesis and voice-listing routes at a fixed local address
//! - Reuses a healthy backend or provisions a new one, one attempt at a time
//! - Rotates credentials and fails over when a resource class is exhausted
//! - Keeps active backends alive and retires them when they stop answering
//! - Persists instance history so a restart can pick up where it left off

pub mod admin;
pub mod command;
pub mod config;
pub mod credentials;
pub mod error;
pub mod healthcheck;
pub mod instance;
pub mod orchestrator;
pub mod provisioner;
pub mod proxy;
pub mod registry;
pub mod store;
pub mod supervisor;
pub mod upstream;
