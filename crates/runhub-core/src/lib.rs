//! Core library of the runhub remote execution service.
//!
//! Clients upload programs over an authenticated control channel; runhub builds or
//! lints them and, on request, runs each one in a disposable container. Running
//! programs dial back over a token-authenticated binding channel to fetch their
//! injected connections and to stream output, which reaches the single registered
//! observer through an ordered delivery queue.
//!
//! # Architecture Overview
//!
//! - **Transport**: NUL-framed command dispatch over plain or TLS streams, one task per
//!   connection, one [`transport::CommandTable`] per listener
//! - **Program registry**: uploaded programs and their on-disk descriptors
//! - **Build pipeline**: dependency manifests, lint containers and compilation
//! - **Orchestrator**: container create, populate, start, await and teardown
//! - **Delivery queue**: unbounded FIFO of events pushed to the observer
//! - **Binding**: session tokens tying container connections to executions
//! - **Cancellation**: an arena of scopes (root, program, execution, connection)

pub mod binding;
pub mod builder;
pub mod cancel;
pub mod config;
pub mod control;
pub mod errors;
pub mod hub;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod runtime;
pub mod transport;
pub mod wire;

pub use builder::{Builder, ToolchainBuilder};
pub use config::{ConfigLoader, HubConfig};
pub use errors::{BuildError, HubError, HubResult, RuntimeError};
pub use hub::{Hub, HubHandle};
pub use orchestrator::{InjectedConnection, Orchestrator};
pub use queue::DeliveryQueue;
pub use registry::{Language, ProgramRegistry};
pub use runtime::{ContainerRuntime, DockerRuntime, MemoryRuntime};
