//! # devwatch
//!
//! A local development orchestrator for backend services.
//!
//! devwatch discovers services by walking a root directory for `devwatch.yaml`
//! descriptors, runs each one under its own lifecycle supervisor, restarts a
//! service when its sources change, regenerates derived code (protobuf and
//! schema artifacts) when generation inputs change, and tears everything down
//! in dependency-aware order on shutdown.
//!
//! ## Quick start
//!
//! ```no_run
//! use devwatch::Registry;
//!
//! # async fn example() -> Result<(), devwatch::Error> {
//! // Discover every service under the backend root
//! let registry = Registry::discover("backend", &[])?;
//!
//! // Start them all; dependencies gate readiness automatically
//! registry.start_all().await;
//!
//! // ... until shutdown is requested
//! registry.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency model
//!
//! Each service runs one sequential supervisor loop as an independent tokio
//! task. There is no parallelism inside a supervisor, only between them.
//! External intents (`start`, `stop`, `restart`, `end`, regenerate) are
//! delivered through a single-slot action hand-off and consumed strictly in
//! order.

pub mod codegen;
pub mod config;
pub mod debounce;
pub mod error;
pub mod probe;
pub mod registry;
pub mod supervisor;
pub mod watch;

pub use config::Descriptor;
pub use debounce::Debouncer;
pub use error::{Error, Result};
pub use registry::Registry;
pub use supervisor::{Action, StateKind, Supervisor};
