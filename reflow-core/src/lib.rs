//! Reflow Core
//!
//! This crate provides the core runtime for the Reflow reactive session
//! engine. It implements:
//!
//! - Reactive primitives (cells, computeds, observers)
//! - A dependency graph with dynamic re-tracking
//! - A batching flush scheduler with priorities, freezing and timers
//! - Event-gated nodes and isolated reads
//! - Sessions that turn client events into output frames
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: Reactive primitives, dependency tracking and the runtime
//! - `graph`: Dependency graph implementation
//! - `session`: Sessions, directives, registry and the wire format
//! - `config`: Runtime and session configuration
//! - `error`: The crate-wide error type
//!
//! # Example
//!
//! ```rust,ignore
//! use reflow_core::reactive::Runtime;
//!
//! let rt = Runtime::new();
//!
//! // Create a cell
//! let count = rt.cell(0);
//!
//! // Create a derived value
//! let doubled = rt.computed({
//!     let count = count.clone();
//!     move || Ok(count.get()? * 2)
//! });
//!
//! // Create an observer
//! rt.observer(move || {
//!     println!("Count: {}, Doubled: {}", count.get()?, doubled.get()?);
//!     Ok(())
//! });
//!
//! // Update the cell
//! count.set(5);
//! // Observer runs in the flush, prints: "Count: 5, Doubled: 10"
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;
pub mod session;

pub use config::{RuntimeConfig, SessionConfig};
pub use error::{ReactiveError, Result};
pub use reactive::{isolate, req, Cell, Computed, Observer, Runtime, Trigger};
pub use session::{OutputFrame, Session, SessionRegistry};
