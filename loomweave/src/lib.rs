//! Comprehensive hook instrumentation over the `loomir` program
//! representation.
//!
//! The engine inserts calls into an externally supplied, swappable tool
//! library at precisely defined points — function entry/exit, block
//! entry/exit, loop iterations, call sites, memory accesses, allocations
//! and frees, and fork/join boundaries — without altering observable
//! program behavior. Identifier and metadata tables give every
//! instrumented site a dense per-category ID resolved against a load-time
//! base, so independently instrumented units can merge their ID spaces
//! when registered.
//!
//! Entry point: [`Instrumenter`].
//!
//! ```no_run
//! use loomweave::{Instrumenter, InstrumentOptions, InstrumentProfile};
//!
//! # let mut module = loomir::modules::Module::new("unit");
//! Instrumenter::new(InstrumentOptions::default(), InstrumentProfile::permissive())
//!     .run(&mut module)
//!     .expect("instrumentation succeeds");
//! ```
pub mod canonicalize;
pub mod config;
pub mod error;
pub mod finalize;
pub mod hooks;
pub mod instrument;
pub mod props;
pub mod tables;
pub mod tool;

pub use config::{FilterMode, InstrPoint, InstrumentOptions, InstrumentProfile};
pub use error::{WeaveError, WeaveResult};
pub use instrument::Instrumenter;
pub use tables::{EventCategory, MetadataRecord, SizeRecord, UNKNOWN_ID};
