//! Flash block lifecycle and garbage collection for a simulated SSD.
//!
//! The [`Controller`] owns the media state, the free-space pool, the GC
//! candidate sets and the in-flight reclamation records. A [`Scheduler`] and
//! an [`AddressTranslator`] are passed into each completion handler through
//! [`Io`]; [`Simulator`] wires both to a simple event queue.

pub mod address;
pub mod candidates;
pub mod config;
pub mod controller;
pub mod error;
pub mod ftl;
pub mod gc;
pub mod media;
pub mod ops;
pub mod policy;
pub mod pool;
pub mod sim;
pub mod stats;

pub use address::{Address, AddressValid};
pub use candidates::{CandidateTracker, GcScope};
pub use config::{Config, ConfigError, PolicyKind};
pub use controller::{Controller, Io};
pub use error::{Error, Result};
pub use ftl::{AddressTranslator, PageMap};
pub use gc::{CancelReason, GcOutcome};
pub use media::{Block, BlockState, Flash, Page, PageState};
pub use ops::{GcKind, Migration, MigrationMode, OpKind, Operation, Scheduler};
pub use policy::{AllocationPolicy, HotCold, PolicyView, ShortestQueue};
pub use sim::{EventQueue, Simulator};
pub use stats::Stats;
