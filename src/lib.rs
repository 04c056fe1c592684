pub mod conduit;
pub mod config;
pub mod correspondence;
pub mod error;
pub mod layout;
pub mod map;
pub mod redistribute;
pub mod report;
pub mod runtime;
pub mod stats;
pub mod task;
pub mod transfer;
pub mod transport;

pub use conduit::{Conduit, ConduitDest, ConduitSource, Extracted, InsertHandle};
pub use error::{ConduitError, Result};
pub use runtime::{LocalWorld, ProcessContext};
