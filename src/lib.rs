pub mod bucket;
pub mod checkpoint;
pub mod clock;
pub mod compare;
pub mod config;
pub mod distribute;
pub mod error;
pub mod fingerprint;
pub mod gap;
pub mod merge;
pub mod pipeline;
pub mod progress;
pub mod proofs;
pub mod records;
pub mod report;
pub mod selftest;
pub mod union_find;
pub mod validate;
pub mod workers;

pub use config::CensusConfig;
pub use error::{CensusError, Result};
