//! Retail warehouse loader
//!
//! Takes one batch of raw sales rows and moves it into a star schema:
//! validate, normalize, upsert dimensions, upsert facts, then recompute the
//! daily sales aggregate for every (store, day) the batch touched. All sink
//! writes of a run share one transaction.

pub mod aggregate;
pub mod config;
pub mod dimension;
pub mod error;
pub mod fact;
pub mod model;
pub mod normalize;
pub mod report;
pub mod run;
pub mod sink;
pub mod source;
pub mod validate;

pub use config::Config;
pub use error::{LoaderError, Result};
pub use run::{execute, RunContext, RunOptions, RunOutcome, RunState, RunSummary};
pub use sink::{MemoryWarehouse, PgWarehouse, Warehouse};
