//! CLI command implementations.

pub mod common;
pub mod housekeep;
pub mod instances;
pub mod pair;
pub mod recover;
pub mod run;
pub mod status;
pub mod submit;
