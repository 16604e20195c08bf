//! Strata - incremental image builds
//!
//! Executes typed build instructions against a content-addressed image
//! store, probing a build cache before every step so unchanged steps reuse
//! previously committed images.

pub mod builder;
pub mod cache;
pub mod cli;
pub mod config;
pub mod container;
pub mod context;
pub mod copy;
pub mod error;
pub mod fsutil;
pub mod image;
pub mod output;
pub mod runconfig;
pub mod runtime_spec;
pub mod store;

pub use error::{StrataError, StrataResult};
