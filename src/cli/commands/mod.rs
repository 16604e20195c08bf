//! CLI command implementations

pub mod build;
pub mod config;
pub mod images;
pub mod import;
pub mod inspect;
pub mod prune;

pub use build::execute as build;
pub use config::execute as config;
pub use images::execute as images;
pub use import::execute as import;
pub use inspect::execute as inspect;
pub use prune::execute as prune;
