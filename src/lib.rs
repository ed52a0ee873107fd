pub mod cache;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod coverage;
pub mod error;
pub mod execution;
pub mod inspect;
pub mod logging;
pub mod output;
pub mod registry;
pub mod task;
pub mod tool;
pub mod util;

pub use error::{Error, Result};
