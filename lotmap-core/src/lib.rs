pub mod classify;
pub mod config;
pub mod data;
pub mod error;
pub mod export;
pub mod grouping;
pub mod model;
pub mod orchestrator;
pub mod sites;
pub mod template;
pub mod validation;

pub use data::Database;
pub use error::{LotmapError, Result};
