mod config;
mod domain;
mod log;

pub use config::*;
pub use domain::*;
pub use log::*;
