#[cfg(feature = "toml")]
pub mod toml;

mod types;

pub use types::*;

use crate::error::ServerError;

pub trait Format {
    /// Parse the provided document and return a fully parsed (but not yet validated) config
    fn parse(&self) -> Result<Config, ServerError>;

    /// Render a config back into this format
    fn to_format_string(&self, config: &Config) -> Result<String, ServerError>;

    /// The file extension used for documents in this format
    fn extension(&self) -> &'static str;
}
