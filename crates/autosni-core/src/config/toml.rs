use crate::error::ServerError;

use super::{Config, Format};

#[derive(Default)]
pub struct Toml<'a> {
    input: &'a str,
}

impl<'a> Toml<'a> {
    pub fn new(input: &'a str) -> Self {
        Toml { input }
    }
}

impl<'a> From<&'a str> for Toml<'a> {
    fn from(input: &'a str) -> Self {
        Toml::new(input)
    }
}

impl Format for Toml<'_> {
    fn parse(&self) -> Result<Config, ServerError> {
        toml::from_str(self.input).map_err(|e| ServerError::ParseError {
            field: "root".to_string(),
            message: format!("Failed to parse TOML configuration: {e}"),
        })
    }

    fn to_format_string(&self, config: &Config) -> Result<String, ServerError> {
        toml::to_string(config).map_err(|e| ServerError::ParseError {
            field: "root".to_string(),
            message: format!("Failed to convert config to TOML string: {e}"),
        })
    }

    fn extension(&self) -> &'static str {
        "toml"
    }
}
