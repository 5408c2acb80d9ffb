use std::path::{Path, PathBuf};

use autosni::{
    Server,
    config::{Config, DomainEntry, LogLevel},
    server::handler::NotFoundHandler,
};
use clap::{Parser, Subcommand};
use log::{debug, info};

use crate::{error::CliError, format::FormatType};

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the server with the provided configuration
    Run {
        /// Path to the configuration file
        #[arg(short, long, default_value = "autosni.toml")]
        config: PathBuf,
    },

    /// Create a new autosni configuration file in the target directory
    Init {
        /// The path to the target directory where the configuration file will be created
        #[arg(required = false)]
        target_dir: Option<PathBuf>,
    },

    /// Print the version of the autosni CLI
    Version,
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// The log level for the application, overrides `log_level` in the configuration file
    #[arg(short, long)]
    log_level: Option<LogLevel>,

    /// The configuration file format
    #[arg(short, long, value_enum, default_value_t)]
    format: FormatType,

    #[clap(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn new() -> Self {
        // Init CLI parser
        let cli = Cli::parse();

        // Records are filtered through `log::set_max_level` so the configuration file can still
        // lower or raise the level once it has been read
        env_logger::Builder::new()
            .filter_level(log::LevelFilter::Trace)
            .init();
        log::set_max_level(cli.log_level.unwrap_or(LogLevel::Info).to_log_level_filter());

        cli
    }

    pub async fn execute(&self) -> Result<(), CliError> {
        match &self.command {
            Commands::Run { config } => self.run(config).await,
            Commands::Init { target_dir } => self.init(target_dir.as_deref()),
            Commands::Version => {
                println!("autosni {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }

    async fn run(&self, config_path: &Path) -> Result<(), CliError> {
        debug!("Reading configuration from {}", config_path.display());
        let input = std::fs::read_to_string(config_path)?;
        let config = self.format.format(&input).parse()?;

        // NOTE: the CLI flag always wins over the level set in the configuration file
        if let (None, Some(level)) = (self.log_level, config.log_level) {
            log::set_max_level(level.to_log_level_filter());
        }

        let mut server = Server::new(config, NotFoundHandler)?;
        server.run().await?;

        Ok(())
    }

    fn init(&self, target_dir: Option<&Path>) -> Result<(), CliError> {
        let target_dir = match target_dir {
            Some(dir) => dir.to_path_buf(),
            None => std::env::current_dir()?,
        };

        if !target_dir.exists() {
            std::fs::create_dir_all(&target_dir)?;
        }

        let format = self.format.format("");
        let path = target_dir.join(format!("autosni.{}", format.extension()));
        if path.exists() {
            return Err(CliError::Generic(format!(
                "A configuration file already exists at {}",
                path.display()
            )));
        }

        let config = Config {
            email: Some("admin@example.com".to_string()),
            domains: vec![
                DomainEntry::from("example.com"),
                DomainEntry::from(vec!["www.example.com", "blog.example.com"]),
            ],
            config_directory: PathBuf::from(".autosni"),
            ..Default::default()
        };
        config.write_to_file(&path, format.as_ref())?;

        info!("Created a new configuration file at {}", path.display());
        info!("Set `email` and `agree_to_terms = true` before running the server");

        Ok(())
    }
}
