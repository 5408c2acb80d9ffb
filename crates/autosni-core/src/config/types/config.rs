use std::{
    fmt::Display,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use hyper::StatusCode;
use serde::{Deserialize, Serialize};

use crate::{config::Format, error::ServerError};

use super::{DomainEntry, LogLevel};

const SECS_PER_HOUR: u64 = 60 * 60;
const SECS_PER_DAY: u64 = 24 * SECS_PER_HOUR;

// Roughly 100 years, well inside what chrono and x509 validity dates can represent
const MAX_DURATION_SECS: u64 = 100 * 365 * SECS_PER_DAY;

/// Which certificate authority endpoint automated issuance talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Production,
    Staging,
}

impl Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Production => write!(f, "production"),
            Environment::Staging => write!(f, "staging"),
        }
    }
}

/// The plaintext and secure ports to listen on
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct Ports {
    /// The plaintext HTTP port, also used to answer HTTP-01 challenges (default: 80)
    #[serde(default = "Ports::default_http")]
    pub http: u16,

    /// The TLS port (default: 443)
    #[serde(default = "Ports::default_https")]
    pub https: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Ports {
            http: Ports::default_http(),
            https: Ports::default_https(),
        }
    }
}

impl Ports {
    pub fn default_http() -> u16 {
        80
    }

    pub fn default_https() -> u16 {
        443
    }
}

/// The core configuration options available
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// Contact email registered with the certificate authority (required)
    #[serde(default)]
    pub email: Option<String>,

    /// Whether the certificate authority's terms of service have been accepted (required)
    #[serde(default)]
    pub agree_to_terms: bool,

    /// Hostnames and hostname bundles that may receive certificates
    #[serde(default)]
    pub domains: Vec<DomainEntry>,

    /// Serve any hostname a client asks for when `domains` is empty (default: false)
    #[serde(default)]
    pub allow_any_domain: bool,

    /// The IP address to bind both listeners to (default: 0.0.0.0)
    #[serde(default = "Config::default_host")]
    pub host: IpAddr,

    /// The listener ports
    #[serde(default)]
    pub ports: Ports,

    /// Whether plaintext requests are redirected to HTTPS (default: true)
    #[serde(default = "Config::default_force_https")]
    pub force_https: bool,

    /// The status code used for HTTPS redirects, either 301 or 302 (default: 301)
    #[serde(default = "Config::default_redirect_status_code")]
    pub redirect_status_code: u16,

    /// Use the staging certificate authority instead of production (default: false)
    #[serde(default)]
    pub debug: bool,

    /// Where issued certificates and account keys are persisted (default: "<current directory>/.autosni")
    #[serde(default = "Config::default_config_directory")]
    pub config_directory: PathBuf,

    /// Root of the static directory holding `.well-known/acme-challenge` (default: "<config_directory>/static")
    #[serde(default)]
    pub webroot: Option<PathBuf>,

    /// Overrides the ACME directory URL chosen by `debug`
    #[serde(default)]
    pub acme_directory_url: Option<String>,

    /// Upper bound for a single automated issuance attempt, in seconds (default: 90)
    #[serde(default = "Config::default_issuance_timeout_secs")]
    pub issuance_timeout_secs: u64,

    /// Upper bound for reading a ClientHello and for finishing a TLS handshake, in seconds (default: 10)
    #[serde(default = "Config::default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// How long an automatically issued certificate is served before renewal, in days (default: 80)
    #[serde(default = "Config::default_automated_expiry_days")]
    pub automated_expiry_days: u64,

    /// How long a self-signed fallback certificate is served before retrying issuance, in hours (default: 6)
    #[serde(default = "Config::default_self_signed_expiry_hours")]
    pub self_signed_expiry_hours: u64,

    /// The `notAfter` of generated self-signed certificates, in days from issue (default: 90)
    #[serde(default = "Config::default_self_signed_validity_days")]
    pub self_signed_validity_days: u64,

    /// The log level to use (default: "info")
    #[serde(default)]
    pub log_level: Option<LogLevel>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            email: None,
            agree_to_terms: false,
            domains: Vec::new(),
            allow_any_domain: false,
            host: Config::default_host(),
            ports: Ports::default(),
            force_https: Config::default_force_https(),
            redirect_status_code: Config::default_redirect_status_code(),
            debug: false,
            config_directory: Config::default_config_directory(),
            webroot: None,
            acme_directory_url: None,
            issuance_timeout_secs: Config::default_issuance_timeout_secs(),
            handshake_timeout_secs: Config::default_handshake_timeout_secs(),
            automated_expiry_days: Config::default_automated_expiry_days(),
            self_signed_expiry_hours: Config::default_self_signed_expiry_hours(),
            self_signed_validity_days: Config::default_self_signed_validity_days(),
            log_level: Some(LogLevel::default()),
        }
    }
}

impl Config {
    pub fn default_host() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
    }

    pub fn default_force_https() -> bool {
        true
    }

    pub fn default_redirect_status_code() -> u16 {
        301
    }

    pub fn default_config_directory() -> PathBuf {
        // NOTE: there are cases where this can fail but the chances of hitting either are rare, so
        // we should be fine here
        let cwd = std::env::current_dir().unwrap_or(Path::new(".").to_path_buf());
        cwd.join(".autosni")
    }

    pub fn default_issuance_timeout_secs() -> u64 {
        90
    }

    pub fn default_handshake_timeout_secs() -> u64 {
        10
    }

    pub fn default_automated_expiry_days() -> u64 {
        80
    }

    pub fn default_self_signed_expiry_hours() -> u64 {
        6
    }

    pub fn default_self_signed_validity_days() -> u64 {
        90
    }
}

impl Config {
    /// Checks every option that must hold before any socket is opened
    pub fn validate(&self) -> Result<(), ServerError> {
        match self.email.as_deref().map(str::trim) {
            None | Some("") => {
                return Err(ServerError::config("email", "An email address is required"));
            }
            Some(email) if !email.contains('@') => {
                return Err(ServerError::config(
                    "email",
                    format!("`{email}` is not a valid email address"),
                ));
            }
            Some(_) => {}
        }

        if !self.agree_to_terms {
            return Err(ServerError::config(
                "agree_to_terms",
                "The certificate authority's terms of service must be accepted",
            ));
        }

        if self.domains.is_empty() && !self.allow_any_domain {
            return Err(ServerError::config(
                "domains",
                "At least one domain is required unless `allow_any_domain` is enabled",
            ));
        }

        for entry in &self.domains {
            entry.to_identity()?;
        }

        self.redirect_status()?;

        if self.ports.http == self.ports.https && self.ports.http != 0 {
            return Err(ServerError::config(
                "ports",
                format!("HTTP and HTTPS cannot share port {}", self.ports.http),
            ));
        }

        if self.issuance_timeout_secs == 0 {
            return Err(ServerError::config(
                "issuance_timeout_secs",
                "The issuance timeout must be at least one second",
            ));
        }

        if self.handshake_timeout_secs == 0 {
            return Err(ServerError::config(
                "handshake_timeout_secs",
                "The handshake timeout must be at least one second",
            ));
        }

        let durations = [
            ("automated_expiry_days", self.automated_expiry_days, SECS_PER_DAY),
            ("self_signed_expiry_hours", self.self_signed_expiry_hours, SECS_PER_HOUR),
            ("self_signed_validity_days", self.self_signed_validity_days, SECS_PER_DAY),
        ];
        for (field, value, unit) in durations {
            if value == 0 {
                return Err(ServerError::config(
                    "expiry",
                    format!("`{field}` must be greater than zero"),
                ));
            }

            if value.checked_mul(unit).is_none_or(|secs| secs > MAX_DURATION_SECS) {
                return Err(ServerError::config(
                    "expiry",
                    format!("`{field}` is too large ({value})"),
                ));
            }
        }

        Ok(())
    }

    /// The redirect status code as a `StatusCode`, only 301 and 302 are accepted
    pub fn redirect_status(&self) -> Result<StatusCode, ServerError> {
        match self.redirect_status_code {
            301 => Ok(StatusCode::MOVED_PERMANENTLY),
            302 => Ok(StatusCode::FOUND),
            code => Err(ServerError::config(
                "redirect_status_code",
                format!("Expected 301 or 302, got {code}"),
            )),
        }
    }

    pub fn environment(&self) -> Environment {
        if self.debug {
            Environment::Staging
        } else {
            Environment::Production
        }
    }

    pub fn http_address(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.ports.http)
    }

    pub fn https_address(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.ports.https)
    }

    /// The directory served for `/.well-known/acme-challenge/` requests
    pub fn webroot(&self) -> PathBuf {
        self.webroot
            .clone()
            .unwrap_or_else(|| self.config_directory.join("static"))
    }

    /// The directory holding persisted certificates
    pub fn live_directory(&self) -> PathBuf {
        self.config_directory.join("live")
    }

    /// The directory holding ACME account credentials
    pub fn accounts_directory(&self) -> PathBuf {
        self.config_directory.join("accounts")
    }

    pub fn issuance_timeout(&self) -> Duration {
        Duration::from_secs(self.issuance_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn automated_expiry(&self) -> Duration {
        Duration::from_secs(self.automated_expiry_days.saturating_mul(SECS_PER_DAY))
    }

    pub fn self_signed_expiry(&self) -> Duration {
        Duration::from_secs(self.self_signed_expiry_hours.saturating_mul(SECS_PER_HOUR))
    }

    /// How long generated self-signed certificates are valid for
    pub fn self_signed_validity(&self) -> Duration {
        Duration::from_secs(self.self_signed_validity_days.saturating_mul(SECS_PER_DAY))
    }

    /// Writes the configuration to a file in the specified format
    pub fn write_to_file<P: AsRef<Path>>(
        &self,
        path: P,
        format: &dyn Format,
    ) -> Result<(), ServerError> {
        let config_str = format.to_format_string(self)?;
        std::fs::write(path, config_str).map_err(ServerError::IOError)?;

        Ok(())
    }
}
