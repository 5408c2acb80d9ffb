// Configuration parsing and validation tests

use std::path::PathBuf;

use autosni::{
    Config, ServerError,
    config::{DomainEntry, Environment, Format, LogLevel, toml::Toml},
};
use hyper::StatusCode;

macro_rules! parse {
    ($input:expr) => {
        Toml::from($input)
            .parse()
            .expect("Configuration should parse")
    };
}

macro_rules! assert_config_error {
    ($config:expr, $field:expr) => {
        match $config.validate() {
            Err(ServerError::ConfigError { field, .. }) => assert_eq!(field, $field),
            other => panic!("Expected a ConfigError for `{}`, got {other:?}", $field),
        }
    };
}

fn valid_config() -> Config {
    Config {
        email: Some("admin@example.com".to_string()),
        agree_to_terms: true,
        domains: vec![DomainEntry::from("example.com")],
        ..Default::default()
    }
}

#[test]
pub fn test_parse_full_config() {
    let config = parse!(
        r#"
email = "admin@example.com"
agree_to_terms = true
domains = ["example.com", ["shop.example.com", "www.shop.example.com"]]
host = "127.0.0.1"
force_https = false
redirect_status_code = 302
debug = true
config_directory = "/var/lib/autosni"
log_level = "debug"

[ports]
http = 8080
https = 8443
"#
    );

    assert_eq!(config.email.as_deref(), Some("admin@example.com"));
    assert!(config.agree_to_terms);
    assert_eq!(
        config.domains,
        vec![
            DomainEntry::from("example.com"),
            DomainEntry::from(vec!["shop.example.com", "www.shop.example.com"]),
        ]
    );
    assert_eq!(config.http_address().to_string(), "127.0.0.1:8080");
    assert_eq!(config.https_address().to_string(), "127.0.0.1:8443");
    assert!(!config.force_https);
    assert_eq!(config.redirect_status().unwrap(), StatusCode::FOUND);
    assert_eq!(config.environment(), Environment::Staging);
    assert_eq!(config.log_level, Some(LogLevel::Debug));
    assert_eq!(
        config.live_directory(),
        PathBuf::from("/var/lib/autosni/live")
    );
    assert_eq!(config.webroot(), PathBuf::from("/var/lib/autosni/static"));
    assert!(config.validate().is_ok());
}

#[test]
pub fn test_parse_defaults() {
    let config = parse!(
        r#"
email = "admin@example.com"
agree_to_terms = true
domains = ["example.com"]
"#
    );

    assert_eq!(config.ports.http, 80);
    assert_eq!(config.ports.https, 443);
    assert!(config.force_https);
    assert_eq!(config.redirect_status().unwrap(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(config.environment(), Environment::Production);
    assert!(!config.allow_any_domain);
    assert!(config.webroot.is_none());
    assert!(config.config_directory.ends_with(".autosni"));
}

#[test]
pub fn test_parse_invalid_toml() {
    let result = Toml::from("email = ").parse();
    assert!(matches!(result, Err(ServerError::ParseError { .. })));
}

#[test]
pub fn test_email_is_required() {
    let mut config = valid_config();
    config.email = None;
    assert_config_error!(config, "email");

    config.email = Some("   ".to_string());
    assert_config_error!(config, "email");

    config.email = Some("not-an-email".to_string());
    assert_config_error!(config, "email");
}

#[test]
pub fn test_terms_must_be_accepted() {
    let mut config = valid_config();
    config.agree_to_terms = false;
    assert_config_error!(config, "agree_to_terms");
}

#[test]
pub fn test_domains_are_required_unless_open() {
    let mut config = valid_config();
    config.domains.clear();
    assert_config_error!(config, "domains");

    config.allow_any_domain = true;
    assert!(config.validate().is_ok());
}

#[test]
pub fn test_invalid_domain_is_rejected() {
    let mut config = valid_config();
    config.domains = vec![DomainEntry::from("exa mple.com")];
    assert_config_error!(config, "domains");
}

#[test]
pub fn test_redirect_status_code_must_be_301_or_302() {
    let mut config = valid_config();
    config.redirect_status_code = 307;
    assert_config_error!(config, "redirect_status_code");
}

#[test]
pub fn test_ports_must_differ() {
    let mut config = valid_config();
    config.ports.http = 8080;
    config.ports.https = 8080;
    assert_config_error!(config, "ports");

    // Both ephemeral is fine
    config.ports.http = 0;
    config.ports.https = 0;
    assert!(config.validate().is_ok());
}

#[test]
pub fn test_expiry_and_timeout_must_be_positive() {
    let mut config = valid_config();
    config.issuance_timeout_secs = 0;
    assert_config_error!(config, "issuance_timeout_secs");

    let mut config = valid_config();
    config.self_signed_expiry_hours = 0;
    assert_config_error!(config, "expiry");

    let mut config = valid_config();
    config.self_signed_validity_days = 0;
    assert_config_error!(config, "expiry");

    let mut config = valid_config();
    config.handshake_timeout_secs = 0;
    assert_config_error!(config, "handshake_timeout_secs");
}

#[test]
pub fn test_oversized_durations_are_rejected() {
    let mut config = parse!(
        r#"
email = "admin@example.com"
agree_to_terms = true
domains = ["example.com"]
automated_expiry_days = 300000000000000
"#
    );
    assert_config_error!(config, "expiry");

    // Conversions saturate instead of overflowing
    assert_eq!(config.automated_expiry().as_secs(), u64::MAX);

    config.automated_expiry_days = 80;
    config.self_signed_expiry_hours = u64::MAX;
    assert_config_error!(config, "expiry");

    config.self_signed_expiry_hours = 6;
    config.self_signed_validity_days = 1_000_000;
    assert_config_error!(config, "expiry");

    config.self_signed_validity_days = 365;
    assert!(config.validate().is_ok());
}

#[test]
pub fn test_duration_defaults() {
    let config = valid_config();

    assert_eq!(config.automated_expiry().as_secs(), 80 * 24 * 60 * 60);
    assert_eq!(config.self_signed_expiry().as_secs(), 6 * 60 * 60);
    assert_eq!(config.self_signed_validity().as_secs(), 90 * 24 * 60 * 60);
    assert_eq!(config.handshake_timeout().as_secs(), 10);
}

#[test]
pub fn test_write_and_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("autosni.toml");

    let mut config = valid_config();
    config.domains.push(DomainEntry::from(vec!["a.com", "b.com"]));
    config.write_to_file(&path, &Toml::default()).unwrap();

    let written = std::fs::read_to_string(&path).unwrap();
    let parsed = parse!(written.as_str());

    assert_eq!(parsed.domains, config.domains);
    assert_eq!(parsed.email, config.email);
    assert_eq!(parsed.ports, config.ports);
}
