// Domain allowlist and bundle resolution tests

use std::sync::Arc;

use autosni::{
    Config, ServerError,
    config::DomainEntry,
    tls::{DomainResolver, Identity},
};

fn resolver(entries: Vec<DomainEntry>) -> DomainResolver {
    DomainResolver::from_entries(&entries).expect("Entries should be valid")
}

#[test]
pub fn test_bundle_members_share_identity() {
    let resolver = resolver(vec![
        DomainEntry::from(vec!["a.com", "b.com"]),
        DomainEntry::from("c.com"),
    ]);

    let a = resolver.resolve("a.com").unwrap();
    let b = resolver.resolve("b.com").unwrap();
    let c = resolver.resolve("c.com").unwrap();

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.primary(), "a.com");
    assert_eq!(a.aliases(), &["b.com".to_string()]);
    assert_eq!(*c, Identity::single("c.com"));
}

#[test]
pub fn test_unlisted_host_is_not_allowed() {
    let resolver = resolver(vec![DomainEntry::from("a.com")]);

    match resolver.resolve("evil.com") {
        Err(ServerError::DomainNotAllowed { host }) => assert_eq!(host, "evil.com"),
        other => panic!("Expected DomainNotAllowed, got {other:?}"),
    }
}

#[test]
pub fn test_lookup_is_normalized() {
    let resolver = resolver(vec![DomainEntry::from("Example.COM.")]);

    assert_eq!(resolver.resolve("example.com").unwrap().primary(), "example.com");
    assert_eq!(resolver.resolve("EXAMPLE.com.").unwrap().primary(), "example.com");
}

#[test]
pub fn test_duplicate_hostname_is_rejected() {
    let entries = vec![
        DomainEntry::from(vec!["a.com", "b.com"]),
        DomainEntry::from("b.com"),
    ];

    match DomainResolver::from_entries(&entries) {
        Err(ServerError::ConfigError { field, message }) => {
            assert_eq!(field, "domains");
            assert!(message.contains("b.com"));
        }
        other => panic!("Expected ConfigError, got {other:?}"),
    }
}

#[test]
pub fn test_invalid_hostname_is_rejected() {
    let entries = vec![DomainEntry::from("bad host/../")];
    assert!(DomainResolver::from_entries(&entries).is_err());

    let entries = vec![DomainEntry::Bundle(Vec::new())];
    assert!(DomainResolver::from_entries(&entries).is_err());
}

#[test]
pub fn test_names_that_never_arrive_as_sni_are_rejected() {
    for host in ["x.test:80", ".x.test", "-x.test", "x-.test", "x..test", "[::1]"] {
        match DomainResolver::from_entries(&[DomainEntry::from(host)]) {
            Err(ServerError::ConfigError { field, .. }) => assert_eq!(field, "domains", "host: {host}"),
            other => panic!("Expected `{host}` to be rejected, got {other:?}"),
        }
    }

    // A trailing root dot is normalized away, inner hyphens are fine
    let resolver = resolver(vec![DomainEntry::from("my-site.test.")]);
    assert_eq!(resolver.resolve("my-site.test").unwrap().primary(), "my-site.test");
}

#[test]
pub fn test_open_mode_accepts_any_host() {
    let config = Config {
        allow_any_domain: true,
        ..Default::default()
    };
    let resolver = DomainResolver::from_config(&config).unwrap();

    assert!(resolver.is_open());
    assert_eq!(*resolver.resolve("Whatever.Test").unwrap(), Identity::single("whatever.test"));
    assert!(resolver.resolve("").is_err());
    assert!(resolver.identities().is_empty());
}

#[test]
pub fn test_empty_domains_without_open_mode_fails() {
    let config = Config::default();

    assert!(matches!(
        DomainResolver::from_config(&config),
        Err(ServerError::ConfigError { ref field, .. }) if field == "domains"
    ));
}

#[test]
pub fn test_identities_are_listed_once() {
    let resolver = resolver(vec![
        DomainEntry::from(vec!["b.com", "www.b.com"]),
        DomainEntry::from("a.com"),
    ]);

    let primaries: Vec<String> = resolver
        .identities()
        .iter()
        .map(|identity| identity.primary().to_string())
        .collect();

    assert_eq!(primaries, vec!["a.com", "b.com"]);
}
