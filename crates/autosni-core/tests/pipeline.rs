// Provisioning pipeline integration tests

mod common;

use std::{sync::Arc, time::Duration};

use autosni::{
    challenge::{ChallengeStore, MemoryChallengeStore},
    config::Environment,
    tls::{
        CertificateAuthority, Credential, CredentialStorage, Identity, Origin, PipelineSettings,
        ProvisionError, ProvisioningPipeline, RcgenGenerator, SelfSignedGenerator,
    },
};

use common::{
    FailingAuthority, FailingGenerator, HangingAuthority, LeakyAuthority, LocalAuthority,
    pem_common_name,
};

fn settings() -> PipelineSettings {
    PipelineSettings {
        contact_email: "admin@example.com".to_string(),
        agreed_to_terms: true,
        environment: Environment::Production,
        issuance_timeout: Duration::from_secs(5),
        automated_expiry: Duration::from_secs(80 * 24 * 60 * 60),
        self_signed_expiry: Duration::from_secs(6 * 60 * 60),
    }
}

macro_rules! pipeline {
    ($authority:expr) => {
        pipeline!($authority, Arc::new(RcgenGenerator::new()), settings())
    };
    ($authority:expr, $generator:expr, $settings:expr) => {
        ProvisioningPipeline::new(
            $authority as Arc<dyn CertificateAuthority>,
            $generator,
            Arc::new(MemoryChallengeStore::new()),
            $settings,
        )
    };
}

#[tokio::test]
pub async fn test_falls_back_to_self_signed() {
    let authority = Arc::new(FailingAuthority::default());
    let pipeline = pipeline!(Arc::clone(&authority));

    let credential = pipeline
        .run(&Identity::single("x.test"))
        .await
        .expect("Fallback should always produce a credential");

    assert_eq!(credential.origin(), Origin::SelfSigned);
    assert_eq!(pem_common_name(credential.certificate_chain_pem()), "x.test");
    assert_eq!(authority.calls(), 1);
    assert_eq!(pipeline.outcomes().self_signed, 1);
    assert_eq!(pipeline.outcomes().automated, 0);
}

#[tokio::test]
pub async fn test_bundle_fallback_uses_primary_name() {
    let pipeline = pipeline!(Arc::new(FailingAuthority::default()));
    let identity = Identity::bundle("a.test", vec!["b.test".to_string()]);

    let credential = pipeline.run(&identity).await.unwrap();
    assert_eq!(pem_common_name(credential.certificate_chain_pem()), "a.test");
}

#[tokio::test]
pub async fn test_issued_credential_is_automated() {
    let authority = Arc::new(LocalAuthority::default());
    let pipeline = pipeline!(Arc::clone(&authority));

    let credential = pipeline.run(&Identity::single("x.test")).await.unwrap();

    assert_eq!(credential.origin(), Origin::Automated);
    assert_eq!(authority.calls(), 1);
    assert_eq!(pipeline.outcomes().automated, 1);
}

#[tokio::test]
pub async fn test_generator_failure_is_reported() {
    let pipeline = pipeline!(
        Arc::new(FailingAuthority::default()),
        Arc::new(FailingGenerator),
        settings()
    );

    let result = pipeline.run(&Identity::single("x.test")).await;

    assert!(matches!(
        result,
        Err(ProvisionError::SelfSigned { ref host, .. }) if host == "x.test"
    ));
    assert_eq!(pipeline.outcomes().failed, 1);
}

#[tokio::test]
pub async fn test_slow_authority_times_out() {
    let mut settings = settings();
    settings.issuance_timeout = Duration::from_millis(100);
    let pipeline = pipeline!(
        Arc::new(HangingAuthority),
        Arc::new(RcgenGenerator::new()),
        settings
    );

    let credential = tokio::time::timeout(
        Duration::from_secs(5),
        pipeline.run(&Identity::single("x.test")),
    )
    .await
    .expect("Issuance timeout should bound the run")
    .unwrap();

    assert_eq!(credential.origin(), Origin::SelfSigned);
}

#[tokio::test]
pub async fn test_no_challenge_tokens_left_behind() {
    let store = Arc::new(MemoryChallengeStore::new());
    let pipeline = ProvisioningPipeline::new(
        Arc::new(LeakyAuthority),
        Arc::new(RcgenGenerator::new()),
        Arc::clone(&store) as Arc<dyn ChallengeStore>,
        settings(),
    );

    pipeline.run(&Identity::single("x.test")).await.unwrap();

    assert!(store.is_empty().await);
    assert_eq!(store.read("leaked-token").await.unwrap(), None);
}

#[tokio::test]
pub async fn test_persisted_credential_is_restored() {
    let dir = tempfile::tempdir().unwrap();
    let identity = Identity::single("x.test");

    let first = pipeline!(Arc::new(LocalAuthority::default()))
        .with_storage(CredentialStorage::new(dir.path()));
    let issued = first.run(&identity).await.unwrap();

    let authority = Arc::new(FailingAuthority::default());
    let second = pipeline!(Arc::clone(&authority)).with_storage(CredentialStorage::new(dir.path()));
    let restored = second.run(&identity).await.unwrap();

    assert_eq!(restored.origin(), Origin::Automated);
    assert_eq!(restored.private_key_pem(), issued.private_key_pem());
    assert_eq!(restored.certificate_chain_pem(), issued.certificate_chain_pem());
    assert_eq!(authority.calls(), 0);
    assert_eq!(second.outcomes().restored, 1);
}

#[tokio::test]
pub async fn test_self_signed_credential_is_not_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let identity = Identity::single("x.test");
    let storage = CredentialStorage::new(dir.path());

    let pipeline =
        pipeline!(Arc::new(FailingAuthority::default())).with_storage(storage.clone());
    pipeline.run(&identity).await.unwrap();

    assert!(storage.load(&identity).unwrap().is_none());
}

#[tokio::test]
pub async fn test_changed_bundle_discards_persisted_credential() {
    let dir = tempfile::tempdir().unwrap();
    let storage = CredentialStorage::new(dir.path());

    let bundle = Identity::bundle("a.test", vec!["b.test".to_string()]);
    pipeline!(Arc::new(LocalAuthority::default()))
        .with_storage(storage.clone())
        .run(&bundle)
        .await
        .unwrap();
    assert!(storage.load(&bundle).unwrap().is_some());

    // Same primary name, but b.test was dropped from the bundle
    let authority = Arc::new(FailingAuthority::default());
    let pipeline = pipeline!(Arc::clone(&authority)).with_storage(storage.clone());
    let credential = pipeline.run(&Identity::single("a.test")).await.unwrap();

    assert_eq!(credential.origin(), Origin::SelfSigned);
    assert_eq!(authority.calls(), 1);
    assert_eq!(pipeline.outcomes().restored, 0);
    assert!(storage.load(&Identity::single("a.test")).unwrap().is_none());
}

#[tokio::test]
pub async fn test_changed_environment_discards_persisted_credential() {
    let dir = tempfile::tempdir().unwrap();
    let identity = Identity::single("x.test");

    pipeline!(Arc::new(LocalAuthority::default()))
        .with_storage(CredentialStorage::new(dir.path()))
        .run(&identity)
        .await
        .unwrap();

    let mut staging = settings();
    staging.environment = Environment::Staging;
    let authority = Arc::new(FailingAuthority::default());
    let pipeline = pipeline!(
        Arc::clone(&authority),
        Arc::new(RcgenGenerator::new()),
        staging
    )
    .with_storage(CredentialStorage::new(dir.path()));

    pipeline.run(&identity).await.unwrap();
    assert_eq!(authority.calls(), 1);
    assert_eq!(pipeline.outcomes().restored, 0);
}

#[tokio::test]
pub async fn test_expired_persisted_credential_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let storage = CredentialStorage::new(dir.path());
    let identity = Identity::single("x.test");

    let generated = RcgenGenerator::new().generate("x.test").unwrap();
    let old = Credential::new(
        identity.clone(),
        generated.private_key_pem,
        generated.certificate_chain_pem,
        chrono::Utc::now() - chrono::Duration::days(100),
        Origin::Automated,
        identity.fingerprint(Environment::Production),
    )
    .unwrap();
    storage.save(&old).unwrap();

    let authority = Arc::new(FailingAuthority::default());
    let pipeline = pipeline!(Arc::clone(&authority)).with_storage(storage.clone());
    pipeline.run(&identity).await.unwrap();

    assert_eq!(authority.calls(), 1);
    assert_eq!(pipeline.outcomes().restored, 0);
    assert!(storage.load(&identity).unwrap().is_none());
}
