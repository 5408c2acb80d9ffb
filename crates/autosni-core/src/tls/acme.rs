// ACME client integration for automated certificate issuance using instant-acme
//
// Validation uses HTTP-01: key authorizations are published through the challenge store and
// served by the plaintext listener, so issuance works for any hostname routed to port 80.

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, Order, OrderStatus,
};
use log::{debug, info, warn};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tokio::sync::Mutex;

use crate::config::{Config, Environment};

use super::{CertificateAuthority, IssuanceError, IssuanceRequest, IssuedCertificate};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLL_ATTEMPTS: u32 = 30;

/// Issues certificates from an ACME directory (Let's Encrypt by default)
pub struct AcmeAuthority {
    /// Overrides the Let's Encrypt directory picked from the environment
    directory_url: Option<String>,

    /// Where account credentials are kept, one `<environment>.json` per environment
    accounts_directory: PathBuf,

    accounts: Mutex<HashMap<Environment, Arc<Account>>>,

    poll_interval: Duration,
}

impl AcmeAuthority {
    pub fn new(accounts_directory: impl Into<PathBuf>, directory_url: Option<String>) -> Self {
        AcmeAuthority {
            directory_url,
            accounts_directory: accounts_directory.into(),
            accounts: Mutex::new(HashMap::new()),
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.accounts_directory(), config.acme_directory_url.clone())
    }

    /// The ACME directory URL used for `environment`
    pub fn directory_url(&self, environment: Environment) -> &str {
        match (&self.directory_url, environment) {
            (Some(url), _) => url,
            (None, Environment::Production) => LetsEncrypt::Production.url(),
            (None, Environment::Staging) => LetsEncrypt::Staging.url(),
        }
    }

    fn credentials_path(&self, environment: Environment) -> PathBuf {
        self.accounts_directory.join(format!("{environment}.json"))
    }

    /// Load the account for the request's environment, registering a new one if needed
    async fn account(&self, request: &IssuanceRequest) -> Result<Arc<Account>, IssuanceError> {
        let mut accounts = self.accounts.lock().await;
        if let Some(account) = accounts.get(&request.environment) {
            return Ok(Arc::clone(account));
        }

        let account = match self.load_account(request.environment).await {
            Some(account) => account,
            None => self.create_account(request).await?,
        };

        let account = Arc::new(account);
        accounts.insert(request.environment, Arc::clone(&account));
        Ok(account)
    }

    async fn load_account(&self, environment: Environment) -> Option<Account> {
        let path = self.credentials_path(environment);
        let data = tokio::fs::read_to_string(&path).await.ok()?;

        let credentials: AccountCredentials = match serde_json::from_str(&data) {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!("Ignoring unreadable account credentials at {}: {e}", path.display());
                return None;
            }
        };

        match Account::from_credentials(credentials).await {
            Ok(account) => {
                debug!("Loaded {environment} ACME account from {}", path.display());
                Some(account)
            }
            Err(e) => {
                warn!("Failed to restore {environment} ACME account, registering a new one: {e}");
                None
            }
        }
    }

    async fn create_account(&self, request: &IssuanceRequest) -> Result<Account, IssuanceError> {
        if !request.agreed_to_terms {
            return Err(IssuanceError::TermsRejected(
                "the terms of service must be accepted to register an account".to_string(),
            ));
        }

        let contact = format!("mailto:{}", request.contact_email);
        let directory_url = self.directory_url(request.environment);
        info!("Registering a new ACME account at {directory_url}");

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[contact.as_str()],
                terms_of_service_agreed: request.agreed_to_terms,
                only_return_existing: false,
            },
            directory_url,
            None,
        )
        .await
        .map_err(map_acme_error)?;

        if let Err(e) = self.save_credentials(request.environment, &credentials).await {
            warn!("Failed to persist ACME account credentials: {e}");
        }

        Ok(account)
    }

    async fn save_credentials(
        &self,
        environment: Environment,
        credentials: &AccountCredentials,
    ) -> std::io::Result<()> {
        let path = self.credentials_path(environment);
        let data = serde_json::to_string_pretty(credentials).map_err(std::io::Error::other)?;

        tokio::fs::create_dir_all(&self.accounts_directory).await?;
        tokio::fs::write(&path, data).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        debug!("Saved ACME account credentials to {}", path.display());
        Ok(())
    }

    /// Publish HTTP-01 responses for every pending authorization and wait for the order to be
    /// ready for finalization
    async fn authorize(
        &self,
        order: &mut Order,
        request: &IssuanceRequest,
        tokens: &mut Vec<String>,
    ) -> Result<(), IssuanceError> {
        let authorizations = order.authorizations().await.map_err(map_acme_error)?;
        let mut ready_urls = Vec::new();

        for authorization in &authorizations {
            match authorization.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                status => {
                    return Err(IssuanceError::ValidationFailed(format!(
                        "authorization for {:?} is {status:?}",
                        authorization.identifier
                    )));
                }
            }

            let challenge = authorization
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| {
                    IssuanceError::ValidationFailed(format!(
                        "no HTTP-01 challenge offered for {:?}",
                        authorization.identifier
                    ))
                })?;

            let key_authorization = order.key_authorization(challenge);
            request
                .challenges
                .write(&challenge.token, key_authorization.as_str())
                .await
                .map_err(|e| {
                    IssuanceError::ValidationFailed(format!("could not publish challenge: {e}"))
                })?;

            debug!(
                "Published HTTP-01 challenge for {:?}",
                authorization.identifier
            );
            tokens.push(challenge.token.clone());
            ready_urls.push(challenge.url.clone());
        }

        for url in &ready_urls {
            order
                .set_challenge_ready(url)
                .await
                .map_err(map_acme_error)?;
        }

        let mut attempts = 0;
        loop {
            let state = order.refresh().await.map_err(map_acme_error)?;

            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    return Err(IssuanceError::ValidationFailed(format!(
                        "order for {:?} became invalid",
                        request.hostnames
                    )));
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        return Err(IssuanceError::ValidationFailed(
                            "authorizations were still pending after polling".to_string(),
                        ));
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Submit a CSR for the order and wait for the issued chain
    async fn finalize(
        &self,
        order: &mut Order,
        hostnames: &[String],
    ) -> Result<IssuedCertificate, IssuanceError> {
        let invalid_request =
            |e: rcgen::Error| IssuanceError::ValidationFailed(format!("invalid certificate request: {e}"));

        let mut params = CertificateParams::new(hostnames.to_vec()).map_err(invalid_request)?;
        params.distinguished_name = DistinguishedName::new();
        if let Some(primary) = hostnames.first() {
            params
                .distinguished_name
                .push(DnType::CommonName, primary.clone());
        }

        let private_key = KeyPair::generate().map_err(invalid_request)?;
        let csr = params
            .serialize_request(&private_key)
            .map_err(invalid_request)?;

        if order.state().status != OrderStatus::Valid {
            order.finalize(csr.der()).await.map_err(map_acme_error)?;
        }

        let mut attempts = 0;
        let certificate_chain_pem = loop {
            if let Some(chain) = order.certificate().await.map_err(map_acme_error)? {
                break chain;
            }

            attempts += 1;
            if attempts > MAX_POLL_ATTEMPTS {
                return Err(IssuanceError::Network(
                    "certificate was not available after polling".to_string(),
                ));
            }

            tokio::time::sleep(self.poll_interval).await;
            let state = order.refresh().await.map_err(map_acme_error)?;
            if state.status == OrderStatus::Invalid {
                return Err(IssuanceError::ValidationFailed(
                    "order became invalid during finalization".to_string(),
                ));
            }
        };

        Ok(IssuedCertificate {
            private_key_pem: private_key.serialize_pem().into_bytes(),
            certificate_chain_pem: certificate_chain_pem.into_bytes(),
        })
    }
}

#[async_trait]
impl CertificateAuthority for AcmeAuthority {
    async fn issue(&self, request: &IssuanceRequest) -> Result<IssuedCertificate, IssuanceError> {
        info!(
            "Requesting a {} certificate for {:?}",
            request.environment, request.hostnames
        );

        let account = self.account(request).await?;

        let identifiers: Vec<Identifier> = request
            .hostnames
            .iter()
            .map(|host| Identifier::Dns(host.clone()))
            .collect();

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(map_acme_error)?;

        let mut tokens = Vec::new();
        let authorized = self.authorize(&mut order, request, &mut tokens).await;

        for token in &tokens {
            if let Err(e) = request.challenges.remove(token).await {
                warn!("Failed to remove challenge token {token}: {e}");
            }
        }
        authorized?;

        let issued = self.finalize(&mut order, &request.hostnames).await?;
        info!("Issued certificate for {:?}", request.hostnames);

        Ok(issued)
    }
}

/// Sort an ACME failure into the issuance error kinds callers care about
fn map_acme_error(error: instant_acme::Error) -> IssuanceError {
    match error {
        instant_acme::Error::Api(problem) => {
            let detail = problem
                .detail
                .clone()
                .unwrap_or_else(|| "no detail provided".to_string());
            let kind = problem
                .r#type
                .as_deref()
                .and_then(|urn| urn.strip_prefix("urn:ietf:params:acme:error:"))
                .unwrap_or_default();

            match kind {
                "rateLimited" => IssuanceError::RateLimited(detail),
                "userActionRequired" | "agreementRequired" => IssuanceError::TermsRejected(detail),
                "unauthorized" | "connection" | "dns" | "caa" | "incorrectResponse"
                | "rejectedIdentifier" | "unsupportedIdentifier" | "tls" => {
                    IssuanceError::ValidationFailed(detail)
                }
                _ => IssuanceError::Network(format!("{kind}: {detail}")),
            }
        }
        other => IssuanceError::Network(other.to_string()),
    }
}
