//! Identity bootstrap and token exchange.
//!
//! A scenario signs in the same way a real client does:
//!
//! 1. resolve the organization to an identity-platform tenant,
//! 2. make sure the user exists in that tenant, provisioning it if not,
//! 3. log in with email and password to obtain a provider id token,
//! 4. exchange the id token for an application token.
//!
//! Each step is a trait so the harness can run against a real identity
//! platform or the in-memory implementations in [`in_memory`]. None of the
//! steps is retried; any failure is reported as
//! [`HarnessError::Authentication`] naming the step and tenant.

pub mod in_memory;

pub use in_memory::{
    ExchangedClaims, HashConfig, InMemoryIdentityProvider, InMemoryTokenExchanger,
    StaticTenantDirectory, TokenClaims,
};

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use log::{debug, info};

use crate::error::{HarnessError, HarnessResult};

/// Steps of the identity bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStep {
    ResolveTenant,
    ProvisionUser,
    ProviderLogin,
    TokenExchange,
}

impl fmt::Display for AuthStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthStep::ResolveTenant => "resolve tenant",
            AuthStep::ProvisionUser => "provision user",
            AuthStep::ProviderLogin => "provider login",
            AuthStep::TokenExchange => "token exchange",
        };
        f.write_str(name)
    }
}

/// Errors raised by identity collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("no tenant for organization '{organization_id}'")]
    TenantNotFound { organization_id: String },

    #[error("user '{user_id}' not found in tenant '{tenant_id}'")]
    UserNotFound { tenant_id: String, user_id: String },

    #[error("user '{user_id}' already exists in tenant '{tenant_id}'")]
    UserAlreadyExists { tenant_id: String, user_id: String },

    #[error("invalid credentials for '{email}'")]
    InvalidCredentials { email: String },

    #[error("invalid or expired token")]
    InvalidToken,

    #[error("applicant '{applicant}' is not allowed to exchange tokens")]
    ApplicantRejected { applicant: String },

    #[error("identity service unavailable: {message}")]
    Unavailable { message: String },
}

/// Which organization a scenario signs into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantSelector {
    pub organization_id: String,
}

impl TenantSelector {
    pub fn new(organization_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
        }
    }
}

/// The user a scenario signs in as.
#[derive(Clone, PartialEq, Eq)]
pub struct SubjectIdentity {
    pub user_id: String,
    pub email: String,
    pub password: String,
    pub display_name: String,
}

impl SubjectIdentity {
    /// A fresh identity with random id, email and password.
    pub fn generate(prefix: &str) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        Self {
            email: format!("{}-{}@example.com", prefix, id),
            password: format!("password-{}", id),
            display_name: format!("{}-{}", prefix, id),
            user_id: id,
        }
    }
}

impl fmt::Debug for SubjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubjectIdentity")
            .field("user_id", &self.user_id)
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("display_name", &self.display_name)
            .finish()
    }
}

/// A user as known by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityUser {
    pub tenant_id: String,
    pub user_id: String,
    pub email: String,
    pub display_name: String,
}

/// Tokens returned by a provider login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderToken {
    pub id_token: String,
    pub refresh_token: String,
}

/// Everything a scenario holds after signing in. Never persisted.
#[derive(Clone)]
pub struct TenantCredential {
    pub tenant_id: String,
    pub user_id: String,
    pub raw_password: String,
    pub provider_token: ProviderToken,
    /// Application token sent with every RPC.
    pub exchanged_token: String,
}

impl fmt::Debug for TenantCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantCredential")
            .field("tenant_id", &self.tenant_id)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// Maps organizations to identity-platform tenants.
pub trait TenantDirectory: Send + Sync {
    fn resolve_tenant(
        &self,
        organization_id: &str,
    ) -> impl Future<Output = Result<String, IdentityError>> + Send;
}

/// Identity platform holding user accounts per tenant.
pub trait IdentityProvider: Send + Sync {
    fn find_user(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> impl Future<Output = Result<Option<IdentityUser>, IdentityError>> + Send;

    /// Create the user with its password.
    fn provision_user(
        &self,
        tenant_id: &str,
        identity: &SubjectIdentity,
    ) -> impl Future<Output = Result<IdentityUser, IdentityError>> + Send;

    fn login(
        &self,
        tenant_id: &str,
        email: &str,
        password: &str,
    ) -> impl Future<Output = Result<ProviderToken, IdentityError>> + Send;

    /// Trade a refresh token for a new id token.
    fn refresh_id_token(
        &self,
        tenant_id: &str,
        refresh_token: &str,
    ) -> impl Future<Output = Result<ProviderToken, IdentityError>> + Send;
}

/// Exchanges a provider id token for an application token.
pub trait TokenExchanger: Send + Sync {
    fn exchange(
        &self,
        applicant: &str,
        user_id: &str,
        id_token: &str,
    ) -> impl Future<Output = Result<String, IdentityError>> + Send;
}

/// Runs the identity bootstrap.
pub struct Authenticator<T, P, X> {
    directory: Arc<T>,
    provider: Arc<P>,
    exchanger: Arc<X>,
    applicant: String,
}

impl<T, P, X> Clone for Authenticator<T, P, X> {
    fn clone(&self) -> Self {
        Self {
            directory: Arc::clone(&self.directory),
            provider: Arc::clone(&self.provider),
            exchanger: Arc::clone(&self.exchanger),
            applicant: self.applicant.clone(),
        }
    }
}

impl<T, P, X> Authenticator<T, P, X>
where
    T: TenantDirectory,
    P: IdentityProvider,
    X: TokenExchanger,
{
    pub fn new(
        directory: Arc<T>,
        provider: Arc<P>,
        exchanger: Arc<X>,
        applicant: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            provider,
            exchanger,
            applicant: applicant.into(),
        }
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// Sign `identity` into the organization named by `selector`.
    ///
    /// Provisioning is a compensating write: if a later step fails, the
    /// provisioned user stays behind.
    pub async fn authenticate(
        &self,
        selector: &TenantSelector,
        identity: &SubjectIdentity,
    ) -> HarnessResult<TenantCredential> {
        let tenant_id = self
            .directory
            .resolve_tenant(&selector.organization_id)
            .await
            .map_err(|source| HarnessError::Authentication {
                step: AuthStep::ResolveTenant,
                tenant: selector.organization_id.clone(),
                source,
            })?;
        debug!(
            "Organization '{}' resolved to tenant '{}'",
            selector.organization_id, tenant_id
        );

        let fail = |step: AuthStep| {
            let tenant = tenant_id.clone();
            move |source| HarnessError::Authentication {
                step,
                tenant,
                source,
            }
        };

        let existing = self
            .provider
            .find_user(&tenant_id, &identity.user_id)
            .await
            .map_err(fail(AuthStep::ProvisionUser))?;
        if existing.is_none() {
            self.provider
                .provision_user(&tenant_id, identity)
                .await
                .map_err(fail(AuthStep::ProvisionUser))?;
            debug!(
                "Provisioned user '{}' in tenant '{}'",
                identity.user_id, tenant_id
            );
        }

        let provider_token = self
            .provider
            .login(&tenant_id, &identity.email, &identity.password)
            .await
            .map_err(fail(AuthStep::ProviderLogin))?;

        let exchanged_token = self
            .exchanger
            .exchange(&self.applicant, &identity.user_id, &provider_token.id_token)
            .await
            .map_err(fail(AuthStep::TokenExchange))?;

        info!(
            "Signed in user '{}' to tenant '{}'",
            identity.user_id, tenant_id
        );
        Ok(TenantCredential {
            tenant_id,
            user_id: identity.user_id.clone(),
            raw_password: identity.password.clone(),
            provider_token,
            exchanged_token,
        })
    }

    /// Refresh the provider token and exchange it again.
    pub async fn refresh(&self, credential: &mut TenantCredential) -> HarnessResult<()> {
        let tenant = credential.tenant_id.clone();
        let provider_token = self
            .provider
            .refresh_id_token(&tenant, &credential.provider_token.refresh_token)
            .await
            .map_err(|source| HarnessError::Authentication {
                step: AuthStep::ProviderLogin,
                tenant: tenant.clone(),
                source,
            })?;

        credential.exchanged_token = self
            .exchanger
            .exchange(&self.applicant, &credential.user_id, &provider_token.id_token)
            .await
            .map_err(|source| HarnessError::Authentication {
                step: AuthStep::TokenExchange,
                tenant,
                source,
            })?;
        credential.provider_token = provider_token;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type InMemoryAuthenticator =
        Authenticator<StaticTenantDirectory, InMemoryIdentityProvider, InMemoryTokenExchanger>;

    async fn authenticator() -> (InMemoryAuthenticator, Arc<InMemoryIdentityProvider>) {
        let directory = StaticTenantDirectory::new();
        directory.add_tenant("org-1", "tenant-1").await;

        let provider = Arc::new(InMemoryIdentityProvider::new());
        let exchanger = Arc::new(InMemoryTokenExchanger::new(Arc::clone(&provider)));
        exchanger.allow_applicant("harness").await;

        let authenticator =
            Authenticator::new(Arc::new(directory), Arc::clone(&provider), exchanger, "harness");
        (authenticator, provider)
    }

    #[tokio::test]
    async fn test_authenticate_provisions_missing_user() {
        let (authenticator, provider) = authenticator().await;
        let identity = SubjectIdentity::generate("admin");

        let credential = authenticator
            .authenticate(&TenantSelector::new("org-1"), &identity)
            .await
            .unwrap();

        assert_eq!(credential.tenant_id, "tenant-1");
        assert_eq!(credential.user_id, identity.user_id);
        assert!(!credential.exchanged_token.is_empty());
        assert_eq!(provider.user_count("tenant-1").await, 1);

        // Second sign-in reuses the provisioned user
        authenticator
            .authenticate(&TenantSelector::new("org-1"), &identity)
            .await
            .unwrap();
        assert_eq!(provider.user_count("tenant-1").await, 1);
    }

    #[tokio::test]
    async fn test_unknown_organization_fails_at_resolve() {
        let (authenticator, _) = authenticator().await;
        let result = authenticator
            .authenticate(&TenantSelector::new("org-9"), &SubjectIdentity::generate("x"))
            .await;

        match result {
            Err(HarnessError::Authentication { step, tenant, .. }) => {
                assert_eq!(step, AuthStep::ResolveTenant);
                assert_eq!(tenant, "org-9");
            }
            other => panic!("expected Authentication error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wrong_password_fails_at_login() {
        let (authenticator, _) = authenticator().await;
        let mut identity = SubjectIdentity::generate("admin");
        authenticator
            .authenticate(&TenantSelector::new("org-1"), &identity)
            .await
            .unwrap();

        identity.password = "not-the-password".to_string();
        let result = authenticator
            .authenticate(&TenantSelector::new("org-1"), &identity)
            .await;

        assert!(matches!(
            result,
            Err(HarnessError::Authentication {
                step: AuthStep::ProviderLogin,
                source: IdentityError::InvalidCredentials { .. },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_provisioning_failure_is_reported() {
        let (authenticator, provider) = authenticator().await;
        provider
            .fail_provisioning(Some(IdentityError::Unavailable {
                message: "quota".to_string(),
            }))
            .await;

        let result = authenticator
            .authenticate(&TenantSelector::new("org-1"), &SubjectIdentity::generate("x"))
            .await;
        assert!(matches!(
            result,
            Err(HarnessError::Authentication {
                step: AuthStep::ProvisionUser,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_rejected_applicant_fails_at_exchange() {
        let directory = StaticTenantDirectory::new();
        directory.add_tenant("org-1", "tenant-1").await;
        let provider = Arc::new(InMemoryIdentityProvider::new());
        let exchanger = Arc::new(InMemoryTokenExchanger::new(Arc::clone(&provider)));
        let authenticator = Authenticator::new(Arc::new(directory), provider, exchanger, "stranger");

        let result = authenticator
            .authenticate(&TenantSelector::new("org-1"), &SubjectIdentity::generate("x"))
            .await;
        assert!(matches!(
            result,
            Err(HarnessError::Authentication {
                step: AuthStep::TokenExchange,
                source: IdentityError::ApplicantRejected { .. },
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_refresh_issues_new_tokens() {
        let (authenticator, _) = authenticator().await;
        let mut credential = authenticator
            .authenticate(&TenantSelector::new("org-1"), &SubjectIdentity::generate("x"))
            .await
            .unwrap();
        let before = credential.clone();

        authenticator.refresh(&mut credential).await.unwrap();

        assert_ne!(credential.provider_token.id_token, before.provider_token.id_token);
        assert_ne!(credential.exchanged_token, before.exchanged_token);
    }

    #[test]
    fn test_debug_redacts_password() {
        let identity = SubjectIdentity::generate("x");
        let rendered = format!("{:?}", identity);
        assert!(!rendered.contains(&identity.password));
    }
}
