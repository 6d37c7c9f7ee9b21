//! In-memory identity collaborators.
//!
//! Passwords are never stored in clear: [`InMemoryIdentityProvider`] keeps a
//! per-user random salt and an iterated SHA-256 hash, both base64-encoded, the
//! same shape an identity platform expects when users are imported with a hash
//! configuration.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    IdentityError, IdentityProvider, IdentityUser, ProviderToken, SubjectIdentity,
    TenantDirectory, TokenExchanger,
};

/// Static organization → tenant mapping.
///
/// # Example Usage
///
/// ```rust
/// use usermgmt_harness::identity::{StaticTenantDirectory, TenantDirectory};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let directory = StaticTenantDirectory::new();
/// directory.add_tenant("org-1", "tenant-1").await;
///
/// assert_eq!(directory.resolve_tenant("org-1").await?, "tenant-1");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticTenantDirectory {
    tenants: Arc<RwLock<HashMap<String, String>>>,
}

impl StaticTenantDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_tenant(&self, organization_id: &str, tenant_id: &str) {
        let mut tenants = self.tenants.write().await;
        tenants.insert(organization_id.to_string(), tenant_id.to_string());
    }

    /// Returns the tenant the organization mapped to, if any.
    pub async fn remove_tenant(&self, organization_id: &str) -> Option<String> {
        let mut tenants = self.tenants.write().await;
        tenants.remove(organization_id)
    }

    pub async fn tenant_count(&self) -> usize {
        self.tenants.read().await.len()
    }
}

impl TenantDirectory for StaticTenantDirectory {
    async fn resolve_tenant(&self, organization_id: &str) -> Result<String, IdentityError> {
        let tenants = self.tenants.read().await;
        tenants
            .get(organization_id)
            .cloned()
            .ok_or_else(|| IdentityError::TenantNotFound {
                organization_id: organization_id.to_string(),
            })
    }
}

/// Password hashing parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashConfig {
    /// Number of SHA-256 iterations.
    pub rounds: u32,
    /// Bytes placed between the salt and the password.
    pub salt_separator: String,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            rounds: 8,
            salt_separator: "Bw==".to_string(),
        }
    }
}

impl HashConfig {
    /// Base64 of the iterated hash of `salt || separator || password`.
    pub fn hash(&self, salt: &[u8], password: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(salt);
        hasher.update(self.salt_separator.as_bytes());
        hasher.update(password.as_bytes());
        let mut digest = hasher.finalize();

        for _ in 1..self.rounds.max(1) {
            digest = Sha256::digest(digest);
        }

        STANDARD.encode(digest)
    }
}

/// Claims behind an id token issued by [`InMemoryIdentityProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub tenant_id: String,
    pub user_id: String,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredUser {
    user: IdentityUser,
    salt: String,
    password_hash: String,
}

#[derive(Default)]
struct ProviderState {
    // tenant_id -> user_id -> user
    users: HashMap<String, HashMap<String, StoredUser>>,
    id_tokens: HashMap<String, TokenClaims>,
    // refresh token -> (tenant_id, user_id)
    refresh_tokens: HashMap<String, (String, String)>,
    provisioning_failure: Option<IdentityError>,
}

/// Identity platform kept in memory.
#[derive(Clone, Default)]
pub struct InMemoryIdentityProvider {
    state: Arc<RwLock<ProviderState>>,
    hash_config: HashConfig,
}

impl InMemoryIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hash_config(hash_config: HashConfig) -> Self {
        Self {
            state: Arc::default(),
            hash_config,
        }
    }

    /// Make every subsequent provisioning fail with `error`, or succeed
    /// again with `None`.
    pub async fn fail_provisioning(&self, error: Option<IdentityError>) {
        self.state.write().await.provisioning_failure = error;
    }

    pub async fn user_count(&self, tenant_id: &str) -> usize {
        self.state
            .read()
            .await
            .users
            .get(tenant_id)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// Replace a user's password. Tokens issued before stay valid.
    pub async fn reset_password(
        &self,
        tenant_id: &str,
        user_id: &str,
        new_password: &str,
    ) -> Result<(), IdentityError> {
        let mut state = self.state.write().await;
        let stored = state
            .users
            .get_mut(tenant_id)
            .and_then(|users| users.get_mut(user_id))
            .ok_or_else(|| IdentityError::UserNotFound {
                tenant_id: tenant_id.to_string(),
                user_id: user_id.to_string(),
            })?;

        let salt = Uuid::new_v4();
        stored.password_hash = self.hash_config.hash(salt.as_bytes(), new_password);
        stored.salt = STANDARD.encode(salt.as_bytes());
        debug!("Password reset for user '{}' in '{}'", user_id, tenant_id);
        Ok(())
    }

    /// Claims of a live id token.
    pub async fn verify_id_token(&self, id_token: &str) -> Result<TokenClaims, IdentityError> {
        self.state
            .read()
            .await
            .id_tokens
            .get(id_token)
            .cloned()
            .ok_or(IdentityError::InvalidToken)
    }

    fn issue_tokens(&self, state: &mut ProviderState, tenant_id: &str, user_id: &str) -> ProviderToken {
        let token = ProviderToken {
            id_token: Uuid::new_v4().to_string(),
            refresh_token: Uuid::new_v4().to_string(),
        };
        state.id_tokens.insert(
            token.id_token.clone(),
            TokenClaims {
                tenant_id: tenant_id.to_string(),
                user_id: user_id.to_string(),
                issued_at: Utc::now(),
            },
        );
        state.refresh_tokens.insert(
            token.refresh_token.clone(),
            (tenant_id.to_string(), user_id.to_string()),
        );
        token
    }
}

impl IdentityProvider for InMemoryIdentityProvider {
    async fn find_user(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<Option<IdentityUser>, IdentityError> {
        let state = self.state.read().await;
        Ok(state
            .users
            .get(tenant_id)
            .and_then(|users| users.get(user_id))
            .map(|stored| stored.user.clone()))
    }

    async fn provision_user(
        &self,
        tenant_id: &str,
        identity: &SubjectIdentity,
    ) -> Result<IdentityUser, IdentityError> {
        let mut state = self.state.write().await;
        if let Some(error) = state.provisioning_failure.clone() {
            warn!("Provisioning of '{}' refused: {}", identity.user_id, error);
            return Err(error);
        }

        let users = state.users.entry(tenant_id.to_string()).or_default();
        if users.contains_key(&identity.user_id)
            || users.values().any(|u| u.user.email == identity.email)
        {
            return Err(IdentityError::UserAlreadyExists {
                tenant_id: tenant_id.to_string(),
                user_id: identity.user_id.clone(),
            });
        }

        let salt = Uuid::new_v4();
        let user = IdentityUser {
            tenant_id: tenant_id.to_string(),
            user_id: identity.user_id.clone(),
            email: identity.email.clone(),
            display_name: identity.display_name.clone(),
        };
        users.insert(
            identity.user_id.clone(),
            StoredUser {
                user: user.clone(),
                salt: STANDARD.encode(salt.as_bytes()),
                password_hash: self.hash_config.hash(salt.as_bytes(), &identity.password),
            },
        );
        Ok(user)
    }

    async fn login(
        &self,
        tenant_id: &str,
        email: &str,
        password: &str,
    ) -> Result<ProviderToken, IdentityError> {
        let mut state = self.state.write().await;
        let invalid = || IdentityError::InvalidCredentials {
            email: email.to_string(),
        };

        let stored = state
            .users
            .get(tenant_id)
            .and_then(|users| users.values().find(|u| u.user.email == email))
            .ok_or_else(invalid)?;

        let salt = STANDARD.decode(&stored.salt).map_err(|_| invalid())?;
        if self.hash_config.hash(&salt, password) != stored.password_hash {
            return Err(invalid());
        }

        let user_id = stored.user.user_id.clone();
        Ok(self.issue_tokens(&mut state, tenant_id, &user_id))
    }

    async fn refresh_id_token(
        &self,
        tenant_id: &str,
        refresh_token: &str,
    ) -> Result<ProviderToken, IdentityError> {
        let mut state = self.state.write().await;
        let (owner_tenant, user_id) = state
            .refresh_tokens
            .remove(refresh_token)
            .ok_or(IdentityError::InvalidToken)?;
        if owner_tenant != tenant_id {
            return Err(IdentityError::InvalidToken);
        }
        Ok(self.issue_tokens(&mut state, tenant_id, &user_id))
    }
}

/// Claims behind an application token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangedClaims {
    pub applicant: String,
    pub tenant_id: String,
    pub user_id: String,
}

/// Token exchange service that trusts one [`InMemoryIdentityProvider`].
#[derive(Clone)]
pub struct InMemoryTokenExchanger {
    provider: Arc<InMemoryIdentityProvider>,
    applicants: Arc<RwLock<HashSet<String>>>,
    issued: Arc<RwLock<HashMap<String, ExchangedClaims>>>,
}

impl InMemoryTokenExchanger {
    pub fn new(provider: Arc<InMemoryIdentityProvider>) -> Self {
        Self {
            provider,
            applicants: Arc::default(),
            issued: Arc::default(),
        }
    }

    pub async fn allow_applicant(&self, applicant: &str) {
        self.applicants.write().await.insert(applicant.to_string());
    }

    /// Claims of an application token this exchanger issued.
    pub async fn validate(&self, token: &str) -> Option<ExchangedClaims> {
        self.issued.read().await.get(token).cloned()
    }
}

impl TokenExchanger for InMemoryTokenExchanger {
    async fn exchange(
        &self,
        applicant: &str,
        user_id: &str,
        id_token: &str,
    ) -> Result<String, IdentityError> {
        if !self.applicants.read().await.contains(applicant) {
            return Err(IdentityError::ApplicantRejected {
                applicant: applicant.to_string(),
            });
        }

        let claims = self.provider.verify_id_token(id_token).await?;
        if claims.user_id != user_id {
            return Err(IdentityError::InvalidToken);
        }

        let mut hasher = Sha256::new();
        hasher.update(applicant.as_bytes());
        hasher.update(user_id.as_bytes());
        hasher.update(Uuid::new_v4().as_bytes());
        let token = STANDARD.encode(hasher.finalize());

        self.issued.write().await.insert(
            token.clone(),
            ExchangedClaims {
                applicant: applicant.to_string(),
                tenant_id: claims.tenant_id,
                user_id: user_id.to_string(),
            },
        );
        Ok(token)
    }
}
