use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use relay_api::RelayError;

use crate::config::{AdmissionConfig, PrincipalConfig};
use crate::credential::Credential;
use crate::policy::{Decision, DenyReason, Policy};
use crate::protocol::{ConnectionMetadata, Protocol};

/// Pluggable credential check.
///
/// `Err` means the authorizer itself failed (backend down, corrupt entry);
/// the gate turns that into a denial.
pub trait Authorizer: Send + Sync {
    fn authorize(
        &self,
        meta: &ConnectionMetadata,
        credential: &Credential,
    ) -> Result<Decision, RelayError>;
}

// ═══════════════════════════════════════════════════════════════
//  StaticAuthorizer
// ═══════════════════════════════════════════════════════════════

/// Authorizer backed by the principals listed in configuration.
pub struct StaticAuthorizer {
    principals: HashMap<String, PrincipalConfig>,
}

impl StaticAuthorizer {
    pub fn new(principals: impl IntoIterator<Item = PrincipalConfig>) -> Self {
        Self {
            principals: principals
                .into_iter()
                .map(|p| (p.identity.clone(), p))
                .collect(),
        }
    }
}

impl Authorizer for StaticAuthorizer {
    fn authorize(
        &self,
        _meta: &ConnectionMetadata,
        credential: &Credential,
    ) -> Result<Decision, RelayError> {
        let Some(entry) = self.principals.get(credential.identity()) else {
            return Ok(Decision::Deny(DenyReason::UnknownIdentity));
        };
        if !credential.secret_matches(&entry.secret) {
            return Ok(Decision::Deny(DenyReason::BadSecret));
        }
        Ok(Decision::Allow(Policy {
            principal: entry
                .principal
                .clone()
                .unwrap_or_else(|| entry.identity.clone()),
            publish: entry.publish.clone(),
            disconnect_after: Duration::from_secs(entry.disconnect_after_secs),
            refresh_after: Duration::from_secs(entry.refresh_after_secs),
            issued_at: Instant::now(),
        }))
    }
}

// ═══════════════════════════════════════════════════════════════
//  AdmissionGate
// ═══════════════════════════════════════════════════════════════

/// Runs before any message of a connection reaches the router.
/// Fails closed: every error path ends in `Decision::Deny`.
#[derive(Clone)]
pub struct AdmissionGate {
    authorizer: Arc<dyn Authorizer>,
    protocols: Vec<Protocol>,
}

impl AdmissionGate {
    pub fn new(authorizer: Arc<dyn Authorizer>, protocols: Vec<Protocol>) -> Self {
        Self {
            authorizer,
            protocols,
        }
    }

    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self::new(
            Arc::new(StaticAuthorizer::new(config.principals.iter().cloned())),
            config.protocols.clone(),
        )
    }

    pub fn authorize(&self, meta: &ConnectionMetadata, credential: &Credential) -> Decision {
        if !self.protocols.is_empty() {
            let protocol = meta.protocol();
            if !protocol.is_some_and(|p| self.protocols.contains(&p)) {
                tracing::info!(
                    connection = %meta.connection,
                    client_id = %meta.client_id,
                    protocols = ?meta.protocols,
                    "connection denied: protocol"
                );
                return Decision::Deny(DenyReason::ProtocolNotAllowed(protocol));
            }
        }

        let decision = match self.authorizer.authorize(meta, credential) {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(
                    connection = %meta.connection,
                    client_id = %meta.client_id,
                    error = %e,
                    "authorizer failed, denying"
                );
                Decision::Deny(DenyReason::Internal(e.to_string()))
            }
        };

        match &decision {
            Decision::Allow(policy) => tracing::info!(
                connection = %meta.connection,
                client_id = %meta.client_id,
                principal = %policy.principal,
                "connection admitted"
            ),
            Decision::Deny(reason) => tracing::info!(
                connection = %meta.connection,
                client_id = %meta.client_id,
                identity = %credential.identity(),
                reason = ?reason,
                "connection denied"
            ),
        }
        decision
    }
}
