//! Access-token validation: HS256 JWTs issued by the account service.

use std::sync::Arc;

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;
use crate::store::{UserDirectory, UserIdentity};

/// Claims carried by an access token.
#[derive(Debug, Serialize, Deserialize)]
pub struct AccessClaims {
    /// Account id. Issuers emit either a string or an integer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    pub exp: i64,
    /// `access` or `refresh`. Absent on tokens from issuers that don't type them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

impl AccessClaims {
    /// The account id, preferring `user_id` over `sub`.
    pub fn subject(&self) -> Option<String> {
        let from_user_id = match &self.user_id {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        from_user_id
            .or_else(|| self.sub.clone())
            .filter(|s| !s.is_empty())
    }
}

/// Resolves a bearer credential to an active account.
///
/// Every credential problem (bad signature, malformed token, expiry, wrong
/// token type, unknown or deactivated subject) yields `Unauthenticated`.
/// Only a failing account lookup surfaces as a store error.
pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
    users: Arc<dyn UserDirectory>,
}

impl TokenValidator {
    pub fn new(secret: &str, users: Arc<dyn UserDirectory>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.leeway = 0;

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            users,
        }
    }

    /// Verify signature and expiry, returning the claims.
    pub fn verify(&self, credential: &str) -> Result<AccessClaims, GatewayError> {
        let data = jsonwebtoken::decode::<AccessClaims>(credential, &self.key, &self.validation)
            .map_err(|e| {
                tracing::debug!(?e, "credential rejected");
                GatewayError::Unauthenticated
            })?;

        let claims = data.claims;
        if claims.token_type.as_deref().is_some_and(|t| t != "access") {
            tracing::debug!(token_type = ?claims.token_type, "non-access token presented");
            return Err(GatewayError::Unauthenticated);
        }
        Ok(claims)
    }

    /// Verify the credential and resolve its subject to an active account.
    pub async fn resolve(&self, credential: &str) -> Result<UserIdentity, GatewayError> {
        let claims = self.verify(credential)?;
        let subject = claims.subject().ok_or(GatewayError::Unauthenticated)?;

        match self.users.find_active_user(&subject).await? {
            Some(user) => Ok(user),
            None => {
                tracing::debug!(user_id = %subject, "credential subject is not an active user");
                Err(GatewayError::Unauthenticated)
            }
        }
    }
}
