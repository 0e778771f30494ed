//! Identity verification seam
//!
//! Token issuance and verification live outside the relay; the core consumes
//! them through [`IdentityVerifier`]: opaque credential in, verified identity
//! out. The bundled [`StaticTokenVerifier`] is the in-process stand-in wired
//! from the registration service's seeded accounts.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{RelayError, Result};
use crate::protocol::events::{Identity, IdentityId};

/// Verifies an opaque credential and resolves the identity behind it.
///
/// A failure always means reject the connection; there is no retry.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<Identity>;
}

/// Fixed token table: credential -> identity id -> identity.
///
/// The two-step lookup mirrors the external service's shape (decode token,
/// then load the account) so both failure modes stay distinguishable:
/// unknown token is `Unauthenticated`, a token whose account no longer
/// exists is `IdentityMissing`.
#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, IdentityId>,
    identities: HashMap<IdentityId, Identity>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an identity and the credential that resolves to it.
    pub fn with_identity(mut self, token: &str, identity: Identity) -> Self {
        self.tokens.insert(token.to_string(), identity.id.clone());
        self.identities.insert(identity.id.clone(), identity);
        self
    }

    /// Register a credential pointing at an identity id without an account.
    /// Verification of such a token fails with `IdentityMissing`.
    pub fn with_dangling_token(mut self, token: &str, identity_id: &str) -> Self {
        self.tokens
            .insert(token.to_string(), identity_id.to_string());
        self
    }
}

#[async_trait]
impl IdentityVerifier for StaticTokenVerifier {
    async fn verify(&self, credential: &str) -> Result<Identity> {
        let identity_id = self
            .tokens
            .get(credential)
            .ok_or_else(|| RelayError::unauthenticated("invalid or expired credential"))?;

        self.identities
            .get(identity_id)
            .cloned()
            .ok_or_else(|| RelayError::identity_missing(format!("no identity {}", identity_id)))
    }
}
