//! The durable entities of the authorisation code flow, and the narrow
//! collaborator traits the validators and grant handler consume. All durable
//! state lives behind these traits - the core holds nothing between
//! requests. Every method is an asynchronous i/o operation and the only
//! place a request logically suspends; cancellation propagates by dropping
//! the future, and no trait method may leave state half mutated.

use crate::idm::oauth2::pkce::CodeChallenge;
use crate::idm::oauth2::Oauth2Client;
use crate::prelude::*;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A one-time authorisation code awaiting redemption.
///
/// A code is redeemable at most once: `is_consumed` transitions false to
/// true exactly once, and the transition is observed atomically by exactly
/// one concurrent redemption attempt via
/// [`AuthorisationCodeStore::consume_code`].
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthorisationCode {
    /// The opaque code value, and the storage key.
    pub code: String,
    pub client_id: String,
    /// Absent for grants that carry no end user.
    pub subject_id: Option<Uuid>,
    pub session_id: Uuid,
    /// The redirect uri exactly as the authorise request carried it - absent
    /// when the request relied on the client's single registered uri.
    pub redirect_uri: Option<Url>,
    pub scopes: BTreeSet<String>,
    pub code_challenge: Option<CodeChallenge>,
    pub nonce: Option<String>,
    /// Epoch seconds.
    pub created_at: u64,
    /// Epoch seconds. Redeemable while `now <= expiry`.
    pub expiry: u64,
    pub is_consumed: bool,
    pub consumed_at: Option<u64>,
    /// Claims captured at authorisation time, merged into the grant result.
    pub claims: BTreeMap<String, serde_json::Value>,
    pub properties: BTreeMap<String, String>,
}

impl AuthorisationCode {
    /// Generate an opaque code value - 32 random bytes, base64url without
    /// padding.
    pub fn generate_code() -> String {
        let random: [u8; 32] = rand::thread_rng().gen();
        general_purpose::URL_SAFE_NO_PAD.encode(random)
    }
}

/// A durable grant issued off the back of an authorisation (refresh tokens,
/// reference tokens, consents).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PersistedGrant {
    /// The storage key.
    pub key: String,
    /// The grant kind, e.g. `refresh_token`.
    pub grant_type: String,
    pub subject_id: Option<Uuid>,
    pub client_id: String,
    pub session_id: Option<Uuid>,
    pub created_at: u64,
    pub expiry: u64,
    /// Serialised grant payload, opaque to the store.
    pub data: String,
}

/// Filter for bulk grant removal. `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistedGrantFilter {
    pub subject_id: Option<Uuid>,
    pub client_id: Option<String>,
    pub session_id: Option<Uuid>,
}

impl PersistedGrantFilter {
    pub fn matches(&self, grant: &PersistedGrant) -> bool {
        if let Some(subject_id) = self.subject_id {
            if grant.subject_id != Some(subject_id) {
                return false;
            }
        }
        if let Some(client_id) = self.client_id.as_deref() {
            if grant.client_id != client_id {
                return false;
            }
        }
        if let Some(session_id) = self.session_id {
            if grant.session_id != Some(session_id) {
                return false;
            }
        }
        true
    }
}

/// Lookup of registered clients.
#[async_trait]
pub trait ClientStore: Send + Sync {
    async fn find_client_by_id(
        &self,
        client_id: &str,
    ) -> Result<Option<Arc<Oauth2Client>>, OperationError>;
}

/// Storage of issued authorisation codes.
#[async_trait]
pub trait AuthorisationCodeStore: Send + Sync {
    async fn store_code(&self, code: AuthorisationCode) -> Result<(), OperationError>;

    /// Non-mutating lookup.
    async fn get_code(&self, code: &str) -> Result<Option<AuthorisationCode>, OperationError>;

    /// Atomically transition the code's `is_consumed` flag from false to
    /// true. Of any set of concurrent callers, exactly one observes
    /// `Ok(true)`; every other caller (and any caller after the first)
    /// observes `Ok(false)`. Implementations MUST make this a single
    /// conditional update - a read-check-write sequence is not acceptable.
    async fn consume_code(&self, code: &str, ct: Duration) -> Result<bool, OperationError>;

    async fn remove_code(&self, code: &str) -> Result<(), OperationError>;
}

/// Storage of durable grants, consumed here only for revocation cascades.
#[async_trait]
pub trait PersistedGrantStore: Send + Sync {
    /// Remove every grant matching the filter. Bulk, best effort.
    async fn remove_all_grants(&self, filter: &PersistedGrantFilter) -> Result<(), OperationError>;
}

/// Inputs for a profile claims request.
#[derive(Debug, Clone)]
pub struct ProfileDataRequest {
    pub subject_id: Uuid,
    pub client_id: String,
    pub scopes: BTreeSet<String>,
}

/// Claims released by the profile service for a grant.
#[derive(Debug, Clone, Default)]
pub struct ProfileData {
    pub claims: BTreeMap<String, serde_json::Value>,
}

/// Subject liveness and claims enrichment.
#[async_trait]
pub trait ProfileService: Send + Sync {
    /// Is the subject still permitted to receive tokens for this client?
    async fn is_active(&self, subject_id: Uuid, client_id: &str) -> Result<bool, OperationError>;

    async fn get_profile_data(
        &self,
        profile_req: &ProfileDataRequest,
    ) -> Result<ProfileData, OperationError>;
}
