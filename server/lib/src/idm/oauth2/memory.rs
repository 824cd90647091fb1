//! In memory reference stores. These are the executable model of the store
//! contracts - in particular the single atomic conditional update that
//! [`AuthorisationCodeStore::consume_code`] requires - and back the crate's
//! tests. Mutex sections are short and never held across an await.

use crate::idm::oauth2::store::{
    AuthorisationCode, AuthorisationCodeStore, PersistedGrant, PersistedGrantFilter,
    PersistedGrantStore, ProfileData, ProfileDataRequest, ProfileService,
};
use crate::prelude::*;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct MemAuthorisationCodeStore {
    codes: Mutex<BTreeMap<String, AuthorisationCode>>,
}

impl MemAuthorisationCodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn code_count(&self) -> usize {
        self.codes.lock().map(|codes| codes.len()).unwrap_or(0)
    }
}

#[async_trait]
impl AuthorisationCodeStore for MemAuthorisationCodeStore {
    async fn store_code(&self, code: AuthorisationCode) -> Result<(), OperationError> {
        let mut codes = self.codes.lock().map_err(|_| OperationError::Backend)?;
        codes.insert(code.code.clone(), code);
        Ok(())
    }

    async fn get_code(&self, code: &str) -> Result<Option<AuthorisationCode>, OperationError> {
        let codes = self.codes.lock().map_err(|_| OperationError::Backend)?;
        Ok(codes.get(code).cloned())
    }

    async fn consume_code(&self, code: &str, ct: Duration) -> Result<bool, OperationError> {
        let mut codes = self.codes.lock().map_err(|_| OperationError::Backend)?;
        // The compare and the flag set occur under one lock hold - this is
        // the atomic conditional update the trait demands.
        match codes.get_mut(code) {
            Some(found) if !found.is_consumed => {
                found.is_consumed = true;
                found.consumed_at = Some(ct.as_secs());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove_code(&self, code: &str) -> Result<(), OperationError> {
        let mut codes = self.codes.lock().map_err(|_| OperationError::Backend)?;
        codes.remove(code);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemPersistedGrantStore {
    grants: Mutex<BTreeMap<String, PersistedGrant>>,
}

impl MemPersistedGrantStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_grant(&self, grant: PersistedGrant) {
        if let Ok(mut grants) = self.grants.lock() {
            grants.insert(grant.key.clone(), grant);
        }
    }

    pub fn grant_count(&self) -> usize {
        self.grants.lock().map(|grants| grants.len()).unwrap_or(0)
    }

    pub fn contains_grant(&self, key: &str) -> bool {
        self.grants
            .lock()
            .map(|grants| grants.contains_key(key))
            .unwrap_or(false)
    }
}

#[async_trait]
impl PersistedGrantStore for MemPersistedGrantStore {
    async fn remove_all_grants(&self, filter: &PersistedGrantFilter) -> Result<(), OperationError> {
        let mut grants = self.grants.lock().map_err(|_| OperationError::Backend)?;
        grants.retain(|_, grant| !filter.matches(grant));
        Ok(())
    }
}

/// A profile service with a switchable liveness flag and a fixed claim set.
pub struct MemProfileService {
    active: AtomicBool,
    claims: Mutex<BTreeMap<String, serde_json::Value>>,
}

impl MemProfileService {
    pub fn new(active: bool) -> Self {
        MemProfileService {
            active: AtomicBool::new(active),
            claims: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    pub fn set_claim(&self, name: &str, value: serde_json::Value) {
        if let Ok(mut claims) = self.claims.lock() {
            claims.insert(name.to_string(), value);
        }
    }
}

impl Default for MemProfileService {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl ProfileService for MemProfileService {
    async fn is_active(&self, _subject_id: Uuid, _client_id: &str) -> Result<bool, OperationError> {
        Ok(self.active.load(Ordering::Relaxed))
    }

    async fn get_profile_data(
        &self,
        _profile_req: &ProfileDataRequest,
    ) -> Result<ProfileData, OperationError> {
        let claims = self.claims.lock().map_err(|_| OperationError::Backend)?;
        Ok(ProfileData {
            claims: claims.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn demo_code(value: &str) -> AuthorisationCode {
        AuthorisationCode {
            code: value.to_string(),
            client_id: "test_resource_server".to_string(),
            subject_id: Some(Uuid::new_v4()),
            session_id: Uuid::new_v4(),
            redirect_uri: None,
            scopes: BTreeSet::new(),
            code_challenge: None,
            nonce: None,
            created_at: 0,
            expiry: 300,
            is_consumed: false,
            consumed_at: None,
            claims: BTreeMap::new(),
            properties: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_mem_code_store_consume_once() {
        let store = MemAuthorisationCodeStore::new();
        store
            .store_code(demo_code("abc"))
            .await
            .expect("store failed");

        let ct = Duration::from_secs(100);
        assert_eq!(store.consume_code("abc", ct).await, Ok(true));
        // Second consume observes the flag already set.
        assert_eq!(store.consume_code("abc", ct).await, Ok(false));
        // Unknown codes cannot be consumed.
        assert_eq!(store.consume_code("missing", ct).await, Ok(false));

        let code = store
            .get_code("abc")
            .await
            .expect("get failed")
            .expect("code missing");
        assert!(code.is_consumed);
        assert_eq!(code.consumed_at, Some(100));
    }

    #[tokio::test]
    async fn test_mem_grant_store_filtered_removal() {
        let store = MemPersistedGrantStore::new();
        let subject_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();

        store.insert_grant(PersistedGrant {
            key: "keep".to_string(),
            grant_type: "refresh_token".to_string(),
            subject_id: Some(Uuid::new_v4()),
            client_id: "other_client".to_string(),
            session_id: None,
            created_at: 0,
            expiry: 900,
            data: String::new(),
        });
        store.insert_grant(PersistedGrant {
            key: "drop".to_string(),
            grant_type: "refresh_token".to_string(),
            subject_id: Some(subject_id),
            client_id: "test_resource_server".to_string(),
            session_id: Some(session_id),
            created_at: 0,
            expiry: 900,
            data: String::new(),
        });

        let filter = PersistedGrantFilter {
            subject_id: Some(subject_id),
            client_id: Some("test_resource_server".to_string()),
            session_id: Some(session_id),
        };
        store
            .remove_all_grants(&filter)
            .await
            .expect("removal failed");

        assert!(store.contains_grant("keep"));
        assert!(!store.contains_grant("drop"));
    }
}
