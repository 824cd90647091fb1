//! Authorisation code redemption.
//!
//! A code moves `Issued -> Consumed` on the single successful redemption, or
//! `Issued -> Removed` on expiry and error paths. Nothing else - a code is
//! never reused or resurrected. The consuming transition is one atomic
//! conditional update in the store, so of any set of concurrent redemption
//! attempts exactly one succeeds; every other attempt is answered as a
//! replay. A replayed code is a strong signal the code leaked, so every
//! persisted grant descending from it is revoked (RFC 6749 4.1.2).

use crate::idm::oauth2::pkce;
use crate::idm::oauth2::store::{
    AuthorisationCode, AuthorisationCodeStore, PersistedGrantFilter, PersistedGrantStore,
    ProfileDataRequest, ProfileService,
};
use crate::idm::oauth2::{Oauth2Client, Oauth2Error, Oauth2Failure};
use crate::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A token request for the `authorization_code` grant, after client
/// authentication. `client` is the authenticated caller - `None` when
/// client authentication did not resolve one.
#[derive(Debug, Clone, Default)]
pub struct AuthorisationCodeTokenRequest {
    pub client: Option<Arc<Oauth2Client>>,
    pub code: Option<String>,
    pub redirect_uri: Option<Url>,
    pub code_verifier: Option<String>,
}

/// The outcome of a successful redemption, used to mint tokens.
#[derive(Debug, Clone)]
pub struct CodeGrantResult {
    pub subject_id: Option<Uuid>,
    pub session_id: Uuid,
    pub scopes: BTreeSet<String>,
    /// Seeded with the nonce when present, then profile claims, then the
    /// code's stored custom claims.
    pub claims: BTreeMap<String, serde_json::Value>,
}

/// Redeems one-time authorisation codes for token grants.
pub struct AuthorisationCodeGrantHandler {
    codes: Arc<dyn AuthorisationCodeStore>,
    grants: Arc<dyn PersistedGrantStore>,
    profile: Arc<dyn ProfileService>,
}

impl AuthorisationCodeGrantHandler {
    pub fn new(
        codes: Arc<dyn AuthorisationCodeStore>,
        grants: Arc<dyn PersistedGrantStore>,
        profile: Arc<dyn ProfileService>,
    ) -> Self {
        AuthorisationCodeGrantHandler {
            codes,
            grants,
            profile,
        }
    }

    #[instrument(level = "debug", skip_all)]
    pub async fn handle(
        &self,
        token_req: &AuthorisationCodeTokenRequest,
        ct: Duration,
    ) -> Result<CodeGrantResult, Oauth2Failure> {
        let Some(code_value) = token_req.code.as_deref().filter(|code| !code.is_empty()) else {
            security_info!("Token request is missing the authorisation code");
            return Err(Oauth2Failure::new(
                Oauth2Error::InvalidGrant,
                "authorisation code is missing",
            ));
        };

        let Some(code) = self.codes.get_code(code_value).await? else {
            security_info!("Unknown authorisation code presented");
            return Err(Oauth2Failure::new(
                Oauth2Error::InvalidGrant,
                "authorisation code is invalid",
            ));
        };

        // A consumed code arriving again is a replay - likely interception
        // or a stolen code. Revoke everything that was issued from it.
        if code.is_consumed {
            security_critical!(
                client_id = %code.client_id,
                session_id = %code.session_id,
                "Attempt to reuse a consumed authorisation code detected, revoking descendant grants"
            );
            self.revoke_descendant_grants(&code).await;
            return Err(Oauth2Failure::new(
                Oauth2Error::InvalidGrant,
                "authorisation code has already been used",
            ));
        }

        if ct.as_secs() > code.expiry {
            security_info!("Expired authorisation code presented");
            if let Err(op_err) = self.codes.remove_code(code_value).await {
                admin_error!(?op_err, "Failed to remove an expired authorisation code");
            }
            return Err(Oauth2Failure::new(
                Oauth2Error::InvalidGrant,
                "authorisation code has expired",
            ));
        }

        // The redeeming client must be the issuing client, regardless of
        // whether the code is otherwise valid.
        let Some(client) = token_req.client.as_ref() else {
            security_critical!(
                issued_to = %code.client_id,
                "Authorisation code redemption without an authenticated client"
            );
            return Err(Oauth2Failure::new(
                Oauth2Error::InvalidGrant,
                "authorisation code was issued to a different client",
            ));
        };
        if client.client_id != code.client_id {
            security_critical!(
                issued_to = %code.client_id,
                presented_by = %client.client_id,
                "Authorisation code presented by a different client"
            );
            return Err(Oauth2Failure::new(
                Oauth2Error::InvalidGrant,
                "authorisation code was issued to a different client",
            ));
        }

        // The redirect uri must repeat the original byte for byte. When the
        // authorise request carried none, none may be presented now.
        if token_req.redirect_uri != code.redirect_uri {
            security_info!("Invalid OAuth2 redirect_uri (differs from original request uri)");
            return Err(Oauth2Failure::new(
                Oauth2Error::InvalidGrant,
                "redirect_uri does not match the original authorisation request",
            ));
        }

        match &code.code_challenge {
            Some(code_challenge) => {
                pkce::validate_code_verifier(token_req.code_verifier.as_deref(), code_challenge)?
            }
            None if client.require_pkce => {
                security_error!(
                    client_id = %client.client_id,
                    "No PKCE code challenge present on the code in PKCE enforced mode"
                );
                return Err(Oauth2Failure::new(
                    Oauth2Error::InvalidGrant,
                    "PKCE is required for this client",
                ));
            }
            None if token_req.code_verifier.is_some() => {
                security_info!(
                    "PKCE code verification failed - a code verifier is present, but no code challenge in the authorisation code"
                );
                return Err(Oauth2Failure::new(
                    Oauth2Error::InvalidGrant,
                    "code_verifier was presented but the code carries no code_challenge",
                ));
            }
            None => {}
        }

        // Claims are seeded with the nonce, then enriched by the profile
        // service, then the code's own captured claims. These are all
        // reads - nothing is mutated before the consuming update below.
        let mut claims = BTreeMap::new();
        if let Some(nonce) = &code.nonce {
            claims.insert(
                "nonce".to_string(),
                serde_json::Value::String(nonce.clone()),
            );
        }

        if let Some(subject_id) = code.subject_id {
            let active = self.profile.is_active(subject_id, &code.client_id).await?;
            if !active {
                security_info!(
                    %subject_id,
                    "Subject is no longer active, refusing to redeem the authorisation code"
                );
                return Err(Oauth2Failure::new(
                    Oauth2Error::InvalidGrant,
                    "subject is not active",
                ));
            }

            let profile_req = ProfileDataRequest {
                subject_id,
                client_id: code.client_id.clone(),
                scopes: code.scopes.clone(),
            };
            let profile_data = self.profile.get_profile_data(&profile_req).await?;
            claims.extend(profile_data.claims);
        }

        claims.extend(code.claims.clone());

        // The one-time transition. Exactly one concurrent caller wins; a
        // loser observed a code consumed by someone else - a replay.
        let consumed = self.codes.consume_code(code_value, ct).await?;
        if !consumed {
            security_critical!(
                client_id = %code.client_id,
                session_id = %code.session_id,
                "Authorisation code was consumed concurrently, revoking descendant grants"
            );
            self.revoke_descendant_grants(&code).await;
            return Err(Oauth2Failure::new(
                Oauth2Error::InvalidGrant,
                "authorisation code has already been used",
            ));
        }

        security_access!(
            client_id = %code.client_id,
            session_id = %code.session_id,
            "Authorisation code redeemed"
        );

        Ok(CodeGrantResult {
            subject_id: code.subject_id,
            session_id: code.session_id,
            scopes: code.scopes,
            claims,
        })
    }

    /// Best effort revocation of every persisted grant descending from a
    /// leaked code, and removal of the code itself. Failures are logged and
    /// never mask the `invalid_grant` answer to the caller.
    async fn revoke_descendant_grants(&self, code: &AuthorisationCode) {
        let filter = PersistedGrantFilter {
            subject_id: code.subject_id,
            client_id: Some(code.client_id.clone()),
            session_id: Some(code.session_id),
        };
        if let Err(op_err) = self.grants.remove_all_grants(&filter).await {
            admin_error!(
                ?op_err,
                "Failed to revoke persisted grants for a reused authorisation code"
            );
        }
        if let Err(op_err) = self.codes.remove_code(&code.code).await {
            admin_error!(?op_err, "Failed to remove a reused authorisation code");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idm::oauth2::memory::{
        MemAuthorisationCodeStore, MemPersistedGrantStore, MemProfileService,
    };
    use crate::idm::oauth2::pkce::CodeChallenge;
    use crate::idm::oauth2::store::PersistedGrant;
    use crate::idm::oauth2::GrantType;
    use oxidm_proto::oauth2::CodeChallengeMethod;

    const TEST_CURRENT_TIME: u64 = 6000;

    fn url(s: &str) -> Url {
        Url::parse(s).expect("invalid url")
    }

    fn ct() -> Duration {
        Duration::from_secs(TEST_CURRENT_TIME)
    }

    fn demo_client(client_id: &str, require_pkce: bool) -> Arc<Oauth2Client> {
        Arc::new(Oauth2Client {
            client_id: client_id.to_string(),
            displayname: client_id.to_string(),
            enabled: true,
            grant_types: [GrantType::AuthorisationCode].into(),
            scopes: ["openid".to_string(), "profile".to_string()].into(),
            redirect_uris: vec![url("https://demo.example.com/oauth2/result")],
            post_logout_redirect_uris: Vec::new(),
            require_pkce,
            allow_plain_text_pkce: false,
            require_request_object: false,
            require_pushed_authorisation: false,
        })
    }

    struct TestHarness {
        codes: Arc<MemAuthorisationCodeStore>,
        grants: Arc<MemPersistedGrantStore>,
        profile: Arc<MemProfileService>,
        handler: AuthorisationCodeGrantHandler,
    }

    fn harness() -> TestHarness {
        limning::test_init();
        let codes = Arc::new(MemAuthorisationCodeStore::new());
        let grants = Arc::new(MemPersistedGrantStore::new());
        let profile = Arc::new(MemProfileService::new(true));
        let handler = AuthorisationCodeGrantHandler::new(
            codes.clone(),
            grants.clone(),
            profile.clone(),
        );
        TestHarness {
            codes,
            grants,
            profile,
            handler,
        }
    }

    fn demo_code(subject_id: Option<Uuid>, verifier: Option<&str>) -> AuthorisationCode {
        AuthorisationCode {
            code: AuthorisationCode::generate_code(),
            client_id: "test_resource_server".to_string(),
            subject_id,
            session_id: Uuid::new_v4(),
            redirect_uri: Some(url("https://demo.example.com/oauth2/result")),
            scopes: ["openid".to_string(), "profile".to_string()].into(),
            code_challenge: verifier.map(|verifier| CodeChallenge {
                challenge: pkce::generate_code_challenge(verifier, CodeChallengeMethod::S256),
                method: CodeChallengeMethod::S256,
            }),
            nonce: Some("abcdef".to_string()),
            created_at: TEST_CURRENT_TIME,
            expiry: TEST_CURRENT_TIME + 300,
            is_consumed: false,
            consumed_at: None,
            claims: BTreeMap::new(),
            properties: BTreeMap::new(),
        }
    }

    fn token_req(code: &AuthorisationCode, verifier: Option<&str>) -> AuthorisationCodeTokenRequest {
        AuthorisationCodeTokenRequest {
            client: Some(demo_client("test_resource_server", false)),
            code: Some(code.code.clone()),
            redirect_uri: code.redirect_uri.clone(),
            code_verifier: verifier.map(str::to_string),
        }
    }

    fn assert_invalid_grant(
        result: Result<CodeGrantResult, Oauth2Failure>,
        description_part: &str,
    ) {
        let failure = result.expect_err("redemption unexpectedly succeeded");
        assert_eq!(failure.error, Oauth2Error::InvalidGrant);
        assert!(
            failure.description.contains(description_part),
            "description {:?} does not contain {:?}",
            failure.description,
            description_part
        );
    }

    #[tokio::test]
    async fn test_grant_missing_code() {
        let harness = harness();
        let token_req = AuthorisationCodeTokenRequest {
            client: Some(demo_client("test_resource_server", true)),
            code: None,
            redirect_uri: None,
            code_verifier: None,
        };
        assert_invalid_grant(harness.handler.handle(&token_req, ct()).await, "missing");
    }

    #[tokio::test]
    async fn test_grant_unknown_code() {
        let harness = harness();
        let code = demo_code(Some(Uuid::new_v4()), None);
        // Never stored.
        assert_invalid_grant(
            harness.handler.handle(&token_req(&code, None), ct()).await,
            "invalid",
        );
    }

    #[tokio::test]
    async fn test_grant_expiration_boundary() {
        let harness = harness();

        // Expires five seconds from now - fine.
        let mut code = demo_code(Some(Uuid::new_v4()), None);
        code.expiry = TEST_CURRENT_TIME + 5;
        harness
            .codes
            .store_code(code.clone())
            .await
            .expect("store failed");
        assert!(harness
            .handler
            .handle(&token_req(&code, None), ct())
            .await
            .is_ok());

        // Expired one second ago - refused, and removed from the store.
        let mut code = demo_code(Some(Uuid::new_v4()), None);
        code.expiry = TEST_CURRENT_TIME - 1;
        harness
            .codes
            .store_code(code.clone())
            .await
            .expect("store failed");
        assert_invalid_grant(
            harness.handler.handle(&token_req(&code, None), ct()).await,
            "expired",
        );
        assert!(harness
            .codes
            .get_code(&code.code)
            .await
            .expect("get failed")
            .is_none());
    }

    #[tokio::test]
    async fn test_grant_client_binding() {
        let harness = harness();
        let code = demo_code(Some(Uuid::new_v4()), None);
        harness
            .codes
            .store_code(code.clone())
            .await
            .expect("store failed");

        // A different authenticated client.
        let mut cross_req = token_req(&code, None);
        cross_req.client = Some(demo_client("other_client", true));
        assert_invalid_grant(
            harness.handler.handle(&cross_req, ct()).await,
            "different client",
        );

        // No authenticated client at all.
        let mut anon_req = token_req(&code, None);
        anon_req.client = None;
        assert_invalid_grant(
            harness.handler.handle(&anon_req, ct()).await,
            "different client",
        );

        // The binding check does not consume the code.
        assert!(harness
            .handler
            .handle(&token_req(&code, None), ct())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_grant_redirect_uri_binding() {
        let harness = harness();
        let code = demo_code(Some(Uuid::new_v4()), None);
        harness
            .codes
            .store_code(code.clone())
            .await
            .expect("store failed");

        // Case difference in the path is a different uri.
        let mut req = token_req(&code, None);
        req.redirect_uri = Some(url("https://demo.example.com/OAUTH2/result"));
        assert_invalid_grant(harness.handler.handle(&req, ct()).await, "redirect_uri");

        // Absent on redemption when the original carried one.
        let mut req = token_req(&code, None);
        req.redirect_uri = None;
        assert_invalid_grant(harness.handler.handle(&req, ct()).await, "redirect_uri");

        // Exact match redeems.
        assert!(harness
            .handler
            .handle(&token_req(&code, None), ct())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_grant_redirect_uri_both_absent() {
        let harness = harness();
        // Issued from a request that relied on the registered uri.
        let mut code = demo_code(Some(Uuid::new_v4()), None);
        code.redirect_uri = None;
        harness
            .codes
            .store_code(code.clone())
            .await
            .expect("store failed");

        let mut req = token_req(&code, None);
        req.redirect_uri = None;
        assert!(harness.handler.handle(&req, ct()).await.is_ok());
    }

    #[tokio::test]
    async fn test_grant_pkce_required_and_verified() {
        let harness = harness();

        // The client enforces PKCE but the code carries no challenge.
        let code = demo_code(Some(Uuid::new_v4()), None);
        harness
            .codes
            .store_code(code.clone())
            .await
            .expect("store failed");
        let mut enforced_req = token_req(&code, None);
        enforced_req.client = Some(demo_client("test_resource_server", true));
        assert_invalid_grant(
            harness.handler.handle(&enforced_req, ct()).await,
            "PKCE",
        );

        // Challenge present - wrong verifier refused, right verifier redeems.
        let verifier = pkce::generate_code_verifier();
        let code = demo_code(Some(Uuid::new_v4()), Some(&verifier));
        harness
            .codes
            .store_code(code.clone())
            .await
            .expect("store failed");

        let wrong = pkce::generate_code_verifier();
        assert_invalid_grant(
            harness
                .handler
                .handle(&token_req(&code, Some(&wrong)), ct())
                .await,
            "code_verifier",
        );

        let result = harness
            .handler
            .handle(&token_req(&code, Some(&verifier)), ct())
            .await
            .expect("valid redemption refused");
        assert_eq!(
            result.scopes,
            ["openid".to_string(), "profile".to_string()].into()
        );
    }

    #[tokio::test]
    async fn test_grant_verifier_without_challenge_refused() {
        let harness = harness();
        let code = demo_code(Some(Uuid::new_v4()), None);
        harness
            .codes
            .store_code(code.clone())
            .await
            .expect("store failed");

        let mut req = token_req(&code, Some("a".repeat(43).as_str()));
        req.client = Some(demo_client("test_resource_server", false));
        assert_invalid_grant(harness.handler.handle(&req, ct()).await, "code_verifier");
    }

    #[tokio::test]
    async fn test_grant_subject_liveness() {
        let harness = harness();
        let code = demo_code(Some(Uuid::new_v4()), None);
        harness
            .codes
            .store_code(code.clone())
            .await
            .expect("store failed");

        harness.profile.set_active(false);
        assert_invalid_grant(
            harness.handler.handle(&token_req(&code, None), ct()).await,
            "not active",
        );

        // Codes without a subject skip the liveness check entirely.
        let mut subjectless = demo_code(None, None);
        subjectless.nonce = None;
        harness
            .codes
            .store_code(subjectless.clone())
            .await
            .expect("store failed");
        let result = harness
            .handler
            .handle(&token_req(&subjectless, None), ct())
            .await
            .expect("subjectless code refused");
        assert_eq!(result.subject_id, None);
        assert!(result.claims.is_empty());
    }

    #[tokio::test]
    async fn test_grant_claims_assembly() {
        let harness = harness();
        harness
            .profile
            .set_claim("preferred_username", serde_json::json!("demo_user"));

        let mut code = demo_code(Some(Uuid::new_v4()), None);
        code.claims.insert(
            "department".to_string(),
            serde_json::json!("engineering"),
        );
        harness
            .codes
            .store_code(code.clone())
            .await
            .expect("store failed");

        let result = harness
            .handler
            .handle(&token_req(&code, None), ct())
            .await
            .expect("redemption refused");

        assert_eq!(result.claims.get("nonce"), Some(&serde_json::json!("abcdef")));
        assert_eq!(
            result.claims.get("preferred_username"),
            Some(&serde_json::json!("demo_user"))
        );
        assert_eq!(
            result.claims.get("department"),
            Some(&serde_json::json!("engineering"))
        );
        assert_eq!(result.session_id, code.session_id);
    }

    #[tokio::test]
    async fn test_grant_replay_revokes_descendant_grants() {
        let harness = harness();
        let subject_id = Uuid::new_v4();
        let code = demo_code(Some(subject_id), None);
        harness
            .codes
            .store_code(code.clone())
            .await
            .expect("store failed");

        // Grants issued off the back of this code's session.
        harness.grants.insert_grant(PersistedGrant {
            key: "descendant_refresh".to_string(),
            grant_type: "refresh_token".to_string(),
            subject_id: Some(subject_id),
            client_id: code.client_id.clone(),
            session_id: Some(code.session_id),
            created_at: TEST_CURRENT_TIME,
            expiry: TEST_CURRENT_TIME + 900,
            data: String::new(),
        });
        // An unrelated grant that must survive the cascade.
        harness.grants.insert_grant(PersistedGrant {
            key: "unrelated".to_string(),
            grant_type: "refresh_token".to_string(),
            subject_id: Some(Uuid::new_v4()),
            client_id: "other_client".to_string(),
            session_id: Some(Uuid::new_v4()),
            created_at: TEST_CURRENT_TIME,
            expiry: TEST_CURRENT_TIME + 900,
            data: String::new(),
        });

        // First redemption succeeds.
        assert!(harness
            .handler
            .handle(&token_req(&code, None), ct())
            .await
            .is_ok());
        assert!(harness.grants.contains_grant("descendant_refresh"));

        // The replay is refused, the code is removed, and the descendant
        // grants are revoked.
        assert_invalid_grant(
            harness.handler.handle(&token_req(&code, None), ct()).await,
            "already been used",
        );
        assert!(harness
            .codes
            .get_code(&code.code)
            .await
            .expect("get failed")
            .is_none());
        assert!(!harness.grants.contains_grant("descendant_refresh"));
        assert!(harness.grants.contains_grant("unrelated"));
    }

    #[tokio::test]
    async fn test_grant_end_to_end_code_flow() {
        use crate::idm::oauth2::authorise::AuthoriseRequestValidator;
        use crate::idm::oauth2::scopes::{IdentityResource, ResourceCatalog, ScopeValidator};
        use crate::idm::oauth2::Oauth2ClientRegistry;

        let harness = harness();

        let registry = Oauth2ClientRegistry::new();
        let mut write_txn = registry.write();
        write_txn
            .reload(vec![(*demo_client("test_resource_server", true)).clone()])
            .expect("reload failed");
        write_txn.commit();

        let catalog = ResourceCatalog::new(
            vec![
                IdentityResource {
                    name: "openid".to_string(),
                    claims: ["sub".to_string()].into(),
                },
                IdentityResource {
                    name: "profile".to_string(),
                    claims: ["name".to_string()].into(),
                },
            ],
            Vec::new(),
            Vec::new(),
        );
        let validator = AuthoriseRequestValidator::new(
            Arc::new(registry),
            ScopeValidator::new(Arc::new(catalog)),
        );

        // The authorise leg - code flow, S256 challenge, nonce.
        let verifier = pkce::generate_code_verifier();
        let challenge = pkce::generate_code_challenge(&verifier, CodeChallengeMethod::S256);
        let params: BTreeMap<String, String> = [
            ("client_id", "test_resource_server"),
            ("response_type", "code"),
            ("redirect_uri", "https://demo.example.com/oauth2/result"),
            ("scope", "openid profile"),
            ("state", "123"),
            ("code_challenge", challenge.as_str()),
            ("code_challenge_method", "S256"),
            ("nonce", "abcdef"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let validated = validator
            .validate(&params)
            .await
            .expect("authorise request rejected");

        let subject_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let code = validated.issue_code(Some(subject_id), session_id, BTreeMap::new(), ct());
        harness
            .codes
            .store_code(code.clone())
            .await
            .expect("store failed");

        // The token leg with the matching verifier.
        let mut req = token_req(&code, Some(&verifier));
        req.client = Some(demo_client("test_resource_server", true));
        let result = harness
            .handler
            .handle(&req, ct())
            .await
            .expect("redemption refused");
        assert_eq!(result.subject_id, Some(subject_id));
        assert_eq!(result.session_id, session_id);
        assert_eq!(
            result.scopes,
            ["openid".to_string(), "profile".to_string()].into()
        );
        assert_eq!(result.claims.get("nonce"), Some(&serde_json::json!("abcdef")));

        // A second identical token request is a replay.
        assert_invalid_grant(
            harness.handler.handle(&req, ct()).await,
            "already been used",
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_grant_at_most_once_under_concurrency() {
        let harness = harness();
        let code = demo_code(Some(Uuid::new_v4()), None);
        harness
            .codes
            .store_code(code.clone())
            .await
            .expect("store failed");

        let handler = Arc::new(harness.handler);
        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let handler = handler.clone();
                let req = token_req(&code, None);
                tokio::spawn(async move { handler.handle(&req, ct()).await })
            })
            .collect();

        let results = futures::future::join_all(attempts).await;
        let mut successes = 0;
        for joined in results {
            match joined.expect("redemption task panicked") {
                Ok(_) => successes += 1,
                Err(failure) => assert_eq!(failure.error, Oauth2Error::InvalidGrant),
            }
        }
        assert_eq!(successes, 1);
    }
}
