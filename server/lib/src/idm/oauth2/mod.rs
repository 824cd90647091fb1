//! OAuth2 and OIDC authorisation processing.
//!
//! This contains the in memory and loaded set of registered OAuth2 clients,
//! the validators that decide whether an authorisation request is well formed
//! and permitted, and the grant handler that redeems a one-time authorisation
//! code for a token grant. Token signing, consent UI and client registration
//! are external to this module and are reached through the collaborator
//! traits in [`store`].

use crate::prelude::*;
use concread::cowcell::*;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

pub mod authorise;
pub mod grant;
#[cfg(any(test, feature = "test"))]
pub mod memory;
pub mod pkce;
pub mod redirect;
pub mod scopes;
pub mod store;

pub use oxidm_proto::oauth2::{
    AuthorisationRequest, AuthorisationRequestOidc, CodeChallengeMethod, ErrorResponse,
    PkceRequest, ResponseMode, ResponseType,
};

use self::store::ClientStore;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Oauth2Error {
    InvalidRequest,
    InvalidClient,
    InvalidGrant,
    UnauthorizedClient,
    UnsupportedResponseType,
    InvalidScope,
    ServerError(OperationError),
}

impl fmt::Display for Oauth2Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Oauth2Error::InvalidRequest => "invalid_request",
            Oauth2Error::InvalidClient => "invalid_client",
            Oauth2Error::InvalidGrant => "invalid_grant",
            Oauth2Error::UnauthorizedClient => "unauthorized_client",
            Oauth2Error::UnsupportedResponseType => "unsupported_response_type",
            Oauth2Error::InvalidScope => "invalid_scope",
            Oauth2Error::ServerError(_) => "server_error",
        })
    }
}

/// A protocol-expected validation failure: the wire error kind plus a human
/// readable description. Descriptions exist for diagnostics only and are
/// never parsed by callers.
#[derive(Debug, Clone, PartialEq)]
pub struct Oauth2Failure {
    pub error: Oauth2Error,
    pub description: String,
}

impl Oauth2Failure {
    pub fn new(error: Oauth2Error, description: impl Into<String>) -> Self {
        Oauth2Failure {
            error,
            description: description.into(),
        }
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        ErrorResponse {
            error: self.error.to_string(),
            error_description: Some(self.description.clone()),
            error_uri: None,
        }
    }
}

impl From<OperationError> for Oauth2Failure {
    fn from(op_err: OperationError) -> Self {
        Oauth2Failure {
            error: Oauth2Error::ServerError(op_err),
            description: "internal server error".to_string(),
        }
    }
}

impl fmt::Display for Oauth2Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error, self.description)
    }
}

/// The grant types a client may be permitted to exercise.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    #[serde(rename = "authorization_code")]
    AuthorisationCode,
    Implicit,
    Hybrid,
}

impl fmt::Display for GrantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GrantType::AuthorisationCode => "authorization_code",
            GrantType::Implicit => "implicit",
            GrantType::Hybrid => "hybrid",
        })
    }
}

fn default_enabled() -> bool {
    true
}

/// The registered projection of an OAuth2 client. Supplied by a
/// [`ClientStore`] and never mutated by the validators.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Oauth2Client {
    pub client_id: String,
    #[serde(default)]
    pub displayname: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub grant_types: BTreeSet<GrantType>,
    /// The scopes this client is allowed to request.
    pub scopes: BTreeSet<String>,
    pub redirect_uris: Vec<Url>,
    #[serde(default)]
    pub post_logout_redirect_uris: Vec<Url>,
    #[serde(default)]
    pub require_pkce: bool,
    #[serde(default)]
    pub allow_plain_text_pkce: bool,
    /// Require a JWT-secured request object (JAR) on authorise requests.
    #[serde(default)]
    pub require_request_object: bool,
    /// Require authorise parameters to arrive via the pushed authorisation
    /// endpoint (PAR).
    #[serde(default)]
    pub require_pushed_authorisation: bool,
}

impl Oauth2Client {
    pub fn allows_grant_type(&self, grant_type: GrantType) -> bool {
        self.grant_types.contains(&grant_type)
    }
}

#[derive(Clone)]
struct Oauth2ClientRegistryInner {
    clients: HashMap<String, Arc<Oauth2Client>>,
}

/// The in memory set of registered OAuth2 clients. Reloaded as a whole from
/// configuration, read copy-on-write by request tasks.
pub struct Oauth2ClientRegistry {
    inner: CowCell<Oauth2ClientRegistryInner>,
}

pub struct Oauth2ClientRegistryReadTransaction {
    inner: CowCellReadTxn<Oauth2ClientRegistryInner>,
}

pub struct Oauth2ClientRegistryWriteTransaction<'a> {
    inner: CowCellWriteTxn<'a, Oauth2ClientRegistryInner>,
}

impl Oauth2ClientRegistry {
    pub fn new() -> Self {
        Oauth2ClientRegistry {
            inner: CowCell::new(Oauth2ClientRegistryInner {
                clients: HashMap::new(),
            }),
        }
    }

    pub fn read(&self) -> Oauth2ClientRegistryReadTransaction {
        Oauth2ClientRegistryReadTransaction {
            inner: self.inner.read(),
        }
    }

    pub fn write(&self) -> Oauth2ClientRegistryWriteTransaction<'_> {
        Oauth2ClientRegistryWriteTransaction {
            inner: self.inner.write(),
        }
    }
}

impl Default for Oauth2ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Oauth2ClientRegistryReadTransaction {
    pub fn client_get(&self, client_id: &str) -> Option<Arc<Oauth2Client>> {
        self.inner.clients.get(client_id).cloned()
    }
}

impl Oauth2ClientRegistryWriteTransaction<'_> {
    #[instrument(level = "debug", name = "oauth2::reload", skip_all)]
    pub fn reload(&mut self, value: Vec<Oauth2Client>) -> Result<(), OperationError> {
        let client_set: Result<HashMap<_, _>, _> = value
            .into_iter()
            .map(|client| {
                trace!(client_id = %client.client_id, "Checking OAuth2 client configuration");
                if client.client_id.is_empty() {
                    admin_error!("Invalid OAuth2 client configuration - client_id must not be empty");
                    return Err(OperationError::InvalidValueState);
                }
                if client.redirect_uris.is_empty() {
                    admin_warn!(
                        client_id = %client.client_id,
                        "OAuth2 client has no registered redirect uris - authorise requests will be rejected"
                    );
                }
                Ok((client.client_id.clone(), Arc::new(client)))
            })
            .collect();

        client_set.map(|mut client_set| {
            // Delay getting the inner mut (which may clone) until we know we are ok.
            let inner_ref = self.inner.get_mut();
            // Swap them if we are ok
            std::mem::swap(&mut inner_ref.clients, &mut client_set);
        })
    }

    pub fn commit(self) {
        self.inner.commit();
    }
}

#[async_trait::async_trait]
impl ClientStore for Oauth2ClientRegistry {
    async fn find_client_by_id(
        &self,
        client_id: &str,
    ) -> Result<Option<Arc<Oauth2Client>>, OperationError> {
        Ok(self.read().client_get(client_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn demo_client(client_id: &str) -> Oauth2Client {
        Oauth2Client {
            client_id: client_id.to_string(),
            displayname: client_id.to_string(),
            enabled: true,
            grant_types: [GrantType::AuthorisationCode].into(),
            scopes: [OAUTH2_SCOPE_OPENID.to_string()].into(),
            redirect_uris: vec![
                Url::parse("https://demo.example.com/oauth2/result").expect("invalid url")
            ],
            post_logout_redirect_uris: Vec::new(),
            require_pkce: true,
            allow_plain_text_pkce: false,
            require_request_object: false,
            require_pushed_authorisation: false,
        }
    }

    #[test]
    fn test_oauth2_error_wire_strings() {
        assert_eq!(Oauth2Error::InvalidRequest.to_string(), "invalid_request");
        assert_eq!(Oauth2Error::InvalidClient.to_string(), "invalid_client");
        assert_eq!(Oauth2Error::InvalidGrant.to_string(), "invalid_grant");
        assert_eq!(
            Oauth2Error::UnauthorizedClient.to_string(),
            "unauthorized_client"
        );
        assert_eq!(
            Oauth2Error::UnsupportedResponseType.to_string(),
            "unsupported_response_type"
        );
        assert_eq!(Oauth2Error::InvalidScope.to_string(), "invalid_scope");
        assert_eq!(
            Oauth2Error::ServerError(OperationError::Backend).to_string(),
            "server_error"
        );
    }

    #[test]
    fn test_registry_reload_and_lookup() {
        limning::test_init();
        let registry = Oauth2ClientRegistry::new();

        let mut write_txn = registry.write();
        write_txn
            .reload(vec![demo_client("test_resource_server")])
            .expect("reload failed");
        write_txn.commit();

        let read_txn = registry.read();
        let client = read_txn
            .client_get("test_resource_server")
            .expect("client missing");
        assert!(client.enabled);
        assert!(read_txn.client_get("missing").is_none());

        // Lookups are case sensitive over the registered id.
        assert!(read_txn.client_get("Test_Resource_Server").is_none());
    }

    #[test]
    fn test_registry_reload_rejects_empty_client_id() {
        limning::test_init();
        let registry = Oauth2ClientRegistry::new();
        let mut write_txn = registry.write();
        let result = write_txn.reload(vec![demo_client("")]);
        assert_eq!(result, Err(OperationError::InvalidValueState));
    }
}
