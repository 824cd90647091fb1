//! Authorise request validation.
//!
//! A request is processed in a fixed order of short circuiting steps. The
//! watershed is redirect uri validation: until the requested redirect uri is
//! confirmed against the client's registered set, errors must be shown to
//! the end user directly and never delivered through the uri. Once it is
//! confirmed, errors may travel back to the client as `error` /
//! `error_description` on the redirect.
//!
//! /*
//!  * 4.1.2.1.  Error Response
//!  *
//!  * If the request fails due to a missing, invalid, or mismatching
//!  * redirection URI, or if the client identifier is missing or invalid,
//!  * the authorization server SHOULD inform the resource owner of the
//!  * error and MUST NOT automatically redirect the user-agent to the
//!  * invalid redirection URI.
//!  */

use crate::idm::oauth2::pkce::{self, CodeChallenge};
use crate::idm::oauth2::redirect::validate_redirect_uri;
use crate::idm::oauth2::scopes::{ScopeValidationResult, ScopeValidator};
use crate::idm::oauth2::store::{AuthorisationCode, ClientStore};
use crate::idm::oauth2::{
    AuthorisationRequest, GrantType, Oauth2Client, Oauth2Error, Oauth2Failure, ResponseMode,
    ResponseType,
};
use crate::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// The flow selected by the `response_type` combination. The mapping is a
/// closed set - anything else is `unsupported_response_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthoriseFlow {
    Code,
    Implicit,
    Hybrid,
}

impl AuthoriseFlow {
    /// Map a requested response type set onto a flow. `None` when the
    /// combination is not one we can ever serve.
    pub fn resolve(response_types: &BTreeSet<ResponseType>) -> Option<AuthoriseFlow> {
        let code = response_types.contains(&ResponseType::Code);
        let token = response_types.contains(&ResponseType::Token);
        let id_token = response_types.contains(&ResponseType::IdToken);

        match (code, token, id_token) {
            (true, false, false) => Some(AuthoriseFlow::Code),
            (true, true, false) | (true, false, true) | (true, true, true) => {
                Some(AuthoriseFlow::Hybrid)
            }
            (false, true, false) | (false, false, true) | (false, true, true) => {
                Some(AuthoriseFlow::Implicit)
            }
            (false, false, false) => None,
        }
    }

    /// The grant type the client must be permitted for this flow.
    pub fn required_grant_type(self) -> GrantType {
        match self {
            AuthoriseFlow::Code => GrantType::AuthorisationCode,
            AuthoriseFlow::Implicit => GrantType::Implicit,
            AuthoriseFlow::Hybrid => GrantType::Hybrid,
        }
    }

    pub fn is_implicit_or_hybrid(self) -> bool {
        !matches!(self, AuthoriseFlow::Code)
    }
}

// The response modes we are actually able to encode.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupportedResponseMode {
    Query,
    Fragment,
}

fn resolve_response_mode(
    requested: Option<ResponseMode>,
    flow: AuthoriseFlow,
) -> Result<SupportedResponseMode, Oauth2Failure> {
    let flow_default = if flow.is_implicit_or_hybrid() {
        // Token-bearing responses must never be query encoded.
        SupportedResponseMode::Fragment
    } else {
        SupportedResponseMode::Query
    };

    match requested {
        None => Ok(flow_default),
        Some(ResponseMode::Query) => {
            if flow.is_implicit_or_hybrid() {
                warn!("response_mode=query is not permitted when tokens are returned on the front channel");
                Err(Oauth2Failure::new(
                    Oauth2Error::InvalidRequest,
                    "response_mode query is not permitted for this response_type",
                ))
            } else {
                Ok(SupportedResponseMode::Query)
            }
        }
        Some(ResponseMode::Fragment) => Ok(SupportedResponseMode::Fragment),
        Some(ResponseMode::FormPost) => {
            warn!(
                "Invalid response mode form_post requested - many clients request this incorrectly but proceed anyway. Remapping to the flow default."
            );
            warn!("This behaviour WILL BE REMOVED in a future release.");
            Ok(flow_default)
        }
        Some(ResponseMode::Invalid) => {
            warn!("Invalid response mode requested, unable to proceed");
            Err(Oauth2Failure::new(
                Oauth2Error::InvalidRequest,
                "response_mode is not supported",
            ))
        }
    }
}

/// A fully validated authorise request. Immutable once constructed -
/// downstream consumers (consent, code issuance) read from it only.
#[derive(Debug, Clone)]
pub struct ValidatedAuthoriseRequest {
    pub client: Arc<Oauth2Client>,
    pub response_types: BTreeSet<ResponseType>,
    pub flow: AuthoriseFlow,
    /// The confirmed uri the response will be delivered through.
    pub redirect_uri: Url,
    /// The redirect uri exactly as requested - absent when the request
    /// relied on the client's single registered uri. Stored against the
    /// issued code for redemption binding.
    pub requested_redirect_uri: Option<Url>,
    pub scopes: ScopeValidationResult,
    pub code_challenge: Option<CodeChallenge>,
    pub nonce: Option<String>,
    pub state: Option<String>,
    pub response_mode: SupportedResponseMode,
    pub prompt: Option<String>,
    pub max_age: Option<i64>,
    pub ui_locales: Option<String>,
    pub id_token_hint: Option<String>,
    pub login_hint: Option<String>,
    pub acr_values: Option<String>,
    pub resource: Option<String>,
}

impl ValidatedAuthoriseRequest {
    /// Mint an authorisation code for this request after the subject has
    /// authenticated and consented. Persisting it is the caller's concern.
    pub fn issue_code(
        &self,
        subject_id: Option<Uuid>,
        session_id: Uuid,
        claims: BTreeMap<String, serde_json::Value>,
        ct: Duration,
    ) -> AuthorisationCode {
        AuthorisationCode {
            code: AuthorisationCode::generate_code(),
            client_id: self.client.client_id.clone(),
            subject_id,
            session_id,
            redirect_uri: self.requested_redirect_uri.clone(),
            scopes: self.scopes.valid_scopes.clone(),
            code_challenge: self.code_challenge.clone(),
            nonce: self.nonce.clone(),
            created_at: ct.as_secs(),
            expiry: ct.as_secs() + OAUTH2_AUTHZ_CODE_EXPIRY_SECONDS,
            is_consumed: false,
            consumed_at: None,
            claims,
            properties: BTreeMap::new(),
        }
    }
}

/// A failed authorise request, split by the redirect watershed.
#[derive(Debug)]
pub enum AuthoriseError {
    /// Detected before the redirect uri was confirmed. Must be rendered to
    /// the end user directly - never redirect.
    Direct(Oauth2Failure),
    /// Detected after the redirect uri was confirmed. May be delivered to
    /// the client through the redirect.
    Redirect {
        failure: Oauth2Failure,
        redirect_uri: Url,
        state: Option<String>,
        response_mode: SupportedResponseMode,
    },
}

impl AuthoriseError {
    pub fn failure(&self) -> &Oauth2Failure {
        match self {
            AuthoriseError::Direct(failure) => failure,
            AuthoriseError::Redirect { failure, .. } => failure,
        }
    }

    /// Builds a redirect URI delivering the error back to the application,
    /// when the watershed allows it.
    pub fn build_redirect_uri(&self) -> Option<Url> {
        let AuthoriseError::Redirect {
            failure,
            redirect_uri,
            state,
            response_mode,
        } = self
        else {
            return None;
        };

        let mut redirect_uri = redirect_uri.clone();
        // Always clear the fragment per RFC
        redirect_uri.set_fragment(None);

        match response_mode {
            SupportedResponseMode::Query => {
                {
                    let mut qp = redirect_uri.query_pairs_mut();
                    qp.append_pair("error", &failure.error.to_string());
                    qp.append_pair("error_description", &failure.description);
                    if let Some(state) = state.as_ref() {
                        qp.append_pair("state", state);
                    }
                }
                Some(redirect_uri)
            }
            SupportedResponseMode::Fragment => {
                redirect_uri.set_query(None);

                // We can't set query pairs on fragments, only query.
                let mut uri_builder = url::form_urlencoded::Serializer::new(String::new());
                uri_builder.append_pair("error", &failure.error.to_string());
                uri_builder.append_pair("error_description", &failure.description);
                if let Some(state) = state.as_ref() {
                    uri_builder.append_pair("state", state);
                }
                let encoded = uri_builder.finish();

                redirect_uri.set_fragment(Some(&encoded));
                Some(redirect_uri)
            }
        }
    }
}

/// Validates authorise requests against the registered client set and the
/// resource catalog. Stateless between requests - every durable input comes
/// through the injected stores.
pub struct AuthoriseRequestValidator {
    clients: Arc<dyn ClientStore>,
    scopes: ScopeValidator,
}

impl AuthoriseRequestValidator {
    pub fn new(clients: Arc<dyn ClientStore>, scopes: ScopeValidator) -> Self {
        AuthoriseRequestValidator { clients, scopes }
    }

    /// Validate a raw parameter map, as received by the authorise endpoint.
    #[instrument(level = "debug", skip_all)]
    pub async fn validate(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<ValidatedAuthoriseRequest, AuthoriseError> {
        let auth_req = AuthorisationRequest::from_params(params).map_err(|err_desc| {
            request_error!(%err_desc, "Malformed authorisation request");
            AuthoriseError::Direct(Oauth2Failure::new(Oauth2Error::InvalidRequest, err_desc))
        })?;
        self.validate_request(&auth_req).await
    }

    /// Validate an already parsed request. Applies the same rules as
    /// [`Self::validate`] minus the raw parameter parsing - used when
    /// replaying a pushed authorisation payload.
    #[instrument(level = "debug", skip_all)]
    pub async fn validate_request(
        &self,
        auth_req: &AuthorisationRequest,
    ) -> Result<ValidatedAuthoriseRequest, AuthoriseError> {
        trace!(?auth_req);

        // Step 1 - the client must exist and be enabled. Nothing can be
        // validated without its registration.
        if auth_req.client_id.is_empty() {
            request_warn!("Authorisation request is missing client_id");
            return Err(AuthoriseError::Direct(Oauth2Failure::new(
                Oauth2Error::InvalidRequest,
                "client_id is required",
            )));
        }

        let client = self
            .clients
            .find_client_by_id(&auth_req.client_id)
            .await
            .map_err(|op_err| {
                admin_error!(?op_err, "Client lookup failed");
                AuthoriseError::Direct(Oauth2Failure::from(op_err))
            })?
            .ok_or_else(|| {
                admin_warn!(
                    "Invalid OAuth2 client_id ({}) Have you configured the OAuth2 client?",
                    &auth_req.client_id
                );
                AuthoriseError::Direct(Oauth2Failure::new(
                    Oauth2Error::InvalidClient,
                    "unknown client",
                ))
            })?;

        if !client.enabled {
            admin_warn!(client_id = %client.client_id, "OAuth2 client is disabled");
            return Err(AuthoriseError::Direct(Oauth2Failure::new(
                Oauth2Error::InvalidClient,
                "client is disabled",
            )));
        }

        // Step 2 - clients locked to pushed authorisation must arrive via a
        // PAR reference, never loose query parameters.
        if client.require_pushed_authorisation {
            let via_par = auth_req
                .request_uri
                .as_deref()
                .is_some_and(|uri| uri.starts_with(OAUTH2_PAR_REQUEST_URI_PREFIX));
            if !via_par {
                security_info!(client_id = %client.client_id,
                    "Client requires pushed authorisation but the request did not arrive via PAR");
                return Err(AuthoriseError::Direct(Oauth2Failure::new(
                    Oauth2Error::InvalidRequest,
                    "this client must submit requests via the pushed authorisation endpoint",
                )));
            }
        }

        // Step 3 - when no redirect uri was sent and exactly one is
        // registered, default to it.
        let requested_redirect_uri = auth_req.redirect_uri.clone();
        let resolved_redirect_uri = match requested_redirect_uri.clone() {
            Some(redirect_uri) => Some(redirect_uri),
            None if client.redirect_uris.len() == 1 => {
                debug!("Defaulting redirect_uri to the single registered uri");
                client.redirect_uris.first().cloned()
            }
            None => None,
        };

        // Step 4 - the response type combination selects the flow, and the
        // flow must be within the client's allowed grant types.
        if auth_req.response_type.trim().is_empty() {
            request_warn!("Authorisation request is missing response_type");
            return Err(AuthoriseError::Direct(Oauth2Failure::new(
                Oauth2Error::InvalidRequest,
                "response_type is required",
            )));
        }

        let Some(response_types) = ResponseType::parse_set(&auth_req.response_type) else {
            admin_warn!(
                response_type = %auth_req.response_type,
                "Unsupported OAuth2 response_type"
            );
            return Err(AuthoriseError::Direct(Oauth2Failure::new(
                Oauth2Error::UnsupportedResponseType,
                "response_type is not supported",
            )));
        };

        let Some(flow) = AuthoriseFlow::resolve(&response_types) else {
            admin_warn!(
                response_type = %auth_req.response_type,
                "Unsupported OAuth2 response_type combination"
            );
            return Err(AuthoriseError::Direct(Oauth2Failure::new(
                Oauth2Error::UnsupportedResponseType,
                "response_type combination is not supported",
            )));
        };

        let required_grant_type = flow.required_grant_type();
        if !client.allows_grant_type(required_grant_type) {
            security_info!(
                client_id = %client.client_id,
                %required_grant_type,
                "Client is not authorised for the requested grant type"
            );
            return Err(AuthoriseError::Direct(Oauth2Failure::new(
                Oauth2Error::UnauthorizedClient,
                format!("client is not authorised for the {required_grant_type} grant"),
            )));
        }

        let response_mode = resolve_response_mode(auth_req.response_mode, flow)
            .map_err(AuthoriseError::Direct)?;

        // Step 5 - the validation watershed. Once the redirect uri is
        // confirmed, errors become deliverable through it.
        let redirect_uri = validate_redirect_uri(
            resolved_redirect_uri.as_ref(),
            &client.redirect_uris,
            flow.is_implicit_or_hybrid(),
        )
        .map_err(AuthoriseError::Direct)?;

        let redirectable = |failure: Oauth2Failure| AuthoriseError::Redirect {
            failure,
            redirect_uri: redirect_uri.clone(),
            state: auth_req.state.clone(),
            response_mode,
        };

        // Step 6 - scopes.
        if auth_req.scope.is_empty() {
            admin_error!("Invalid OAuth2 request - must contain at least one requested scope");
            return Err(redirectable(Oauth2Failure::new(
                Oauth2Error::InvalidRequest,
                "at least one scope must be requested",
            )));
        }

        let scopes = self
            .scopes
            .validate(&auth_req.scope, &client.scopes)
            .map_err(&redirectable)?;

        // Step 7 - PKCE. Mandatory when the response includes a code and
        // the client enforces it.
        let pkce_required = response_types.contains(&ResponseType::Code) && client.require_pkce;
        let code_challenge = pkce::validate_code_challenge(
            auth_req
                .pkce_request
                .as_ref()
                .map(|pkce_request| pkce_request.code_challenge.as_str()),
            auth_req
                .pkce_request
                .as_ref()
                .and_then(|pkce_request| pkce_request.code_challenge_method),
            pkce_required,
            client.allow_plain_text_pkce,
        )
        .map_err(&redirectable)?;

        // Step 8 - a nonce binds the id_token to this request.
        if response_types.contains(&ResponseType::IdToken) && auth_req.nonce.is_none() {
            security_info!("Missing nonce on a request returning an id_token");
            return Err(redirectable(Oauth2Failure::new(
                Oauth2Error::InvalidRequest,
                "nonce is required when response_type includes id_token",
            )));
        }

        // Step 9 - JAR enforcement.
        if client.require_request_object
            && auth_req.request.is_none()
            && auth_req.request_uri.is_none()
        {
            security_info!(client_id = %client.client_id,
                "Client requires a signed request object but none was provided");
            return Err(redirectable(Oauth2Failure::new(
                Oauth2Error::InvalidRequest,
                "a signed request object is required for this client",
            )));
        }

        // Step 10 - remaining parameters travel verbatim.
        Ok(ValidatedAuthoriseRequest {
            client,
            response_types,
            flow,
            redirect_uri,
            requested_redirect_uri,
            scopes,
            code_challenge,
            nonce: auth_req.nonce.clone(),
            state: auth_req.state.clone(),
            response_mode,
            prompt: auth_req.oidc_ext.prompt.clone(),
            max_age: auth_req.max_age,
            ui_locales: auth_req.oidc_ext.ui_locales.clone(),
            id_token_hint: auth_req.oidc_ext.id_token_hint.clone(),
            login_hint: auth_req.oidc_ext.login_hint.clone(),
            acr_values: auth_req.oidc_ext.acr_values.clone(),
            resource: auth_req.resource.clone(),
        })
    }
}
