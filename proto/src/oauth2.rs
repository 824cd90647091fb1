//! Oauth2 RFC protocol definitions.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_with::formats::SpaceSeparator;
use serde_with::{rust::deserialize_ignore_any, serde_as, skip_serializing_none, StringWithSeparator};
use url::Url;

use crate::constants::*;

/// A single token kind that may appear in the space separated
/// `response_type` parameter.
/// Ref <https://openid.net/specs/oauth-v2-multiple-response-types-1_0.html>
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    // Auth Code flow
    // https://datatracker.ietf.org/doc/html/rfc6749#section-4.1.1
    Code,
    // Implicit Grant flow
    // https://datatracker.ietf.org/doc/html/rfc6749#section-4.2.1
    Token,
    // https://openid.net/specs/oauth-v2-multiple-response-types-1_0.html#id_token
    IdToken,
}

impl FromStr for ResponseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code" => Ok(ResponseType::Code),
            "token" => Ok(ResponseType::Token),
            "id_token" => Ok(ResponseType::IdToken),
            _ => Err(format!("Unknown response_type: {s}")),
        }
    }
}

impl fmt::Display for ResponseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResponseType::Code => "code",
            ResponseType::Token => "token",
            ResponseType::IdToken => "id_token",
        })
    }
}

impl ResponseType {
    /// Parse a raw space separated `response_type` value into the set of
    /// requested token kinds. `None` if any requested kind is unknown -
    /// the combination can never be supported.
    pub fn parse_set(raw: &str) -> Option<BTreeSet<ResponseType>> {
        raw.split_whitespace()
            .map(|tok| ResponseType::from_str(tok).ok())
            .collect()
    }
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    Query,
    Fragment,
    FormPost,
    #[serde(other, deserialize_with = "deserialize_ignore_any")]
    Invalid,
}

impl FromStr for ResponseMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "query" => ResponseMode::Query,
            "fragment" => ResponseMode::Fragment,
            "form_post" => ResponseMode::FormPost,
            _ => ResponseMode::Invalid,
        })
    }
}

/// PKCE challenge transformation methods.
/// Ref <https://www.rfc-editor.org/rfc/rfc7636#section-4.2>
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CodeChallengeMethod {
    // BASE64URL-ENCODE(SHA256(ASCII(code_verifier)))
    S256,
    // The verifier is the challenge. Defaulted when the parameter is absent.
    #[default]
    #[serde(rename = "plain")]
    Plain,
}

impl FromStr for CodeChallengeMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "S256" => Ok(CodeChallengeMethod::S256),
            "plain" => Ok(CodeChallengeMethod::Plain),
            _ => Err(format!("Unknown code_challenge_method: {s}")),
        }
    }
}

impl fmt::Display for CodeChallengeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CodeChallengeMethod::S256 => "S256",
            CodeChallengeMethod::Plain => "plain",
        })
    }
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PkceRequest {
    /// The challenge exactly as presented on the wire. Charset and length
    /// rules apply to this encoded form.
    pub code_challenge: String,
    pub code_challenge_method: Option<CodeChallengeMethod>,
}

/// An OAuth2 client redirects to the authorisation server with Authorisation
/// Request parameters.
#[serde_as]
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuthorisationRequest {
    pub client_id: String,
    /// Space separated token kinds. Kept raw so that unknown kinds surface
    /// as `unsupported_response_type` during validation rather than as a
    /// deserialisation fault.
    #[serde(default)]
    pub response_type: String,
    /// Optional; defaults to `query` for the code flow and `fragment` when
    /// the response carries tokens.
    ///
    /// Reference:
    /// [OAuth 2.0 Multiple Response Type Encoding Practices: Response Modes](https://openid.net/specs/oauth-v2-multiple-response-types-1_0.html#ResponseModes)
    pub response_mode: Option<ResponseMode>,
    pub redirect_uri: Option<Url>,
    #[serde_as(as = "StringWithSeparator::<SpaceSeparator, String>")]
    #[serde(default)]
    pub scope: BTreeSet<String>,
    pub state: Option<String>,
    #[serde(flatten)]
    pub pkce_request: Option<PkceRequest>,
    // OIDC adds a nonce parameter that is optional.
    pub nonce: Option<String>,
    // OIDC also allows other optional params
    #[serde(flatten)]
    pub oidc_ext: AuthorisationRequestOidc,
    // Needs to be hoisted here due to serde flatten bug #3185
    pub max_age: Option<i64>,
    /// A JWT-secured authorisation request object carried by value.
    pub request: Option<String>,
    /// A reference to a request object, either a remote uri or a pushed
    /// authorisation request urn.
    pub request_uri: Option<String>,
    /// Resource indicator, carried verbatim.
    /// Ref <https://www.rfc-editor.org/rfc/rfc8707>
    pub resource: Option<String>,
    #[serde(flatten)]
    pub unknown_keys: BTreeMap<String, serde_json::value::Value>,
}

/// An OIDC client redirects to the authorisation server with Authorisation
/// Request parameters.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct AuthorisationRequestOidc {
    pub display: Option<String>,
    pub prompt: Option<String>,
    pub ui_locales: Option<String>,
    pub claims_locales: Option<String>,
    pub id_token_hint: Option<String>,
    pub login_hint: Option<String>,
    pub acr_values: Option<String>,
}

impl AuthorisationRequest {
    /// Assemble a request from a raw parameter map, as received by the
    /// authorise endpoint. Only shape errors are rejected here (a relative
    /// redirect uri, an unparseable max_age) - semantic validation belongs
    /// to the authorise request validator.
    pub fn from_params(params: &BTreeMap<String, String>) -> Result<Self, String> {
        let get = |k: &str| params.get(k).filter(|v| !v.is_empty()).cloned();

        let redirect_uri = match get(OAUTH2_PARAM_REDIRECT_URI) {
            Some(raw) => Some(
                Url::parse(&raw)
                    .map_err(|_| format!("redirect_uri is not an absolute uri: {raw}"))?,
            ),
            None => None,
        };

        let max_age = match get(OAUTH2_PARAM_MAX_AGE) {
            Some(raw) => Some(
                raw.parse::<i64>()
                    .map_err(|_| format!("max_age is not an integer: {raw}"))?,
            ),
            None => None,
        };

        let response_mode = get(OAUTH2_PARAM_RESPONSE_MODE)
            // FromStr for ResponseMode is total - unknown becomes Invalid.
            .and_then(|raw| ResponseMode::from_str(&raw).ok());

        let pkce_request = get(OAUTH2_PARAM_CODE_CHALLENGE).map(|code_challenge| -> Result<PkceRequest, String> {
            Ok(PkceRequest {
                code_challenge,
                code_challenge_method: match get(OAUTH2_PARAM_CODE_CHALLENGE_METHOD) {
                    Some(raw) => Some(CodeChallengeMethod::from_str(&raw)?),
                    None => None,
                },
            })
        });
        let pkce_request = pkce_request.transpose()?;

        let scope = get(OAUTH2_PARAM_SCOPE)
            .map(|raw| {
                raw.split_whitespace()
                    .map(str::to_string)
                    .collect::<BTreeSet<_>>()
            })
            .unwrap_or_default();

        let known = |k: &str| {
            matches!(
                k,
                OAUTH2_PARAM_CLIENT_ID
                    | OAUTH2_PARAM_REDIRECT_URI
                    | OAUTH2_PARAM_RESPONSE_TYPE
                    | OAUTH2_PARAM_RESPONSE_MODE
                    | OAUTH2_PARAM_SCOPE
                    | OAUTH2_PARAM_STATE
                    | OAUTH2_PARAM_CODE_CHALLENGE
                    | OAUTH2_PARAM_CODE_CHALLENGE_METHOD
                    | OAUTH2_PARAM_NONCE
                    | OAUTH2_PARAM_PROMPT
                    | OAUTH2_PARAM_MAX_AGE
                    | OAUTH2_PARAM_UI_LOCALES
                    | OAUTH2_PARAM_ID_TOKEN_HINT
                    | OAUTH2_PARAM_LOGIN_HINT
                    | OAUTH2_PARAM_ACR_VALUES
                    | OAUTH2_PARAM_REQUEST
                    | OAUTH2_PARAM_REQUEST_URI
                    | OAUTH2_PARAM_RESOURCE
                    | "display"
                    | "claims_locales"
            )
        };

        let unknown_keys = params
            .iter()
            .filter(|(k, _)| !known(k.as_str()))
            .map(|(k, v)| (k.clone(), serde_json::value::Value::String(v.clone())))
            .collect();

        Ok(AuthorisationRequest {
            client_id: get(OAUTH2_PARAM_CLIENT_ID).unwrap_or_default(),
            response_type: get(OAUTH2_PARAM_RESPONSE_TYPE).unwrap_or_default(),
            response_mode,
            redirect_uri,
            scope,
            state: get(OAUTH2_PARAM_STATE),
            pkce_request,
            nonce: get(OAUTH2_PARAM_NONCE),
            oidc_ext: AuthorisationRequestOidc {
                display: get("display"),
                prompt: get(OAUTH2_PARAM_PROMPT),
                ui_locales: get(OAUTH2_PARAM_UI_LOCALES),
                claims_locales: get("claims_locales"),
                id_token_hint: get(OAUTH2_PARAM_ID_TOKEN_HINT),
                login_hint: get(OAUTH2_PARAM_LOGIN_HINT),
                acr_values: get(OAUTH2_PARAM_ACR_VALUES),
            },
            max_age,
            request: get(OAUTH2_PARAM_REQUEST),
            request_uri: get(OAUTH2_PARAM_REQUEST_URI),
            resource: get(OAUTH2_PARAM_RESOURCE),
            unknown_keys,
        })
    }
}

/// Merge the query and form parameter sets of an authorise request. Form
/// parameters override query parameters of the same name.
pub fn merge_params(
    query: &[(String, String)],
    form: &[(String, String)],
) -> BTreeMap<String, String> {
    query
        .iter()
        .chain(form.iter())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "grant_type", rename_all = "snake_case")]
pub enum GrantTypeReq {
    AuthorizationCode {
        // As issued by the authorise flow.
        code: String,
        // Must be the same as the original redirect uri, when one was sent.
        redirect_uri: Option<Url>,
        code_verifier: Option<String>,
    },
}

/// An Access Token request. This requires a set of grant-type parameters to
/// satisfy the request.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug)]
pub struct AccessTokenRequest {
    #[serde(flatten)]
    pub grant_type: GrantTypeReq,
    // REQUIRED, if the client is not authenticating with the
    //  authorization server as described in Section 3.2.1.
    #[serde(flatten)]
    pub client_post_auth: ClientPostAuth,
}

impl From<GrantTypeReq> for AccessTokenRequest {
    fn from(req: GrantTypeReq) -> AccessTokenRequest {
        AccessTokenRequest {
            grant_type: req,
            client_post_auth: ClientPostAuth::default(),
        }
    }
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Default)]
/// <https://datatracker.ietf.org/doc/html/rfc6749#section-2.3.1>
pub struct ClientPostAuth {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// The error body returned by the authorise and token endpoints.
/// HTTP 400 for client errors, 401 for authentication failures at the
/// token endpoint.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct ErrorResponse {
    pub error: String,
    pub error_description: Option<String>,
    pub error_uri: Option<Url>,
}
