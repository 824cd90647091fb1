//! Constants shared between the server and its protocol surfaces.

/// Scopes with defined OIDC semantics.
pub const OAUTH2_SCOPE_OPENID: &str = "openid";
pub const OAUTH2_SCOPE_PROFILE: &str = "profile";
pub const OAUTH2_SCOPE_EMAIL: &str = "email";
pub const OAUTH2_SCOPE_ADDRESS: &str = "address";
pub const OAUTH2_SCOPE_PHONE: &str = "phone";
pub const OAUTH2_SCOPE_OFFLINE_ACCESS: &str = "offline_access";

/// The urn prefix that a pushed authorisation request reference must carry
/// in its `request_uri` parameter.
/// Ref <https://www.rfc-editor.org/rfc/rfc9126#section-2.2>
pub const OAUTH2_PAR_REQUEST_URI_PREFIX: &str = "urn:ietf:params:oauth:request_uri:";

/// How many seconds an issued authorisation code is valid for.
pub const OAUTH2_AUTHZ_CODE_EXPIRY_SECONDS: u64 = 300;

/// OAuth2 / OIDC authorise endpoint parameter names.
pub const OAUTH2_PARAM_CLIENT_ID: &str = "client_id";
pub const OAUTH2_PARAM_REDIRECT_URI: &str = "redirect_uri";
pub const OAUTH2_PARAM_RESPONSE_TYPE: &str = "response_type";
pub const OAUTH2_PARAM_RESPONSE_MODE: &str = "response_mode";
pub const OAUTH2_PARAM_SCOPE: &str = "scope";
pub const OAUTH2_PARAM_STATE: &str = "state";
pub const OAUTH2_PARAM_CODE_CHALLENGE: &str = "code_challenge";
pub const OAUTH2_PARAM_CODE_CHALLENGE_METHOD: &str = "code_challenge_method";
pub const OAUTH2_PARAM_NONCE: &str = "nonce";
pub const OAUTH2_PARAM_PROMPT: &str = "prompt";
pub const OAUTH2_PARAM_MAX_AGE: &str = "max_age";
pub const OAUTH2_PARAM_UI_LOCALES: &str = "ui_locales";
pub const OAUTH2_PARAM_ID_TOKEN_HINT: &str = "id_token_hint";
pub const OAUTH2_PARAM_LOGIN_HINT: &str = "login_hint";
pub const OAUTH2_PARAM_ACR_VALUES: &str = "acr_values";
pub const OAUTH2_PARAM_REQUEST: &str = "request";
pub const OAUTH2_PARAM_REQUEST_URI: &str = "request_uri";
pub const OAUTH2_PARAM_RESOURCE: &str = "resource";
