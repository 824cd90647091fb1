//! Proof Key for Code Exchange (RFC 7636). Stateless validation of
//! challenge/verifier pairs, and generation helpers for relying party
//! tooling. The challenge is validated in its encoded form at authorise
//! time; the verifier is checked against the stored challenge at
//! redemption with a constant time comparison.

use crate::idm::oauth2::{Oauth2Error, Oauth2Failure};
use crate::prelude::*;
use base64::{engine::general_purpose, Engine as _};
use openssl::{memcmp, sha};
use oxidm_proto::oauth2::CodeChallengeMethod;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Ref <https://www.rfc-editor.org/rfc/rfc7636#section-4.1>
pub const PKCE_MIN_LEN: usize = 43;
pub const PKCE_MAX_LEN: usize = 128;

/// A validated code challenge, stored against the authorisation code until
/// redemption.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CodeChallenge {
    pub challenge: String,
    pub method: CodeChallengeMethod,
}

// The challenge is base64url output: A-Z a-z 0-9 - _
fn challenge_char_valid(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_')
}

// The verifier uses the unreserved uri charset: A-Z a-z 0-9 - . _ ~
fn verifier_char_valid(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')
}

/// Validate the `code_challenge`/`code_challenge_method` parameters of an
/// authorise request. The method defaults to `plain` when absent, and
/// `plain` is refused unless the client explicitly allows it.
pub fn validate_code_challenge(
    challenge: Option<&str>,
    method: Option<CodeChallengeMethod>,
    required: bool,
    allow_plain_text: bool,
) -> Result<Option<CodeChallenge>, Oauth2Failure> {
    let challenge = match challenge.filter(|c| !c.is_empty()) {
        Some(challenge) => challenge,
        None => {
            if required {
                security_error!("No PKCE code challenge was provided with client in enforced PKCE mode");
                return Err(Oauth2Failure::new(
                    Oauth2Error::InvalidRequest,
                    "code_challenge is required",
                ));
            }
            return Ok(None);
        }
    };

    if challenge.len() < PKCE_MIN_LEN || challenge.len() > PKCE_MAX_LEN {
        security_info!("Invalid PKCE code challenge length");
        return Err(Oauth2Failure::new(
            Oauth2Error::InvalidRequest,
            "code_challenge must be between 43 and 128 characters",
        ));
    }

    if !challenge.chars().all(challenge_char_valid) {
        security_info!("Invalid characters in PKCE code challenge");
        return Err(Oauth2Failure::new(
            Oauth2Error::InvalidRequest,
            "code_challenge contains invalid characters",
        ));
    }

    let method = method.unwrap_or_default();
    if method == CodeChallengeMethod::Plain && !allow_plain_text {
        security_info!("Plain text PKCE requested but not allowed for this client");
        return Err(Oauth2Failure::new(
            Oauth2Error::InvalidRequest,
            "plain code_challenge_method is not allowed",
        ));
    }

    Ok(Some(CodeChallenge {
        challenge: challenge.to_string(),
        method,
    }))
}

/// Validate a `code_verifier` presented at redemption against the challenge
/// stored with the authorisation code. All failures are `invalid_grant` -
/// at this point the code itself was valid, only the proof failed.
pub fn validate_code_verifier(
    verifier: Option<&str>,
    stored: &CodeChallenge,
) -> Result<(), Oauth2Failure> {
    let Some(verifier) = verifier.filter(|v| !v.is_empty()) else {
        security_info!(
            "PKCE code verification failed - code challenge is present, but no verifier was provided"
        );
        return Err(Oauth2Failure::new(
            Oauth2Error::InvalidGrant,
            "code_verifier is missing",
        ));
    };

    if verifier.len() < PKCE_MIN_LEN || verifier.len() > PKCE_MAX_LEN {
        security_info!("PKCE code verification failed - invalid verifier length");
        return Err(Oauth2Failure::new(
            Oauth2Error::InvalidGrant,
            "code_verifier must be between 43 and 128 characters",
        ));
    }

    if !verifier.chars().all(verifier_char_valid) {
        security_info!("PKCE code verification failed - invalid characters in verifier");
        return Err(Oauth2Failure::new(
            Oauth2Error::InvalidGrant,
            "code_verifier contains invalid characters",
        ));
    }

    let derived = generate_code_challenge(verifier, stored.method);

    // Constant time comparison. Lengths leak nothing here - both sides are
    // public-alphabet encodings of fixed transforms.
    let matched = derived.len() == stored.challenge.len()
        && memcmp::eq(derived.as_bytes(), stored.challenge.as_bytes());

    if !matched {
        security_info!("PKCE code verification failed - this may indicate malicious activity");
        return Err(Oauth2Failure::new(
            Oauth2Error::InvalidGrant,
            "code_verifier does not match the code_challenge",
        ));
    }

    Ok(())
}

/// Generate a fresh code verifier - 32 random bytes, base64url without
/// padding.
pub fn generate_code_verifier() -> String {
    let random: [u8; 32] = rand::thread_rng().gen();
    general_purpose::URL_SAFE_NO_PAD.encode(random)
}

/// Derive the code challenge for a verifier under the given method.
pub fn generate_code_challenge(verifier: &str, method: CodeChallengeMethod) -> String {
    match method {
        CodeChallengeMethod::S256 => {
            let mut hasher = sha::Sha256::new();
            hasher.update(verifier.as_bytes());
            general_purpose::URL_SAFE_NO_PAD.encode(hasher.finish())
        }
        CodeChallengeMethod::Plain => verifier.to_string(),
    }
}
