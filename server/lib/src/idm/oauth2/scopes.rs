//! Scope validation. Requested scopes are checked against what the client
//! is allowed to request, then classified against the resource catalog -
//! identity resources for claims-bearing scopes, api scopes for access to
//! protected apis, and the api resources those scopes unlock.

use crate::idm::oauth2::{Oauth2Error, Oauth2Failure};
use crate::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

lazy_static! {
    pub static ref OAUTHSCOPE_RE: regex::Regex = {
        #[allow(clippy::expect_used)]
        regex::Regex::new("^[0-9a-zA-Z_\\-:.]+$").expect("Invalid oauthscope regex found")
    };
}

/// A scope that releases identity claims into tokens (e.g. `openid`,
/// `profile`, `email`).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IdentityResource {
    pub name: String,
    /// The claim types this resource releases.
    #[serde(default)]
    pub claims: BTreeSet<String>,
}

/// A scope granting access to a protected api surface.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ApiScope {
    pub name: String,
}

/// A protected api, unlocked by any of the scopes it lists.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ApiResource {
    pub name: String,
    pub scopes: BTreeSet<String>,
}

/// The set of resources and scopes this server knows about.
#[derive(Debug, Clone, Default)]
pub struct ResourceCatalog {
    identity_resources: BTreeMap<String, IdentityResource>,
    api_scopes: BTreeMap<String, ApiScope>,
    api_resources: Vec<ApiResource>,
}

impl ResourceCatalog {
    pub fn new(
        identity_resources: Vec<IdentityResource>,
        api_scopes: Vec<ApiScope>,
        api_resources: Vec<ApiResource>,
    ) -> Self {
        ResourceCatalog {
            identity_resources: identity_resources
                .into_iter()
                .map(|r| (r.name.clone(), r))
                .collect(),
            api_scopes: api_scopes.into_iter().map(|s| (s.name.clone(), s)).collect(),
            api_resources,
        }
    }
}

/// The partition of a validated scope request. Derived per request, never
/// persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeValidationResult {
    pub identity_scopes: BTreeSet<String>,
    pub api_scopes: BTreeSet<String>,
    /// Names of the api resources whose scope lists intersect the request.
    pub api_resources: BTreeSet<String>,
    pub valid_scopes: BTreeSet<String>,
}

#[derive(Clone)]
pub struct ScopeValidator {
    catalog: Arc<ResourceCatalog>,
}

impl ScopeValidator {
    pub fn new(catalog: Arc<ResourceCatalog>) -> Self {
        ScopeValidator { catalog }
    }

    /// Validate the requested scopes against what the client may request,
    /// then classify them against the catalog. A scope outside the client's
    /// allow-list fails immediately; scopes the catalog does not know are
    /// collected and reported together.
    pub fn validate(
        &self,
        requested: &BTreeSet<String>,
        client_allowed: &BTreeSet<String>,
    ) -> Result<ScopeValidationResult, Oauth2Failure> {
        // You need to be allowed every requested scope or the request is
        // denied - fail fast, the classification result would be unusable.
        for scope in requested {
            if !client_allowed.contains(scope) {
                security_info!(%scope, "Client is not allowed to request scope");
                return Err(Oauth2Failure::new(
                    Oauth2Error::InvalidScope,
                    format!("client is not allowed to request scope {scope}"),
                ));
            }
        }

        let mut result = ScopeValidationResult::default();
        let mut unknown_scopes = BTreeSet::new();

        for scope in requested {
            if !OAUTHSCOPE_RE.is_match(scope) {
                unknown_scopes.insert(scope.clone());
                continue;
            }
            if self.catalog.identity_resources.contains_key(scope) {
                result.identity_scopes.insert(scope.clone());
            } else if self.catalog.api_scopes.contains_key(scope) {
                result.api_scopes.insert(scope.clone());
                for api_resource in self
                    .catalog
                    .api_resources
                    .iter()
                    .filter(|r| r.scopes.contains(scope))
                {
                    result.api_resources.insert(api_resource.name.clone());
                }
            } else {
                unknown_scopes.insert(scope.clone());
                continue;
            }
            result.valid_scopes.insert(scope.clone());
        }

        // Report every unknown scope at once - a single informative error
        // rather than a retry loop for the caller.
        if !unknown_scopes.is_empty() {
            let listed = unknown_scopes.iter().cloned().collect::<Vec<_>>().join(", ");
            admin_warn!(unknown = %listed, "Authorisation request contains unknown scopes");
            return Err(Oauth2Failure::new(
                Oauth2Error::InvalidScope,
                format!("unknown scopes requested: {listed}"),
            ));
        }

        Ok(result)
    }
}

/// Split a raw scope parameter into the requested set. Whitespace separated,
/// trimmed, de-duplicated, case sensitive. Empty input yields an empty set.
pub fn parse_scopes(raw: &str) -> BTreeSet<String> {
    raw.split_whitespace().map(str::to_string).collect()
}
