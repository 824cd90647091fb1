//! Redirect uri validation. A requested redirect must match the client's
//! registered set before anything may be delivered back through it.
//!
//! Loopback redirects (RFC 8252) match on scheme and path with the port
//! ignored, so native apps can bind an ephemeral port. Claimed custom
//! schemes (`app://...`) match case insensitively. Everything else is an
//! exact match.

use crate::idm::oauth2::{Oauth2Error, Oauth2Failure};
use crate::prelude::*;
use url::Host;

fn host_is_local(host: &Host<&str>) -> bool {
    match host {
        Host::Ipv4(ip) => ip.is_loopback(),
        Host::Ipv6(ip) => ip.is_loopback(),
        Host::Domain(domain) => *domain == "localhost",
    }
}

/// Ensure that the redirect URI is a loopback/localhost address
pub(crate) fn check_is_loopback(redirect_uri: &Url) -> bool {
    redirect_uri.host().is_some_and(|host| {
        // Check if the host is a loopback/localhost address.
        host_is_local(&host)
    })
}

fn is_custom_scheme(redirect_uri: &Url) -> bool {
    !matches!(redirect_uri.scheme(), "http" | "https" | "urn")
}

/// Validate a requested redirect uri against the registered set. On success
/// the confirmed uri is returned and becomes the only place errors may be
/// delivered through.
pub fn validate_redirect_uri(
    requested: Option<&Url>,
    allowed: &[Url],
    is_implicit_or_hybrid: bool,
) -> Result<Url, Oauth2Failure> {
    let Some(requested) = requested else {
        request_warn!("redirect_uri was not provided and could not be resolved");
        return Err(Oauth2Failure::new(
            Oauth2Error::InvalidRequest,
            "redirect_uri is required",
        ));
    };

    // The fragment component belongs to the response when tokens are
    // returned on the front channel.
    if is_implicit_or_hybrid && requested.fragment().is_some() {
        security_info!("Invalid OAuth2 redirect_uri - fragment is reserved for the response");
        return Err(Oauth2Failure::new(
            Oauth2Error::InvalidRequest,
            "redirect_uri must not contain a fragment",
        ));
    }

    // Exact match against the registered set.
    if allowed.iter().any(|reg| reg == requested) {
        return Ok(requested.clone());
    }

    // RFC 8252 loopback redirect - the port is chosen at runtime by the
    // app, so compare scheme and path only. Query components of the
    // registered entry are not compared.
    if matches!(requested.scheme(), "http" | "https") && check_is_loopback(requested) {
        let loopback_matched = allowed.iter().any(|reg| {
            check_is_loopback(reg)
                && reg.scheme() == requested.scheme()
                && reg.path() == requested.path()
        });
        if loopback_matched {
            debug!("Loopback redirect_uri detected, allowing for localhost");
            return Ok(requested.clone());
        }
    }

    // A claimed custom scheme from a native app - match the registered
    // entry case insensitively.
    if is_custom_scheme(requested)
        && allowed
            .iter()
            .any(|reg| reg.as_str().eq_ignore_ascii_case(requested.as_str()))
    {
        return Ok(requested.clone());
    }

    security_info!(
        "Invalid OAuth2 redirect_uri (must be an exact match to a registered redirect uri) - got {}",
        requested.as_str()
    );
    Err(Oauth2Failure::new(
        Oauth2Error::InvalidRequest,
        "redirect_uri is not registered for this client",
    ))
}

/// Validate an optional `post_logout_redirect_uri` against its allow-list.
/// Absent is fine - present must be an exact match.
pub fn validate_post_logout_redirect_uri(
    requested: Option<&Url>,
    allowed: &[Url],
) -> Result<Option<Url>, Oauth2Failure> {
    let Some(requested) = requested else {
        return Ok(None);
    };

    if allowed.iter().any(|reg| reg == requested) {
        Ok(Some(requested.clone()))
    } else {
        security_info!(
            "Invalid OAuth2 post_logout_redirect_uri - got {}",
            requested.as_str()
        );
        Err(Oauth2Failure::new(
            Oauth2Error::InvalidRequest,
            "post_logout_redirect_uri is not registered for this client",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).expect("invalid url")
    }

    #[test]
    fn test_redirect_uri_required() {
        let failure =
            validate_redirect_uri(None, &[url("https://demo.example.com/cb")], false)
                .expect_err("absent redirect_uri accepted");
        assert_eq!(failure.error, Oauth2Error::InvalidRequest);
    }

    #[test]
    fn test_redirect_uri_exact_match() {
        let allowed = vec![url("https://demo.example.com/oauth2/result")];
        let matched = validate_redirect_uri(
            Some(&url("https://demo.example.com/oauth2/result")),
            &allowed,
            false,
        )
        .expect("exact match rejected");
        assert_eq!(matched, allowed[0]);

        // Path case differs - not a match.
        assert!(validate_redirect_uri(
            Some(&url("https://demo.example.com/OAuth2/result")),
            &allowed,
            false,
        )
        .is_err());

        // Different path - not a match.
        assert!(validate_redirect_uri(
            Some(&url("https://demo.example.com/other")),
            &allowed,
            false,
        )
        .is_err());
    }

    #[test]
    fn test_redirect_uri_fragment_reserved() {
        let allowed = vec![url("https://demo.example.com/cb")];
        // Fragments are rejected when tokens return on the front channel.
        assert!(validate_redirect_uri(
            Some(&url("https://demo.example.com/cb#frag")),
            &allowed,
            true,
        )
        .is_err());
        // For the pure code flow the fragment rule does not apply, but this
        // uri still fails registration matching.
        assert!(validate_redirect_uri(
            Some(&url("https://demo.example.com/cb#frag")),
            &allowed,
            false,
        )
        .is_err());
    }

    #[test]
    fn test_redirect_uri_loopback_ignores_port() {
        let allowed = vec![url("http://127.0.0.1:0/cb")];
        let matched = validate_redirect_uri(
            Some(&url("http://127.0.0.1:54231/cb")),
            &allowed,
            false,
        )
        .expect("loopback port match rejected");
        assert_eq!(matched.port(), Some(54231));

        // ::1 and localhost literals are also loopback.
        let allowed = vec![url("http://localhost/cb")];
        assert!(validate_redirect_uri(
            Some(&url("http://localhost:9000/cb")),
            &allowed,
            false
        )
        .is_ok());
        let allowed = vec![url("http://[::1]/cb")];
        assert!(
            validate_redirect_uri(Some(&url("http://[::1]:9000/cb")), &allowed, false).is_ok()
        );
    }

    #[test]
    fn test_redirect_uri_loopback_scheme_must_match() {
        let allowed = vec![url("https://127.0.0.1/cb")];
        assert!(
            validate_redirect_uri(Some(&url("http://127.0.0.1/cb")), &allowed, false).is_err()
        );
    }

    #[test]
    fn test_redirect_uri_loopback_path_must_match() {
        let allowed = vec![url("http://127.0.0.1/cb")];
        assert!(
            validate_redirect_uri(Some(&url("http://127.0.0.1:9000/other")), &allowed, false)
                .is_err()
        );
    }

    #[test]
    fn test_redirect_uri_non_loopback_port_not_ignored() {
        let allowed = vec![url("http://demo.example.com:8080/cb")];
        assert!(
            validate_redirect_uri(Some(&url("http://demo.example.com:9090/cb")), &allowed, false)
                .is_err()
        );
    }

    #[test]
    fn test_redirect_uri_custom_scheme_case_insensitive() {
        let allowed = vec![url("app://cheese/callback")];
        assert!(
            validate_redirect_uri(Some(&url("APP://cheese/callback")), &allowed, false).is_ok()
        );
        assert!(
            validate_redirect_uri(Some(&url("app://cheese/CALLBACK")), &allowed, false).is_ok()
        );
        assert!(
            validate_redirect_uri(Some(&url("app://brie/callback")), &allowed, false).is_err()
        );
    }

    #[test]
    fn test_post_logout_redirect_uri() {
        let allowed = vec![url("https://demo.example.com/logged_out")];
        assert_eq!(validate_post_logout_redirect_uri(None, &allowed), Ok(None));
        assert!(validate_post_logout_redirect_uri(
            Some(&url("https://demo.example.com/logged_out")),
            &allowed
        )
        .is_ok());
        assert!(validate_post_logout_redirect_uri(
            Some(&url("https://evil.example.com/out")),
            &allowed
        )
        .is_err());
    }
}
