use crate::errors::ImageError;
use regex::Regex;
use url::Url;

/// Parsed `WWW-Authenticate: Bearer …` challenge
///
/// Reference: <https://docs.docker.com/registry/spec/auth/token/>
#[derive(Debug, Clone)]
pub(crate) struct BearerChallenge {
    pub realm: Url,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl BearerChallenge {
    /// Pick apart a bearer challenge header
    ///
    /// Registries disagree on parameter order and comma placement, so the
    /// parameters are collected as individual `key="value"` matches. The
    /// realm is mandatory and must be an http(s) URL; service and scope
    /// are optional, since some registries leave the client to construct
    /// its own scope.
    pub(crate) fn parse(auth_header: &str) -> Result<Self, ImageError> {
        lazy_static! {
            static ref PARAM: Regex = Regex::new(r#"([A-Za-z_]+)="([^"]*)""#).unwrap();
        }
        let unsupported = || ImageError::UnsupportedAuthentication(auth_header.to_owned());

        let rest = auth_header.trim_start();
        let scheme_len = "bearer".len();
        if rest.len() < scheme_len || !rest[..scheme_len].eq_ignore_ascii_case("bearer") {
            return Err(unsupported());
        }
        let params = &rest[scheme_len..];
        match params.chars().next() {
            None => return Err(unsupported()),
            Some(c) if c.is_whitespace() => {}
            Some(_) => return Err(unsupported()),
        }

        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for capture in PARAM.captures_iter(params) {
            let value = capture[2].to_owned();
            match capture[1].to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }

        let realm = realm
            .filter(|r| r.starts_with("https://") || r.starts_with("http://"))
            .and_then(|r| r.parse::<Url>().ok())
            .ok_or_else(unsupported)?;
        Ok(BearerChallenge {
            realm,
            service,
            scope,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_docker_hub_challenge() {
        let challenge = BearerChallenge::parse(concat!(
            "Bearer realm=\"https://auth.docker.io/token\",",
            "service=\"registry.docker.io\",",
            "scope=\"repository:library/alpine:pull\"",
        ))
        .unwrap();
        assert_eq!(challenge.realm.as_str(), "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/alpine:pull")
        );
    }

    #[test]
    fn parse_challenge_without_scope() {
        let challenge =
            BearerChallenge::parse("Bearer realm=\"http://127.0.0.1:5000/token\"").unwrap();
        assert_eq!(challenge.scope, None);
        assert_eq!(challenge.service, None);
    }

    #[test]
    fn parameter_order_does_not_matter() {
        let challenge = BearerChallenge::parse(
            "bearer scope=\"repository:a/b:pull\" realm=\"https://auth.example.com/t\"",
        )
        .unwrap();
        assert_eq!(challenge.realm.as_str(), "https://auth.example.com/t");
        assert_eq!(challenge.scope.as_deref(), Some("repository:a/b:pull"));
    }

    #[test]
    fn reject_non_bearer_challenges() {
        assert!(BearerChallenge::parse("Basic realm=\"registry\"").is_err());
        assert!(BearerChallenge::parse("Bearertoken realm=\"https://x/\"").is_err());
        assert!(BearerChallenge::parse("Bearer").is_err());
        assert!(BearerChallenge::parse("").is_err());
    }

    #[test]
    fn reject_challenges_without_a_usable_realm() {
        assert!(BearerChallenge::parse("Bearer service=\"test\"").is_err());
        assert!(BearerChallenge::parse("Bearer realm=\"ftp://files/\"").is_err());
    }
}
