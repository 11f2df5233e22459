//! Thin client for the OCI/Docker Registry v2 wire protocol

use crate::{
    cancel::CancelToken, config::AuthConfig, errors::ImageError, image::ContentDigest,
    registry::auth::BearerChallenge,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::{collections::HashMap, io::Write};
use tokio::sync::RwLock;
use url::Url;

/// Registry operations the rest of porter depends on
///
/// Abstracts the HTTP protocol behind manifest fetch/put, blob
/// existence/fetch/upload, so the pull, push, and build paths never touch
/// the wire format directly.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn fetch_manifest(
        &self,
        repository: &str,
        version: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, ImageError>;

    /// Stream one blob into `sink`, returning the number of bytes copied
    async fn fetch_blob(
        &self,
        repository: &str,
        digest: &ContentDigest,
        sink: &mut (dyn Write + Send),
        cancel: &CancelToken,
    ) -> Result<u64, ImageError>;

    async fn has_blob(
        &self,
        repository: &str,
        digest: &ContentDigest,
    ) -> Result<bool, ImageError>;

    async fn upload_blob(
        &self,
        repository: &str,
        digest: &ContentDigest,
        content: Vec<u8>,
        cancel: &CancelToken,
    ) -> Result<(), ImageError>;

    async fn put_manifest(
        &self,
        repository: &str,
        version: &str,
        media_type: &str,
        payload: Vec<u8>,
    ) -> Result<(), ImageError>;
}

const ACCEPT_MANIFEST: &str = concat!(
    "application/vnd.docker.distribution.manifest.v2+json",
    ", application/vnd.oci.image.manifest.v1+json",
);

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// [RegistryClient] over reqwest with bearer-token authentication
///
/// Tokens are fetched lazily when a request bounces with a 401 challenge
/// and cached per scope for the lifetime of the client.
pub struct HttpRegistryClient {
    base_url: String,
    http: reqwest::Client,
    credentials: Option<AuthConfig>,
    tokens: RwLock<HashMap<String, String>>,
}

impl HttpRegistryClient {
    pub fn new(registry: &str, credentials: Option<AuthConfig>) -> Result<Self, ImageError> {
        let http = reqwest::Client::builder()
            .user_agent(HttpRegistryClient::default_user_agent())
            .build()?;
        Ok(HttpRegistryClient {
            base_url: format!("{}://{}", protocol_for(registry), registry),
            http,
            credentials,
            tokens: RwLock::new(HashMap::new()),
        })
    }

    /// The `User-Agent` identifying this build of porter
    pub fn default_user_agent() -> &'static str {
        concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"))
    }

    fn pull_scope(repository: &str) -> String {
        format!("repository:{}:pull", repository)
    }

    fn push_scope(repository: &str) -> String {
        format!("repository:{}:pull,push", repository)
    }

    /// Issue a request, transparently satisfying one bearer challenge
    async fn request(
        &self,
        method: reqwest::Method,
        url: Url,
        scope: &str,
        configure: impl Fn(reqwest::RequestBuilder) -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, ImageError> {
        let cached = self.tokens.read().await.get(scope).cloned();
        let build = |token: Option<&String>| {
            let mut req = self.http.request(method.clone(), url.clone());
            if let Some(token) = token {
                req = req.bearer_auth(token);
            }
            configure(req)
        };

        let response = build(cached.as_ref()).send().await?;
        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let header = response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        let challenge = BearerChallenge::parse(&header)?;
        let token = self.fetch_token(&challenge, scope).await?;
        self.tokens
            .write()
            .await
            .insert(scope.to_owned(), token.clone());
        Ok(build(Some(&token)).send().await?)
    }

    async fn fetch_token(
        &self,
        challenge: &BearerChallenge,
        fallback_scope: &str,
    ) -> Result<String, ImageError> {
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(service) = &challenge.service {
            query.push(("service", service));
        }
        let scope = challenge.scope.as_deref().unwrap_or(fallback_scope);
        if !scope.is_empty() {
            query.push(("scope", scope));
        }

        let mut req = self.http.get(challenge.realm.clone()).query(&query);
        if let Some(auth) = &self.credentials {
            req = req.basic_auth(&auth.username, Some(&auth.password));
        }
        let response = req.send().await?;
        if !response.status().is_success() {
            return Err(ImageError::RegistryStatus {
                status: response.status().as_u16(),
                url: challenge.realm.to_string(),
            });
        }
        let token: TokenResponse = serde_json::from_slice(&response.bytes().await?)?;
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| ImageError::UnsupportedAuthentication("empty token response".into()))
    }

    fn endpoint(&self, path: &str) -> Result<Url, ImageError> {
        Url::parse(&format!("{}{}", self.base_url, path))
            .map_err(|err| ImageError::Internal(format!("bad registry url: {}", err)))
    }

    fn status_error(url: &Url, status: reqwest::StatusCode) -> ImageError {
        ImageError::RegistryStatus {
            status: status.as_u16(),
            url: url.to_string(),
        }
    }
}

fn protocol_for(registry: &str) -> &'static str {
    // https everywhere, except for local development registries
    let host = registry.split(':').next().unwrap_or(registry);
    if host == "localhost" || host.starts_with("127.") {
        "http"
    } else {
        "https"
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn fetch_manifest(
        &self,
        repository: &str,
        version: &str,
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, ImageError> {
        cancel.check()?;
        let url = self.endpoint(&format!("/v2/{}/manifests/{}", repository, version))?;
        let response = self
            .request(
                reqwest::Method::GET,
                url.clone(),
                &HttpRegistryClient::pull_scope(repository),
                |req| req.header(reqwest::header::ACCEPT, ACCEPT_MANIFEST),
            )
            .await?;
        match response.status() {
            status if status.is_success() => Ok(response.bytes().await?.to_vec()),
            reqwest::StatusCode::NOT_FOUND => Err(ImageError::NotFound(format!(
                "manifest {}:{}",
                repository, version
            ))),
            status => Err(HttpRegistryClient::status_error(&url, status)),
        }
    }

    async fn fetch_blob(
        &self,
        repository: &str,
        digest: &ContentDigest,
        sink: &mut (dyn Write + Send),
        cancel: &CancelToken,
    ) -> Result<u64, ImageError> {
        cancel.check()?;
        let url = self.endpoint(&format!("/v2/{}/blobs/{}", repository, digest))?;
        let mut response = self
            .request(
                reqwest::Method::GET,
                url.clone(),
                &HttpRegistryClient::pull_scope(repository),
                |req| req,
            )
            .await?;
        match response.status() {
            status if status.is_success() => (),
            reqwest::StatusCode::NOT_FOUND => {
                return Err(ImageError::NotFound(format!("blob {}", digest)))
            }
            status => return Err(HttpRegistryClient::status_error(&url, status)),
        }
        let mut copied = 0u64;
        while let Some(chunk) = response.chunk().await? {
            cancel.check()?;
            sink.write_all(&chunk)?;
            copied += chunk.len() as u64;
        }
        Ok(copied)
    }

    async fn has_blob(
        &self,
        repository: &str,
        digest: &ContentDigest,
    ) -> Result<bool, ImageError> {
        let url = self.endpoint(&format!("/v2/{}/blobs/{}", repository, digest))?;
        let response = self
            .request(
                reqwest::Method::HEAD,
                url.clone(),
                &HttpRegistryClient::pull_scope(repository),
                |req| req,
            )
            .await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            status => Err(HttpRegistryClient::status_error(&url, status)),
        }
    }

    async fn upload_blob(
        &self,
        repository: &str,
        digest: &ContentDigest,
        content: Vec<u8>,
        cancel: &CancelToken,
    ) -> Result<(), ImageError> {
        cancel.check()?;
        let scope = HttpRegistryClient::push_scope(repository);

        // step 1: open an upload session
        let url = self.endpoint(&format!("/v2/{}/blobs/uploads/", repository))?;
        let response = self
            .request(reqwest::Method::POST, url.clone(), &scope, |req| req)
            .await?;
        if !response.status().is_success() {
            return Err(HttpRegistryClient::status_error(&url, response.status()));
        }
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                ImageError::IllegalState(format!("upload session without location for {}", url))
            })?;
        let mut upload_url = url
            .join(location)
            .map_err(|err| ImageError::Internal(format!("bad upload location: {}", err)))?;
        upload_url
            .query_pairs_mut()
            .append_pair("digest", digest.as_str());

        // step 2: monolithic upload
        cancel.check()?;
        let response = self
            .request(reqwest::Method::PUT, upload_url.clone(), &scope, move |req| {
                req.header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(content.clone())
            })
            .await?;
        if !response.status().is_success() {
            return Err(HttpRegistryClient::status_error(
                &upload_url,
                response.status(),
            ));
        }
        Ok(())
    }

    async fn put_manifest(
        &self,
        repository: &str,
        version: &str,
        media_type: &str,
        payload: Vec<u8>,
    ) -> Result<(), ImageError> {
        let url = self.endpoint(&format!("/v2/{}/manifests/{}", repository, version))?;
        let media_type = media_type.to_owned();
        let response = self
            .request(
                reqwest::Method::PUT,
                url.clone(),
                &HttpRegistryClient::push_scope(repository),
                move |req| {
                    req.header(reqwest::header::CONTENT_TYPE, media_type.clone())
                        .body(payload.clone())
                },
            )
            .await?;
        if !response.status().is_success() {
            return Err(HttpRegistryClient::status_error(&url, response.status()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_heuristic() {
        assert_eq!(protocol_for("registry-1.docker.io"), "https");
        assert_eq!(protocol_for("quay.io"), "https");
        assert_eq!(protocol_for("localhost"), "http");
        assert_eq!(protocol_for("localhost:5000"), "http");
        assert_eq!(protocol_for("127.0.0.1:1234"), "http");
    }

    #[test]
    fn scopes() {
        assert_eq!(
            HttpRegistryClient::pull_scope("library/alpine"),
            "repository:library/alpine:pull"
        );
        assert_eq!(
            HttpRegistryClient::push_scope("some/app"),
            "repository:some/app:pull,push"
        );
    }
}
