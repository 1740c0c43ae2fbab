//! Registry reference resolution.
//!
//! Turns an image reference plus blob digest into a ranged-GET-capable URL
//! and an authenticated transport: parse the reference in the docker
//! convention, pick a scheme from the insecure-host patterns, obtain a
//! pull-scoped bearer token, probe the blob URL, and follow one redirect.
//! Resolved transports are cached per canonical reference and rebuilt on
//! failure.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use http::{HeaderMap, HeaderValue, header};
use regex::Regex;
use thiserror::Error;
use tracing::debug;

use crate::remote::http::{HttpClient, HttpClientError, HttpRequest, HttpResponse};

/// Registries name Docker Hub `docker.io`, but its API lives elsewhere.
const DOCKER_HUB_ALIAS: &str = "docker.io";
const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";

/// Deadline for each connectivity probe during resolution.
const RESOLVE_DEADLINE: Duration = Duration::from_secs(30);

/// Errors raised while resolving a reference to a usable transport.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid image reference {0:?}")]
    InvalidReference(String),

    #[error("invalid insecure-host pattern: {0}")]
    InsecurePattern(#[from] regex::Error),

    #[error("authentication against {host:?} failed: {reason}")]
    Auth { host: String, reason: String },

    #[error("failed to read credential store: {0}")]
    CredentialStore(std::io::Error),

    #[error("registry returned status {0} while resolving")]
    Status(u16),

    #[error("connectivity probe timed out")]
    Deadline,

    #[error("network error while resolving: {0}")]
    Net(#[from] HttpClientError),
}

/// A parsed image reference: registry host and repository path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub host: String,
    pub repository: String,
}

/// Parse an image reference in the docker convention. A first segment with a
/// dot, a colon, or the literal `localhost` names a registry; otherwise the
/// reference is Hub-relative and single-segment paths gain `library/`.
pub fn parse_reference(reference: &str) -> Result<Reference, ResolveError> {
    let invalid = || ResolveError::InvalidReference(reference.to_owned());

    // Strip any trailing digest, then any tag.
    let without_digest = reference.split('@').next().ok_or_else(invalid)?;
    let without_tag = match without_digest.rfind(':') {
        Some(colon) if !without_digest[colon..].contains('/') => &without_digest[..colon],
        _ => without_digest,
    };
    if without_tag.is_empty() {
        return Err(invalid());
    }

    let (host, path) = match without_tag.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_owned(), rest.to_owned())
        }
        _ => (DOCKER_HUB_ALIAS.to_owned(), without_tag.to_owned()),
    };
    if path.is_empty() {
        return Err(invalid());
    }
    let repository = if host == DOCKER_HUB_ALIAS && !path.contains('/') {
        format!("library/{path}")
    } else {
        path
    };
    Ok(Reference { host, repository })
}

/// An authenticated client for one registry: the shared backend plus the
/// auth headers attached to every request.
#[derive(Debug)]
pub struct Transport<C: HttpClient> {
    client: Arc<C>,
    headers: HeaderMap,
}

impl<C: HttpClient> Clone for Transport<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            headers: self.headers.clone(),
        }
    }
}

impl<C: HttpClient> Transport<C> {
    /// Issue a GET, optionally with an inclusive byte range.
    pub async fn get(
        &self,
        url: &str,
        range: Option<(u64, u64)>,
    ) -> Result<HttpResponse, HttpClientError> {
        let mut request = HttpRequest::get(url);
        request.headers = self.headers.clone();
        if let Some((start, end)) = range {
            let value = HeaderValue::from_str(&format!("bytes={start}-{end}"))
                .map_err(|e| HttpClientError::Other(Box::new(e)))?;
            request.headers.insert(header::RANGE, value);
        }
        self.client.send(request).await
    }
}

/// Resolves references to blob URLs and caches one transport per canonical
/// reference. The cache has its own mutex and is never held across I/O.
#[derive(Debug)]
pub struct Resolver<C: HttpClient> {
    client: Arc<C>,
    insecure: Vec<Regex>,
    transports: Mutex<HashMap<String, HeaderMap>>,
    credential_path: Option<PathBuf>,
}

impl<C: HttpClient> Resolver<C> {
    /// Build a resolver over `client`. `insecure_hosts` are regular
    /// expressions matched against registry hosts that should use plain
    /// HTTP. `credential_path` overrides the default docker config
    /// location (useful in tests).
    pub fn new(
        client: Arc<C>,
        insecure_hosts: &[String],
        credential_path: Option<PathBuf>,
    ) -> Result<Self, ResolveError> {
        let insecure = insecure_hosts
            .iter()
            .map(|pattern| Regex::new(pattern))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            client,
            insecure,
            transports: Mutex::new(HashMap::new()),
            credential_path,
        })
    }

    /// Resolve `reference` + `digest` into a blob URL (post-redirect) and an
    /// authenticated transport.
    pub async fn resolve(
        &self,
        reference: &str,
        digest: &str,
    ) -> Result<(String, Transport<C>), ResolveError> {
        let parsed = parse_reference(reference)?;
        let host = if parsed.host == DOCKER_HUB_ALIAS {
            DOCKER_HUB_REGISTRY.to_owned()
        } else {
            parsed.host
        };
        let scheme = if self.insecure.iter().any(|re| re.is_match(&host)) {
            "http"
        } else {
            "https"
        };
        let url = format!("{scheme}://{host}/v2/{}/blobs/{digest}", parsed.repository);
        let canonical = format!("{host}/{}", parsed.repository);

        // Try the cached transport first; evict it on any failure so the
        // rebuild below starts from fresh credentials.
        let cached = self.lock_transports().get(&canonical).cloned();
        if let Some(headers) = cached {
            let transport = Transport {
                client: Arc::clone(&self.client),
                headers,
            };
            match check_and_redirect(&url, &transport).await {
                Ok(resolved) => return Ok((resolved, transport)),
                Err(e) => {
                    debug!(reference, error = %e, "cached transport failed, refreshing");
                    self.lock_transports().remove(&canonical);
                }
            }
        }

        let headers = self
            .authenticate(scheme, &host, &parsed.repository)
            .await?;
        let transport = Transport {
            client: Arc::clone(&self.client),
            headers: headers.clone(),
        };
        let resolved = check_and_redirect(&url, &transport).await?;
        self.lock_transports().insert(canonical, headers);
        Ok((resolved, transport))
    }

    fn lock_transports(&self) -> std::sync::MutexGuard<'_, HashMap<String, HeaderMap>> {
        self.transports.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Probe the registry's API root and, when challenged, obtain a
    /// pull-scoped bearer token.
    async fn authenticate(
        &self,
        scheme: &str,
        host: &str,
        repository: &str,
    ) -> Result<HeaderMap, ResolveError> {
        let probe = self
            .client
            .send(HttpRequest::get(format!("{scheme}://{host}/v2/")))
            .await?;

        if probe.status.as_u16() != 401 {
            if probe.status.as_u16() >= 400 {
                return Err(ResolveError::Status(probe.status.as_u16()));
            }
            // Registry accepts anonymous access.
            return Ok(HeaderMap::new());
        }

        let challenge = probe
            .headers
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge)
            .ok_or_else(|| ResolveError::Auth {
                host: host.to_owned(),
                reason: "registry sent no bearer challenge".to_owned(),
            })?;

        let mut token_request = HttpRequest::get(format!(
            "{}?service={}&scope=repository:{repository}:pull",
            challenge.realm, challenge.service
        ));
        if let Some(basic) = load_credentials(host, self.credential_path.as_deref())? {
            let value = HeaderValue::from_str(&format!("Basic {basic}"))
                .map_err(|e| HttpClientError::Other(Box::new(e)))?;
            token_request.headers.insert(header::AUTHORIZATION, value);
        }

        let response = self.client.send(token_request).await?;
        if !response.status.is_success() {
            return Err(ResolveError::Auth {
                host: host.to_owned(),
                reason: format!("token endpoint returned status {}", response.status),
            });
        }
        let token: TokenResponse =
            serde_json::from_slice(&response.body).map_err(|e| ResolveError::Auth {
                host: host.to_owned(),
                reason: format!("malformed token response: {e}"),
            })?;
        let token = token.any().ok_or_else(|| ResolveError::Auth {
            host: host.to_owned(),
            reason: "token response carried no token".to_owned(),
        })?;

        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| HttpClientError::Other(Box::new(e)))?;
        headers.insert(header::AUTHORIZATION, value);
        Ok(headers)
    }
}

/// Probe `url` with a two-byte ranged GET under the resolve deadline and
/// follow at most one redirect.
pub async fn check_and_redirect<C: HttpClient>(
    url: &str,
    transport: &Transport<C>,
) -> Result<String, ResolveError> {
    let response = tokio::time::timeout(RESOLVE_DEADLINE, transport.get(url, Some((0, 1))))
        .await
        .map_err(|_| ResolveError::Deadline)??;
    if response.status.as_u16() >= 400 {
        return Err(ResolveError::Status(response.status.as_u16()));
    }
    if response.status.is_redirection()
        && let Some(location) = response
            .headers
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
    {
        return Ok(location.to_owned());
    }
    Ok(url.to_owned())
}

#[derive(Debug, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: String,
}

/// Parse `WWW-Authenticate: Bearer realm="...",service="..."`.
fn parse_bearer_challenge(value: &str) -> Option<BearerChallenge> {
    let params = value.strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    for part in params.split(',') {
        let (key, raw) = part.trim().split_once('=')?;
        let unquoted = raw.trim_matches('"');
        match key {
            "realm" => realm = Some(unquoted.to_owned()),
            "service" => service = Some(unquoted.to_owned()),
            _ => {}
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        service: service.unwrap_or_default(),
    })
}

#[derive(Debug, serde::Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    access_token: String,
}

impl TokenResponse {
    fn any(self) -> Option<String> {
        if !self.token.is_empty() {
            Some(self.token)
        } else if !self.access_token.is_empty() {
            Some(self.access_token)
        } else {
            None
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: HashMap<String, DockerAuth>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct DockerAuth {
    #[serde(default)]
    auth: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

/// Look up credentials for `host` in the ambient docker config. Returns the
/// base64 `user:password` payload for a Basic header, or `None` for
/// anonymous access.
fn load_credentials(
    host: &str,
    override_path: Option<&Path>,
) -> Result<Option<String>, ResolveError> {
    let path = match override_path {
        Some(p) => p.to_path_buf(),
        None => match dirs::home_dir() {
            Some(home) => home.join(".docker").join("config.json"),
            None => return Ok(None),
        },
    };
    let raw = match std::fs::read(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ResolveError::CredentialStore(e)),
    };
    let config: DockerConfig = serde_json::from_slice(&raw)
        .map_err(|e| ResolveError::CredentialStore(std::io::Error::other(e)))?;

    // Hub credentials are historically stored under several aliases.
    let candidates: &[&str] = if host == DOCKER_HUB_REGISTRY {
        &[
            DOCKER_HUB_REGISTRY,
            "https://index.docker.io/v1/",
            "index.docker.io",
            DOCKER_HUB_ALIAS,
        ]
    } else {
        &[host]
    };

    for key in candidates {
        let Some(entry) = config
            .auths
            .get(*key)
            .or_else(|| config.auths.get(&format!("https://{key}")))
        else {
            continue;
        };
        if !entry.auth.is_empty() {
            return Ok(Some(entry.auth.clone()));
        }
        if !entry.username.is_empty() {
            use base64::Engine as _;
            let joined = format!("{}:{}", entry.username, entry.password);
            return Ok(Some(
                base64::engine::general_purpose::STANDARD.encode(joined),
            ));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fully_qualified_references() {
        let parsed = parse_reference("registry.example.com:5000/team/app:v1").unwrap();
        assert_eq!(parsed.host, "registry.example.com:5000");
        assert_eq!(parsed.repository, "team/app");
    }

    #[test]
    fn completes_hub_references() {
        let parsed = parse_reference("ubuntu:20.04").unwrap();
        assert_eq!(parsed.host, "docker.io");
        assert_eq!(parsed.repository, "library/ubuntu");

        let parsed = parse_reference("someorg/someimage").unwrap();
        assert_eq!(parsed.repository, "someorg/someimage");
    }

    #[test]
    fn strips_digest_suffix() {
        let parsed =
            parse_reference("ghcr.io/org/app@sha256:0123456789abcdef").unwrap();
        assert_eq!(parsed.host, "ghcr.io");
        assert_eq!(parsed.repository, "org/app");
    }

    #[test]
    fn rejects_empty_references() {
        assert!(parse_reference("").is_err());
        assert!(parse_reference("example.com/").is_err());
    }

    #[test]
    fn parses_bearer_challenges() {
        let challenge = parse_bearer_challenge(
            "Bearer realm=\"https://auth.docker.io/token\",service=\"registry.docker.io\"",
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service, "registry.docker.io");

        assert!(parse_bearer_challenge("Basic realm=\"x\"").is_none());
    }
}
