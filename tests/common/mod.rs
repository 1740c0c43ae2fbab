#![allow(clippy::unwrap_used, dead_code, missing_docs)]

//! Shared test fixtures: an in-memory registry speaking just enough of the
//! blob protocol, and a stub remote-progress source.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode, header};

use stargz_fs::remote::{HttpClient, HttpClientError, HttpRequest, HttpResponse};

pub const REGISTRY_HOST: &str = "registry.test";
pub const CDN_HOST: &str = "cdn.test";
pub const REPOSITORY: &str = "library/app";
pub const DIGEST: &str = "sha256:fixture";
pub const TOKEN: &str = "sesame";

/// The reference and insecure-pattern pair every test resolves with.
pub fn reference() -> String {
    format!("{REGISTRY_HOST}/{REPOSITORY}:latest")
}

pub fn insecure_all() -> Vec<String> {
    vec!["^(registry|cdn)\\.test$".to_owned()]
}

/// A credential-store path that never exists, so tests stay hermetic.
pub fn no_credentials() -> Option<PathBuf> {
    Some(PathBuf::from("/nonexistent/docker-config.json"))
}

/// In-memory registry serving one blob over ranged GETs.
#[derive(Debug, Default)]
pub struct MockRegistry {
    pub blob: Vec<u8>,
    /// Require a bearer token obtained from `/token`.
    pub token_auth: bool,
    /// Answer the first blob request on the registry host with a redirect
    /// to the CDN host.
    pub redirect_to_cdn: bool,
    /// Ignore `Range` headers and return the whole blob.
    pub ignore_range: bool,
    /// Fail every blob request with a 500.
    pub fail_blobs: AtomicBool,
    /// Ranges served, in request order.
    pub ranges: Mutex<Vec<(u64, u64)>>,
}

impl MockRegistry {
    pub fn serving(blob: Vec<u8>) -> Self {
        Self {
            blob,
            ..Self::default()
        }
    }

    pub fn request_count(&self) -> usize {
        self.ranges.lock().unwrap().len()
    }

    fn respond(status: StatusCode, headers: HeaderMap, body: &[u8]) -> HttpResponse {
        HttpResponse {
            status,
            headers,
            body: Bytes::copy_from_slice(body),
        }
    }

    fn blob_response(&self, headers: &HeaderMap) -> HttpResponse {
        if self.fail_blobs.load(Ordering::Relaxed) {
            return Self::respond(StatusCode::INTERNAL_SERVER_ERROR, HeaderMap::new(), b"");
        }
        if self.token_auth {
            let authorized = headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == format!("Bearer {TOKEN}"));
            if !authorized {
                return Self::respond(StatusCode::UNAUTHORIZED, HeaderMap::new(), b"");
            }
        }

        let range = headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);
        match range {
            Some((start, end)) if !self.ignore_range => {
                let start_idx = (start as usize).min(self.blob.len());
                let end_idx = ((end + 1) as usize).min(self.blob.len());
                self.ranges.lock().unwrap().push((start, end));
                Self::respond(
                    StatusCode::PARTIAL_CONTENT,
                    HeaderMap::new(),
                    &self.blob[start_idx..end_idx],
                )
            }
            _ => {
                self.ranges.lock().unwrap().push((0, self.blob.len() as u64));
                Self::respond(StatusCode::OK, HeaderMap::new(), &self.blob)
            }
        }
    }
}

impl HttpClient for MockRegistry {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpClientError> {
        let (host, path) = split_url(&request.url);

        if path == "/v2/" {
            if self.token_auth {
                let mut headers = HeaderMap::new();
                let challenge = format!(
                    "Bearer realm=\"http://{REGISTRY_HOST}/token\",service=\"{REGISTRY_HOST}\""
                );
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_str(&challenge).unwrap(),
                );
                return Ok(Self::respond(StatusCode::UNAUTHORIZED, headers, b""));
            }
            return Ok(Self::respond(StatusCode::OK, HeaderMap::new(), b"{}"));
        }

        if path == "/token" {
            let body = format!("{{\"token\":\"{TOKEN}\"}}");
            return Ok(Self::respond(
                StatusCode::OK,
                HeaderMap::new(),
                body.as_bytes(),
            ));
        }

        if path.contains("/blobs/") {
            if self.redirect_to_cdn && host == REGISTRY_HOST {
                let mut headers = HeaderMap::new();
                let location = format!("http://{CDN_HOST}{path}");
                headers.insert(
                    header::LOCATION,
                    HeaderValue::from_str(&location).unwrap(),
                );
                return Ok(Self::respond(StatusCode::TEMPORARY_REDIRECT, headers, b""));
            }
            return Ok(self.blob_response(&request.headers));
        }

        Ok(Self::respond(StatusCode::NOT_FOUND, HeaderMap::new(), b""))
    }
}

fn split_url(url: &str) -> (String, String) {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    match rest.split_once('/') {
        Some((host, path)) => {
            let path = path.split('?').next().unwrap_or(path);
            (host.to_owned(), format!("/{path}"))
        }
        None => (rest.to_owned(), "/".to_owned()),
    }
}

fn parse_range(value: &str) -> Option<(u64, u64)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

/// Stub progress source for building a `LayerStatus` without a network.
#[derive(Debug, Default)]
pub struct FakeRemote {
    pub fetched: AtomicU64,
}

impl stargz_fs::remote::RemoteInfo for FakeRemote {
    fn fetched_size(&self) -> u64 {
        self.fetched.load(Ordering::Relaxed)
    }
}

/// The mount labels for the fixture blob.
pub fn labels_for(size: u64) -> HashMap<String, String> {
    HashMap::from([
        (
            stargz_fs::fs::filesystem::TARGET_REF_LABEL.to_owned(),
            reference(),
        ),
        (
            stargz_fs::fs::filesystem::TARGET_DIGEST_LABEL.to_owned(),
            DIGEST.to_owned(),
        ),
        (
            stargz_fs::fs::filesystem::TARGET_SIZE_LABEL.to_owned(),
            size.to_string(),
        ),
    ])
}
