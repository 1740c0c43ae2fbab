//! Remote blob access: registry resolution, authenticated transports, and
//! the cached range reader.

/// HTTP client abstraction for pluggable backends.
pub mod http;
/// Reqwest-based HTTP client backend.
pub mod reqwest_client;
/// Registry reference resolution, authentication, and redirect handling.
pub mod resolver;
/// Cache-backed ranged reader over a resolved blob URL.
pub mod url_reader;

pub use http::{HttpClient, HttpClientError, HttpRequest, HttpResponse};
pub use reqwest_client::ReqwestClient;
pub use resolver::{Reference, ResolveError, Resolver, Transport};
pub use url_reader::{RemoteError, RemoteInfo, UrlReader};
