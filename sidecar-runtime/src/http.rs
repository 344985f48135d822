use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Url};
use std::time::Duration;

use crate::error::{Result, SidecarError};

/// Resolve `path` against `base`. `base` may be a bare `host:port` (the form
/// Lambda puts in `AWS_LAMBDA_RUNTIME_API`) or a full URL.
pub fn build_url(base: &str, path: &str) -> Result<Url> {
    let base = base.trim().trim_end_matches('/');
    let origin = if base.contains("://") {
        base.to_string()
    } else {
        format!("http://{base}")
    };
    let base_url = Url::parse(&origin)
        .map_err(|err| SidecarError::Config(format!("Invalid base URL '{origin}': {err}")))?;
    base_url
        .join(path)
        .map_err(|err| SidecarError::Config(format!("Invalid path '{path}': {err}")))
}

/// Build a header map from lowercase names, rejecting values that are not
/// valid header text.
pub fn header_map(pairs: &[(&'static str, &str)]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for &(name, value) in pairs {
        let value = HeaderValue::from_str(value)
            .map_err(|_| SidecarError::Config(format!("Invalid value for header {name}")))?;
        headers.insert(HeaderName::from_static(name), value);
    }
    Ok(headers)
}

/// Client for the lifecycle API. Deliberately has no overall request
/// timeout: `event/next` is a long poll the host may hold open indefinitely.
/// Calls that must be bounded set a per-request timeout instead.
pub fn lifecycle_client(connect_timeout: Duration) -> Result<Client> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|err| SidecarError::Config(format!("Failed to build HTTP client: {err}")))
}
