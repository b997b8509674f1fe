//! Generic HTTP provider client
//!
//! Forwards an `Operation` to `base_url + path`, authenticating with the
//! selected session cookie. When the provider sits behind an anti-bot
//! challenge, the clearance cookie and the user agent that solved it are
//! attached as well. Response bodies are not interpreted: a 2xx body is
//! returned verbatim and anything else becomes `UpstreamError::Status`.

use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;

use reqwest::header::{COOKIE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use tracing::{debug, warn};

use crate::{ProviderClient, ProviderKind, RawResult, UpstreamCall, UpstreamError};

/// Name of the cookie carrying the clearance token.
const CLEARANCE_COOKIE: &str = "cf_clearance";

/// User agent sent when no clearance fingerprint dictates one.
const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Extra header sent on every upstream call (name + value pair from config).
#[derive(Debug, Clone)]
pub struct HeaderInjection {
    pub name: String,
    pub value: String,
}

/// Session-cookie authenticated HTTP client for one provider.
pub struct HttpProvider {
    kind: ProviderKind,
    base_url: String,
    session_cookie: String,
    requires_clearance: bool,
    headers: Vec<HeaderInjection>,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(
        kind: ProviderKind,
        base_url: impl Into<String>,
        session_cookie: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            kind,
            base_url: base_url.into(),
            session_cookie: session_cookie.into(),
            requires_clearance: false,
            headers: Vec::new(),
            timeout: Duration::from_secs(120),
            client,
        }
    }

    pub fn with_clearance(mut self, required: bool) -> Self {
        self.requires_clearance = required;
        self
    }

    pub fn with_headers(mut self, headers: Vec<HeaderInjection>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build the outbound header map for one call.
    ///
    /// Configured injections may not overwrite the cookie or user agent,
    /// since those carry the credential and the clearance fingerprint.
    fn build_headers(&self, call: &UpstreamCall<'_>) -> crate::Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        for injection in &self.headers {
            let name = match HeaderName::from_str(&injection.name) {
                Ok(n) => n,
                Err(e) => {
                    warn!(header = %injection.name, error = %e, "skipping invalid header name");
                    continue;
                }
            };
            if name == COOKIE || name == USER_AGENT {
                warn!(header = %injection.name, "refusing to overwrite credential-bearing header");
                continue;
            }
            let value = match HeaderValue::from_str(&injection.value) {
                Ok(v) => v,
                Err(e) => {
                    warn!(header = %injection.name, error = %e, "skipping invalid header value");
                    continue;
                }
            };
            headers.insert(name, value);
        }

        let session = format!("{}={}", self.session_cookie, call.secret.expose().trim());
        HeaderValue::from_str(&session)
            .map_err(|e| UpstreamError::Credential(format!("session cookie: {e}")))?;

        let mut cookie = session;
        let mut user_agent = HeaderValue::from_static(DEFAULT_USER_AGENT);

        if self.requires_clearance {
            match call.clearance {
                Some(token) => {
                    // A malformed solver reply is the token's fault, not the session's
                    let clearance = format!("{CLEARANCE_COOKIE}={}", token.value.expose());
                    HeaderValue::from_str(&clearance).map_err(|e| {
                        UpstreamError::Clearance(format!("clearance cookie: {e}"))
                    })?;
                    cookie.push_str("; ");
                    cookie.push_str(&clearance);
                    if !token.user_agent.is_empty() {
                        user_agent = HeaderValue::from_str(&token.user_agent).map_err(|e| {
                            UpstreamError::Clearance(format!("clearance user agent: {e}"))
                        })?;
                    }
                }
                None => debug!(provider = %self.kind, "no clearance token available, sending without"),
            }
        }

        let cookie = HeaderValue::from_str(&cookie)
            .map_err(|e| UpstreamError::Credential(format!("cookie header: {e}")))?;
        headers.insert(COOKIE, cookie);
        headers.insert(USER_AGENT, user_agent);

        Ok(headers)
    }
}

impl ProviderClient for HttpProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn requires_clearance(&self) -> bool {
        self.requires_clearance
    }

    fn execute<'a>(
        &'a self,
        call: UpstreamCall<'a>,
    ) -> Pin<Box<dyn Future<Output = crate::Result<RawResult>> + Send + 'a>> {
        Box::pin(async move {
            let operation = call.operation;
            if !operation.path.starts_with('/') {
                return Err(UpstreamError::InvalidRequest(format!(
                    "path must start with '/': {}",
                    operation.path
                )));
            }

            let headers = self.build_headers(&call)?;
            let url = format!("{}{}", self.base_url.trim_end_matches('/'), operation.path);

            let mut request = self
                .client
                .request(operation.method.clone(), &url)
                .headers(headers)
                .timeout(self.timeout);
            if let Some(body) = &operation.body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) if e.is_timeout() => return Err(UpstreamError::Timeout),
                Err(e) => return Err(UpstreamError::Network(e.to_string())),
            };

            let status = response.status();
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            let body = match response.bytes().await {
                Ok(b) => b,
                Err(e) if e.is_timeout() => return Err(UpstreamError::Timeout),
                Err(e) => return Err(UpstreamError::Network(format!("reading body: {e}"))),
            };

            if status.is_success() {
                Ok(RawResult {
                    status: status.as_u16(),
                    content_type,
                    body,
                })
            } else {
                Err(UpstreamError::Status {
                    status: status.as_u16(),
                    body: String::from_utf8_lossy(&body).into_owned(),
                })
            }
        })
    }
}
