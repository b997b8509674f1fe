//! Challenge solver client
//!
//! The solver is an external service; this module only speaks its HTTP API.
//! `FlareSolverr` drives a headless browser to `target`, waits for the
//! challenge to clear and returns the resulting cookies and user agent.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Cookie set by the challenge page once passed.
const CLEARANCE_COOKIE: &str = "cf_clearance";

/// Extra time given to the HTTP call on top of the solver's own budget.
const REQUEST_GRACE: Duration = Duration::from_secs(15);

/// Output of one successful solve.
#[derive(Debug, Clone)]
pub struct Solved {
    pub token: String,
    pub user_agent: String,
    /// Lifetime reported by the solver, when the cookie carried an expiry.
    pub ttl: Option<Duration>,
}

/// External challenge solver.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Solver>`).
pub trait Solver: Send + Sync {
    /// Pass the challenge at `target` and return the clearance artifacts.
    fn solve<'a>(&'a self, target: &'a str)
    -> Pin<Box<dyn Future<Output = Result<Solved>> + Send + 'a>>;

    /// Check that the solver is reachable before relying on it.
    fn probe<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async { Ok(()) })
    }
}

/// FlareSolverr v1 API client.
pub struct FlareSolverr {
    url: String,
    proxy: Option<String>,
    max_timeout: Duration,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct SolveResponse {
    status: String,
    #[serde(default)]
    message: String,
    solution: Option<Solution>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Solution {
    #[serde(default)]
    cookies: Vec<Cookie>,
    #[serde(default)]
    user_agent: String,
}

#[derive(Debug, Deserialize)]
struct Cookie {
    name: String,
    value: String,
    /// Unix seconds; -1 for session cookies.
    #[serde(default)]
    expires: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ProbeResponse {
    #[serde(default)]
    msg: String,
    #[serde(default)]
    version: Option<String>,
}

impl FlareSolverr {
    pub fn new(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            proxy: None,
            max_timeout: Duration::from_secs(60),
            client,
        }
    }

    /// Route the solver's browser through `proxy` (e.g. `socks5://host:1080`).
    pub fn with_proxy(mut self, proxy: Option<String>) -> Self {
        self.proxy = proxy.filter(|p| !p.trim().is_empty());
        self
    }

    pub fn with_max_timeout(mut self, max_timeout: Duration) -> Self {
        self.max_timeout = max_timeout;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/v1", self.url.trim_end_matches('/'))
    }

    fn request_body(&self, target: &str) -> serde_json::Value {
        let mut body = serde_json::json!({
            "cmd": "request.get",
            "url": target,
            "maxTimeout": self.max_timeout.as_millis() as u64,
        });
        if let Some(proxy) = &self.proxy {
            body["proxy"] = serde_json::json!({ "url": proxy });
        }
        body
    }
}

impl Solver for FlareSolverr {
    fn solve<'a>(
        &'a self,
        target: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Solved>> + Send + 'a>> {
        Box::pin(async move {
            debug!(target, proxied = self.proxy.is_some(), "requesting challenge solve");

            let response = self
                .client
                .post(self.endpoint())
                .json(&self.request_body(target))
                .timeout(self.max_timeout + REQUEST_GRACE)
                .send()
                .await
                .map_err(|e| Error::Http(format!("solve request failed: {e}")))?;

            let status = response.status();
            if !status.is_success() {
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| String::from("<no body>"));
                return Err(Error::Http(format!("solver returned {status}: {body}")));
            }

            let parsed = response
                .json::<SolveResponse>()
                .await
                .map_err(|e| Error::Solver(format!("invalid solver response: {e}")))?;
            parse_solution(parsed, chrono::Utc::now().timestamp())
        })
    }

    fn probe<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let response = self
                .client
                .get(&self.url)
                .timeout(Duration::from_secs(10))
                .send()
                .await
                .map_err(|e| Error::Http(format!("probe failed: {e}")))?;

            let parsed = response
                .json::<ProbeResponse>()
                .await
                .map_err(|e| Error::Solver(format!("unexpected probe response: {e}")))?;

            if parsed.msg.contains("FlareSolverr") {
                info!(version = ?parsed.version, "challenge solver reachable");
                Ok(())
            } else {
                warn!(msg = %parsed.msg, "service at solver url does not look like FlareSolverr");
                Err(Error::Solver(format!("unexpected probe message: {}", parsed.msg)))
            }
        })
    }
}

/// Extract the clearance cookie and user agent from a solver reply.
fn parse_solution(response: SolveResponse, now_secs: i64) -> Result<Solved> {
    if response.status != "ok" {
        return Err(Error::Solver(format!(
            "status {}: {}",
            response.status, response.message
        )));
    }
    let solution = response
        .solution
        .ok_or_else(|| Error::Solver("reply has no solution".into()))?;

    let cookie = solution
        .cookies
        .into_iter()
        .find(|c| c.name == CLEARANCE_COOKIE)
        .ok_or(Error::MissingCookie)?;

    let ttl = cookie
        .expires
        .map(|e| e as i64 - now_secs)
        .filter(|remaining| *remaining > 0)
        .map(|remaining| Duration::from_secs(remaining as u64));

    Ok(Solved {
        token: cookie.value,
        user_agent: solution.user_agent,
        ttl,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn response(json: serde_json::Value) -> SolveResponse {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn parses_clearance_cookie_and_user_agent() {
        let reply = response(serde_json::json!({
            "status": "ok",
            "message": "Challenge solved!",
            "solution": {
                "url": "https://grok.com/",
                "status": 200,
                "cookies": [
                    {"name": "__cf_bm", "value": "bm", "expires": 1_700_001_800.0},
                    {"name": "cf_clearance", "value": "clear-123", "expires": 1_700_003_600.5}
                ],
                "userAgent": "Mozilla/5.0 Solver"
            }
        }));

        let solved = parse_solution(reply, 1_700_000_000).unwrap();
        assert_eq!(solved.token, "clear-123");
        assert_eq!(solved.user_agent, "Mozilla/5.0 Solver");
        assert_eq!(solved.ttl, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn session_cookie_has_no_ttl() {
        let reply = response(serde_json::json!({
            "status": "ok",
            "solution": {
                "cookies": [{"name": "cf_clearance", "value": "v", "expires": -1}],
                "userAgent": "UA"
            }
        }));
        assert_eq!(parse_solution(reply, 1_700_000_000).unwrap().ttl, None);
    }

    #[test]
    fn missing_cookie_is_error() {
        let reply = response(serde_json::json!({
            "status": "ok",
            "solution": {"cookies": [{"name": "other", "value": "x"}], "userAgent": "UA"}
        }));
        assert!(matches!(
            parse_solution(reply, 0).unwrap_err(),
            Error::MissingCookie
        ));
    }

    #[test]
    fn error_status_is_solver_error() {
        let reply = response(serde_json::json!({
            "status": "error",
            "message": "Error solving the challenge. Timeout after 60.0 seconds."
        }));
        let err = parse_solution(reply, 0).unwrap_err();
        assert!(err.to_string().contains("Timeout after 60.0 seconds"));
    }

    #[test]
    fn request_body_includes_proxy_when_set() {
        let solver = FlareSolverr::new("http://solver:8191/", reqwest::Client::new())
            .with_proxy(Some("socks5://proxy:1080".into()))
            .with_max_timeout(Duration::from_secs(30));
        let body = solver.request_body("https://grok.com");
        assert_eq!(body["cmd"], "request.get");
        assert_eq!(body["url"], "https://grok.com");
        assert_eq!(body["maxTimeout"], 30_000);
        assert_eq!(body["proxy"]["url"], "socks5://proxy:1080");
        assert_eq!(solver.endpoint(), "http://solver:8191/v1");
    }

    #[test]
    fn blank_proxy_is_ignored() {
        let solver =
            FlareSolverr::new("http://solver:8191", reqwest::Client::new()).with_proxy(Some(" ".into()));
        assert!(solver.request_body("https://grok.com").get("proxy").is_none());
    }

    async fn start_mock_solver() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let app = axum::Router::new()
                .route(
                    "/",
                    axum::routing::get(|| async {
                        axum::Json(serde_json::json!({
                            "msg": "FlareSolverr is ready!",
                            "version": "3.3.21"
                        }))
                    }),
                )
                .route(
                    "/v1",
                    axum::routing::post(|axum::Json(body): axum::Json<serde_json::Value>| async move {
                        axum::Json(serde_json::json!({
                            "status": "ok",
                            "solution": {
                                "url": body["url"],
                                "cookies": [{"name": "cf_clearance", "value": "from-mock"}],
                                "userAgent": "MockBrowser/2.0"
                            }
                        }))
                    }),
                );
            axum::serve(listener, app).await.unwrap();
        });
        url
    }

    #[tokio::test]
    async fn solves_against_http_solver() {
        let url = start_mock_solver().await;
        let solver = FlareSolverr::new(url, reqwest::Client::new());

        solver.probe().await.unwrap();
        let solved = solver.solve("https://grok.com").await.unwrap();
        assert_eq!(solved.token, "from-mock");
        assert_eq!(solved.user_agent, "MockBrowser/2.0");
        assert_eq!(solved.ttl, None);
    }

    #[tokio::test]
    async fn probe_fails_when_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let solver = FlareSolverr::new(format!("http://{addr}"), reqwest::Client::new());
        assert!(matches!(solver.probe().await.unwrap_err(), Error::Http(_)));
    }
}
