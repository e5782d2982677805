//! Shared HTTP client for the REST adapters.
//!
//! Every adapter issues plain public `GET`s and gets back a JSON document, so
//! one client handles transport concerns and maps HTTP-level failures into the
//! [`KfError`] taxonomy:
//!
//! | condition                       | error                        |
//! |---------------------------------|------------------------------|
//! | 429                             | `RateLimited { retry_after }`|
//! | other status >= 400             | `Api { status, message }`    |
//! | request deadline exceeded       | `Timeout`                    |
//! | connect / transport failure     | `Connection`                 |
//! | body is not JSON                | `Parse`                      |

use std::time::Duration;

use kf_core::KfError;
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use serde_json::Value;
use tracing::debug;

use crate::json_util::truncate_body;

const USER_AGENT: &str = concat!("kline-feed/", env!("CARGO_PKG_VERSION"));

/// Longest error body kept in [`KfError::Api`] messages.
const MAX_ERROR_BODY: usize = 200;

/// Cheap-to-clone wrapper around a pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
}

impl RestClient {
    pub fn new(timeout: Duration) -> Result<Self, KfError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| KfError::Config(format!("http client: {e}")))?;
        Ok(Self { http })
    }

    /// Wrap an already configured `reqwest::Client`.
    pub fn with_http(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// `GET url?query` and decode the body as JSON.
    pub async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value, KfError> {
        debug!("GET {url} {query:?}");
        let resp = self.http.get(url).query(query).send().await.map_err(map_transport)?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            return Err(KfError::RateLimited { retry_after });
        }
        if status.is_client_error() || status.is_server_error() {
            let body = resp.text().await.unwrap_or_default();
            return Err(KfError::Api { status: status.as_u16(), message: truncate_body(&body, MAX_ERROR_BODY) });
        }

        let bytes = resp.bytes().await.map_err(map_transport)?;
        serde_json::from_slice(&bytes).map_err(|e| KfError::parse(format!("invalid JSON from {url}: {e}")))
    }
}

fn map_transport(e: reqwest::Error) -> KfError {
    if e.is_timeout() {
        KfError::Timeout(e.to_string())
    } else {
        KfError::Connection(e.to_string())
    }
}

/// `Retry-After` in its delay-seconds form. HTTP-date values are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
