//! Loopback HTTP server for adapter tests: every request gets the same
//! canned status and JSON body, and request targets are recorded.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::{StatusCode, Uri, header};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::rest::RestClient;

pub(crate) struct HttpStub {
    pub base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl HttpStub {
    pub async fn serve(status: u16, body: &str) -> Self {
        let status = StatusCode::from_u16(status).unwrap();
        let body = body.to_string();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        let app = Router::new().fallback(move |uri: Uri| {
            let seen = Arc::clone(&seen);
            let body = body.clone();
            async move {
                seen.lock().push(uri.to_string());
                (status, [(header::CONTENT_TYPE, "application/json")], body)
            }
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { base_url: format!("http://{addr}"), requests, task }
    }

    pub async fn ok(body: &str) -> Self {
        Self::serve(200, body).await
    }

    /// Path and query of every request served so far.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    /// Client that ignores any proxy configured in the environment.
    pub fn client() -> RestClient {
        let http = reqwest::Client::builder().no_proxy().timeout(Duration::from_secs(5)).build().unwrap();
        RestClient::with_http(http)
    }
}

impl Drop for HttpStub {
    fn drop(&mut self) {
        self.task.abort();
    }
}
