//! Lambda Runtime API client
//!
//! Pulls invocations from `AWS_LAMBDA_RUNTIME_API`, hands each event to the
//! [`BatchHandler`], and posts back either the batch response or an
//! invocation error.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error, info, warn};

use crate::batch::{BatchHandler, SqsEvent};
use crate::error::{PulseError, Result};

const API_VERSION: &str = "2018-06-01";
const REQUEST_ID_HEADER: &str = "Lambda-Runtime-Aws-Request-Id";

/// Environment variable holding the Runtime API host:port
pub const RUNTIME_API_ENV: &str = "AWS_LAMBDA_RUNTIME_API";

/// Sleep after a failed `next` call
const NEXT_BACKOFF: Duration = Duration::from_secs(1);

/// One pending invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub request_id: String,
    pub body: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorPayload {
    error_message: String,
    error_type: String,
}

impl From<&PulseError> for ErrorPayload {
    fn from(e: &PulseError) -> Self {
        Self {
            error_message: e.to_string(),
            error_type: error_type(e).to_string(),
        }
    }
}

fn error_type(e: &PulseError) -> &'static str {
    match e {
        PulseError::InvalidEvent(_) => "InvalidEvent",
        PulseError::BatchItemFailed(_) => "BatchItemFailed",
        PulseError::Configuration(_) => "Configuration",
        PulseError::Queue(_) => "QueueError",
        _ => "HandlerError",
    }
}

/// Invocation loop against the Lambda Runtime API
pub struct LambdaRuntime {
    base_url: String,
    http: reqwest::Client,
    handler: BatchHandler,
}

impl LambdaRuntime {
    /// Create a runtime for `host:port`
    pub fn new(runtime_api: &str, handler: BatchHandler) -> Result<Self> {
        debug!(%runtime_api, "LambdaRuntime::new: called");
        if runtime_api.is_empty() {
            return Err(PulseError::Runtime(format!("{} is empty", RUNTIME_API_ENV)));
        }
        let http = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|e| PulseError::Runtime(e.to_string()))?;
        Ok(Self {
            base_url: format!("http://{}/{}/runtime", runtime_api.trim_end_matches('/'), API_VERSION),
            http,
            handler,
        })
    }

    /// Create a runtime from `AWS_LAMBDA_RUNTIME_API`
    pub fn from_env(handler: BatchHandler) -> Result<Self> {
        let runtime_api = std::env::var(RUNTIME_API_ENV)
            .map_err(|_| PulseError::Runtime(format!("{} is not set", RUNTIME_API_ENV)))?;
        Self::new(&runtime_api, handler)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Serve invocations until shutdown
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        info!(base_url = %self.base_url, "Lambda runtime starting");

        loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => {
                    info!("Shutdown signal received");
                    break;
                }
                Err(TryRecvError::Empty) => {}
            }

            let next = tokio::select! {
                next = self.next_invocation() => next,
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received while waiting for invocation");
                    break;
                }
            };

            match next {
                Ok(invocation) => {
                    if let Err(e) = self.process(invocation).await {
                        error!(error = %e, "Failed to report invocation result");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to fetch next invocation");
                    tokio::select! {
                        _ = tokio::time::sleep(NEXT_BACKOFF) => {}
                        _ = shutdown_rx.recv() => break,
                    }
                }
            }
        }

        info!("Lambda runtime stopped");
        Ok(())
    }

    /// Block until the platform hands out the next invocation
    pub async fn next_invocation(&self) -> Result<Invocation> {
        let url = format!("{}/invocation/next", self.base_url);
        debug!(%url, "LambdaRuntime::next_invocation: called");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| PulseError::Runtime(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PulseError::Runtime(format!("next invocation returned {}", response.status())));
        }

        let request_id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| PulseError::Runtime(format!("missing {} header", REQUEST_ID_HEADER)))?;
        let body = response.text().await.map_err(|e| PulseError::Runtime(e.to_string()))?;

        Ok(Invocation { request_id, body })
    }

    /// Handle one invocation and report its result
    ///
    /// The returned error covers only reporting; handler failures are posted
    /// to the invocation error endpoint.
    pub async fn process(&self, invocation: Invocation) -> Result<()> {
        debug!(request_id = %invocation.request_id, "LambdaRuntime::process: called");

        let outcome = match serde_json::from_str::<SqsEvent>(&invocation.body) {
            Ok(event) => self.handler.handle_event(event).await,
            Err(e) => Err(PulseError::InvalidEvent(e.to_string())),
        };

        match outcome {
            Ok(response) => {
                let url = format!("{}/invocation/{}/response", self.base_url, invocation.request_id);
                self.post(&url, &response).await
            }
            Err(e) => {
                warn!(request_id = %invocation.request_id, error = %e, "Invocation failed");
                let url = format!("{}/invocation/{}/error", self.base_url, invocation.request_id);
                self.post(&url, &ErrorPayload::from(&e)).await
            }
        }
    }

    async fn post<T: Serialize + Sync>(&self, url: &str, payload: &T) -> Result<()> {
        let response = self
            .http
            .post(url)
            .json(payload)
            .send()
            .await
            .map_err(|e| PulseError::Runtime(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PulseError::Runtime(format!("{} returned {}", url, response.status())));
        }
        Ok(())
    }
}
