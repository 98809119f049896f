//! HTTP evaluation backend: submit a simulation, poll it to completion and
//! fetch the resulting alpha.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, LOCATION, RETRY_AFTER};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use sweep_types::{
    AlphaDocument, Configuration, EvaluationError, EvaluationResult, SimulationResult,
};
use tracing::debug;

use crate::evaluator::Evaluator;
use crate::session::AuthenticatedSession;

/// Status codes worth another attempt.
const RETRYABLE_STATUS: [u16; 5] = [429, 500, 502, 503, 504];

/// Progress document returned while polling a simulation.
#[derive(Debug, Default, Deserialize)]
struct SimulationProgress {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    alpha: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Evaluates configurations by simulating the base alpha with the
/// configuration written into its settings.
#[derive(Debug, Clone)]
pub struct BrainEvaluator {
    session: AuthenticatedSession,
    alpha: AlphaDocument,
    /// Poll delay used when the backend sends no `Retry-After`.
    poll_interval: Duration,
}

impl BrainEvaluator {
    pub fn new(session: AuthenticatedSession, alpha: AlphaDocument) -> Self {
        Self {
            session,
            alpha,
            poll_interval: Duration::from_secs(5),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn submit(&self, configuration: &Configuration) -> EvaluationResult<String> {
        let body = self.alpha.apply(configuration);
        let response = self
            .session
            .post("/simulations")
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;

        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| EvaluationError::permanent("simulation accepted without a Location"))
    }

    async fn wait_for_alpha(&self, location: &str) -> EvaluationResult<String> {
        loop {
            let response = self
                .session
                .get(location)
                .send()
                .await
                .map_err(transport_error)?;
            let response = check_status(response).await?;

            if let Some(wait) = retry_after(response.headers()) {
                tokio::time::sleep(wait).await;
                continue;
            }

            let progress: SimulationProgress = response.json().await.map_err(|e| {
                EvaluationError::transient(format!("unreadable simulation progress: {e}"))
            })?;

            match progress.status.as_deref() {
                Some("ERROR") | Some("FAIL") => {
                    return Err(EvaluationError::permanent(
                        progress
                            .message
                            .unwrap_or_else(|| "simulation failed".to_string()),
                    ))
                }
                Some("COMPLETE") | Some("WARNING") | None => {}
                Some(other) => {
                    debug!(location, status = other, "simulation still running");
                    tokio::time::sleep(self.poll_interval).await;
                    continue;
                }
            }

            // A finished simulation without an alpha ran too long on the
            // backend; it is worth submitting again.
            return progress.alpha.ok_or_else(|| {
                EvaluationError::transient(
                    progress
                        .message
                        .unwrap_or_else(|| "simulation finished without an alpha id".to_string()),
                )
            });
        }
    }

    async fn fetch_alpha(&self, alpha_id: &str) -> EvaluationResult<SimulationResult> {
        let response = self
            .session
            .get(&format!("/alphas/{alpha_id}"))
            .send()
            .await
            .map_err(transport_error)?;
        let response = check_status(response).await?;
        response
            .json::<SimulationResult>()
            .await
            .map_err(|e| EvaluationError::transient(format!("unreadable alpha {alpha_id}: {e}")))
    }
}

#[async_trait]
impl Evaluator for BrainEvaluator {
    async fn evaluate(&self, configuration: &Configuration) -> EvaluationResult<SimulationResult> {
        let location = self.submit(configuration).await?;
        debug!(configuration = %configuration, location = %location, "simulation submitted");
        let alpha_id = self.wait_for_alpha(&location).await?;
        self.fetch_alpha(&alpha_id).await
    }
}

fn transport_error(e: reqwest::Error) -> EvaluationError {
    if e.is_builder() {
        EvaluationError::permanent(format!("malformed request: {e}"))
    } else {
        EvaluationError::transient(format!("request failed: {e}"))
    }
}

/// Turn a non-success response into the matching evaluation error.
async fn check_status(response: reqwest::Response) -> EvaluationResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let hint = retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, hint, &body))
}

pub(crate) fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> EvaluationError {
    let message = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{status}: {}", body.trim())
    };
    if RETRYABLE_STATUS.contains(&status.as_u16()) {
        EvaluationError::Transient {
            message,
            retry_after,
        }
    } else {
        EvaluationError::Permanent { message }
    }
}

/// `Retry-After` in (possibly fractional) seconds; zero means "no wait".
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(Duration::from_secs_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn rate_limit_is_transient_with_hint() {
        let err = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(3)),
            "SIMULATION_LIMIT_EXCEEDED",
        );
        assert_eq!(
            err,
            EvaluationError::Transient {
                message: "429 Too Many Requests: SIMULATION_LIMIT_EXCEEDED".into(),
                retry_after: Some(Duration::from_secs(3)),
            }
        );
    }

    #[test]
    fn server_errors_are_transient() {
        for code in [500, 502, 503, 504] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(classify_status(status, None, "").is_transient());
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        for code in [400, 401, 403, 404] {
            let status = StatusCode::from_u16(code).unwrap();
            assert!(!classify_status(status, None, "nope").is_transient());
        }
    }

    #[test]
    fn parses_retry_after() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("2.5"));
        assert_eq!(retry_after(&headers), Some(Duration::from_millis(2500)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("0"));
        assert_eq!(retry_after(&headers), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn progress_document_shapes() {
        let done: SimulationProgress =
            serde_json::from_str(r#"{"id":"s1","status":"COMPLETE","alpha":"a1"}"#).unwrap();
        assert_eq!(done.alpha.as_deref(), Some("a1"));

        let failed: SimulationProgress =
            serde_json::from_str(r#"{"status":"ERROR","message":"Unknown variable \"clse\""}"#)
                .unwrap();
        assert_eq!(failed.status.as_deref(), Some("ERROR"));
        assert!(failed.message.unwrap().contains("clse"));
    }
}
