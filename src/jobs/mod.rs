//! Client for the external matching job service.
//!
//! The job service owns feature extraction and similarity scoring. This side
//! only triggers jobs and interprets whatever outcome comes back synchronously;
//! deployments that answer asynchronously write results back through the
//! signed callback endpoints instead.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::api::metrics::record_job_request;
use crate::config::JobsConfig;
use crate::error::{Error, Result};

#[cfg(test)]
pub(crate) mod fake;

/// Outcome of a matching job, when the service reports one inline.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub identified: bool,
    pub feature_vector: Option<Vec<f64>>,
}

#[async_trait]
pub trait MatchingJobClient: Send + Sync {
    /// A challenge sentence for the user to read aloud.
    async fn request_sentence(&self) -> Result<String>;

    /// Match the user's latest identification attempt against their enrollment.
    ///
    /// `Ok(None)` means the job was accepted and the outcome will arrive later.
    async fn request_identification(&self, user: Uuid) -> Result<Option<JobOutcome>>;

    /// Normalise and extract features for all three reference recordings.
    async fn process_reference_recordings(&self, user: Uuid) -> Result<()>;
}

#[derive(Serialize)]
struct UserJob {
    user_rid: String,
}

/// `MatchingJobClient` over HTTP. No retries: failures surface as `JobUnavailable`.
pub struct HttpMatchingJobClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMatchingJobClient {
    pub fn new(config: &JobsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(concat!("voicegate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Internal(format!("failed to build job client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<String> {
        let url = format!("{}{}", self.base_url, path);
        let started = std::time::Instant::now();

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(url = %url, error = %e, "Job request failed");
                Error::JobUnavailable(describe(&e))
            })?;

        let status = response.status();
        record_job_request(path, started.elapsed().as_secs_f64());

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(url = %url, status = %status, body = %body, "Job service returned an error");
            return Err(Error::JobUnavailable(format!("job service returned {status}")));
        }

        response
            .text()
            .await
            .map_err(|e| Error::JobUnavailable(describe(&e)))
    }
}

fn describe(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "request timed out".to_string()
    } else if err.is_connect() {
        "connection failed".to_string()
    } else {
        err.to_string()
    }
}

#[async_trait]
impl MatchingJobClient for HttpMatchingJobClient {
    async fn request_sentence(&self) -> Result<String> {
        let body = self.post("/jobs/createSentence", &serde_json::json!({})).await?;
        parse_sentence(&body)
    }

    async fn request_identification(&self, user: Uuid) -> Result<Option<JobOutcome>> {
        let body = self
            .post(
                "/jobs/identify",
                &UserJob {
                    user_rid: user.to_string(),
                },
            )
            .await?;
        parse_outcome(&body)
    }

    async fn process_reference_recordings(&self, user: Uuid) -> Result<()> {
        self.post(
            "/jobs/ProcessReferenceRecordings",
            &UserJob {
                user_rid: user.to_string(),
            },
        )
        .await?;
        Ok(())
    }
}

/// Accepts a bare JSON string or `{"sentence": ".."}`.
fn parse_sentence(body: &str) -> Result<String> {
    let sentence = match serde_json::from_str::<Value>(body) {
        Ok(Value::String(s)) => Some(s),
        Ok(Value::Object(map)) => map
            .get("sentence")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    };

    sentence
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| Error::JobUnavailable("job service returned no sentence".to_string()))
}

/// Accepts `true`/`false`, `{"identified": bool, "feature_vector": [..]}`,
/// or an empty/`null` body for asynchronous deployments. Anything else is
/// treated as a failed job so the attempt gets dispatched again.
fn parse_outcome(body: &str) -> Result<Option<JobOutcome>> {
    let body = body.trim();
    if body.is_empty() {
        return Ok(None);
    }

    let unrecognised = || Error::JobUnavailable("unrecognised job outcome".to_string());
    match serde_json::from_str::<Value>(body).map_err(|_| unrecognised())? {
        Value::Null => Ok(None),
        Value::Bool(identified) => Ok(Some(JobOutcome {
            identified,
            feature_vector: None,
        })),
        Value::Object(map) => {
            let identified = map
                .get("identified")
                .and_then(Value::as_bool)
                .ok_or_else(unrecognised)?;
            let feature_vector = map
                .get("feature_vector")
                .and_then(|v| serde_json::from_value::<Vec<f64>>(v.clone()).ok());
            Ok(Some(JobOutcome {
                identified,
                feature_vector,
            }))
        }
        _ => Err(unrecognised()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};

    #[test]
    fn test_parse_outcome_shapes() {
        assert_eq!(
            parse_outcome("true").unwrap(),
            Some(JobOutcome {
                identified: true,
                feature_vector: None
            })
        );
        assert_eq!(
            parse_outcome(r#"{"identified": false, "feature_vector": [1.5, 2.0]}"#).unwrap(),
            Some(JobOutcome {
                identified: false,
                feature_vector: Some(vec![1.5, 2.0])
            })
        );
        assert_eq!(parse_outcome("").unwrap(), None);
        assert_eq!(parse_outcome("null").unwrap(), None);
    }

    #[test]
    fn test_unrecognised_outcome_is_a_failed_job() {
        for body in [r#"{"status": "queued"}"#, "<html>upstream error</html>", "42"] {
            assert!(
                matches!(parse_outcome(body), Err(Error::JobUnavailable(_))),
                "{body}"
            );
        }
    }

    #[test]
    fn test_parse_sentence_shapes() {
        assert_eq!(parse_sentence(r#""the quick fox""#).unwrap(), "the quick fox");
        assert_eq!(
            parse_sentence(r#"{"sentence": "blue whales sing"}"#).unwrap(),
            "blue whales sing"
        );
        assert!(matches!(parse_sentence("{}"), Err(Error::JobUnavailable(_))));
        assert!(matches!(parse_sentence(r#""""#), Err(Error::JobUnavailable(_))));
    }

    async fn spawn_job_service(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn client_for(base_url: String) -> HttpMatchingJobClient {
        HttpMatchingJobClient::new(&JobsConfig {
            base_url,
            timeout_seconds: 2,
            callback_secret: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_http_client_round_trip() {
        let router = Router::new()
            .route("/jobs/createSentence", post(|| async { Json("read this aloud") }))
            .route(
                "/jobs/identify",
                post(|Json(body): Json<Value>| async move {
                    assert!(body["user_rid"].is_string());
                    Json(serde_json::json!({"identified": true, "feature_vector": [0.5]}))
                }),
            )
            .route("/jobs/ProcessReferenceRecordings", post(|| async { StatusCode::OK }));
        let client = client_for(spawn_job_service(router).await);

        assert_eq!(client.request_sentence().await.unwrap(), "read this aloud");
        let outcome = client
            .request_identification(Uuid::new_v4())
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.identified);
        client
            .process_reference_recordings(Uuid::new_v4())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_non_success_maps_to_job_unavailable() {
        let router = Router::new().route(
            "/jobs/identify",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let client = client_for(spawn_job_service(router).await);

        let err = client
            .request_identification(Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::JobUnavailable(_)));
    }

    #[tokio::test]
    async fn test_unreachable_service_maps_to_job_unavailable() {
        // Bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client_for(format!("http://{addr}"));
        let err = client.request_sentence().await.unwrap_err();
        assert!(matches!(err, Error::JobUnavailable(_)));
    }

    #[tokio::test]
    async fn test_slow_service_times_out() {
        let router = Router::new().route(
            "/jobs/identify",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(true)
            }),
        );
        let client = HttpMatchingJobClient::new(&JobsConfig {
            base_url: spawn_job_service(router).await,
            timeout_seconds: 1,
            callback_secret: None,
        })
        .unwrap();

        let started = std::time::Instant::now();
        let err = client
            .request_identification(Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(4));
        match err {
            Error::JobUnavailable(reason) => assert_eq!(reason, "request timed out"),
            other => panic!("expected job unavailable, got {other:?}"),
        }
    }
}
