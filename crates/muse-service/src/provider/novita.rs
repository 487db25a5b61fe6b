//! Novita async txt2img client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use muse_core::GeneratedAsset;

use super::{ImageProvider, ProviderError, ProviderRequest, ProviderTaskReport, ProviderTaskStatus};

/// Callback event type that carries a task result.
const TASK_RESULT_EVENT: &str = "ASYNC_TASK_RESULT";

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Serialize)]
struct Txt2ImgRequest<'a> {
    extra: Txt2ImgExtra<'a>,
    request: Txt2ImgParams<'a>,
}

#[derive(Debug, Serialize)]
struct Txt2ImgExtra<'a> {
    response_image_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    webhook: Option<WebhookTarget<'a>>,
}

#[derive(Debug, Serialize)]
struct WebhookTarget<'a> {
    url: &'a str,
}

#[derive(Debug, Serialize)]
struct Txt2ImgParams<'a> {
    model_name: &'a str,
    prompt: &'a str,
    negative_prompt: &'a str,
    width: u32,
    height: u32,
    image_num: u32,
    steps: u32,
    seed: i64,
    sampler_name: &'a str,
    guidance_scale: f32,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct TaskResultResponse {
    task: TaskInfo,
    #[serde(default)]
    images: Vec<ImageInfo>,
}

#[derive(Debug, Deserialize)]
struct TaskInfo {
    task_id: String,
    status: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    progress_percent: u8,
}

#[derive(Debug, Deserialize)]
struct ImageInfo {
    image_url: String,
    #[serde(default)]
    image_type: Option<String>,
    #[serde(default)]
    image_url_ttl: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CallbackEnvelope {
    event_type: String,
    #[serde(default)]
    payload: Option<TaskResultResponse>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl<'a> Txt2ImgRequest<'a> {
    fn new(request: &'a ProviderRequest) -> Self {
        let generation = &request.generation;
        Self {
            extra: Txt2ImgExtra {
                response_image_type: "jpeg",
                webhook: request
                    .webhook_url
                    .as_deref()
                    .map(|url| WebhookTarget { url }),
            },
            request: Txt2ImgParams {
                model_name: &generation.model,
                prompt: &generation.prompt,
                negative_prompt: &generation.negative_prompt,
                width: generation.width,
                height: generation.height,
                image_num: generation.image_count,
                steps: generation.steps,
                seed: generation.seed,
                sampler_name: &generation.sampler_name,
                guidance_scale: generation.guidance_scale,
            },
        }
    }
}

impl TaskResultResponse {
    fn into_report(self) -> Result<ProviderTaskReport, ProviderError> {
        let status = match self.task.status.as_str() {
            "TASK_STATUS_QUEUED" => ProviderTaskStatus::Queued,
            "TASK_STATUS_PROCESSING" => ProviderTaskStatus::Processing {
                progress: self.task.progress_percent.min(100),
            },
            "TASK_STATUS_SUCCEED" if self.images.is_empty() => ProviderTaskStatus::Failed {
                reason: "provider returned no images".into(),
            },
            "TASK_STATUS_SUCCEED" => ProviderTaskStatus::Succeeded {
                assets: self
                    .images
                    .into_iter()
                    .map(|image| GeneratedAsset {
                        url: image.image_url,
                        image_type: image.image_type,
                        url_ttl_seconds: image.image_url_ttl,
                    })
                    .collect(),
            },
            "TASK_STATUS_FAILED" => ProviderTaskStatus::Failed {
                reason: if self.task.reason.is_empty() {
                    "provider reported failure".into()
                } else {
                    self.task.reason
                },
            },
            other => {
                return Err(ProviderError::Malformed(format!(
                    "unknown task status: {other}"
                )))
            }
        };

        Ok(ProviderTaskReport {
            provider_task_id: self.task.task_id,
            status,
        })
    }
}

// =============================================================================
// Client
// =============================================================================

/// Novita API client.
#[derive(Debug, Clone)]
pub struct NovitaProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl NovitaProvider {
    /// Create a new client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();

        if status.is_success() {
            let body = response.bytes().await?;
            return serde_json::from_slice(&body)
                .map_err(|e| ProviderError::Malformed(e.to_string()));
        }

        let message = match response.json::<ErrorResponse>().await {
            Ok(ErrorResponse {
                reason: Some(reason),
                ..
            }) => reason,
            Ok(ErrorResponse {
                message: Some(message),
                ..
            }) => message,
            _ => format!("HTTP {status}"),
        };

        Err(ProviderError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl ImageProvider for NovitaProvider {
    fn name(&self) -> &str {
        "novita"
    }

    async fn submit(&self, request: &ProviderRequest) -> Result<String, ProviderError> {
        let url = format!("{}/v3/async/txt2img", self.base_url);
        let body = Txt2ImgRequest::new(request);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let submitted: SubmitResponse = Self::handle_response(response).await?;
        if submitted.task_id.is_empty() {
            return Err(ProviderError::Malformed("response has no task_id".into()));
        }

        Ok(submitted.task_id)
    }

    async fn fetch_status(&self, provider_task_id: &str) -> Result<ProviderTaskReport, ProviderError> {
        let url = format!("{}/v3/async/task-result", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[("task_id", provider_task_id)])
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;

        Self::handle_response::<TaskResultResponse>(response)
            .await?
            .into_report()
    }

    fn parse_callback(&self, body: &[u8]) -> Result<Option<ProviderTaskReport>, ProviderError> {
        let envelope: CallbackEnvelope =
            serde_json::from_slice(body).map_err(|e| ProviderError::Malformed(e.to_string()))?;

        if envelope.event_type != TASK_RESULT_EVENT {
            tracing::debug!(event_type = %envelope.event_type, "Ignoring provider event");
            return Ok(None);
        }

        envelope
            .payload
            .ok_or_else(|| ProviderError::Malformed("task result event without payload".into()))?
            .into_report()
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> NovitaProvider {
        NovitaProvider::new("https://api.novita.ai/", "key", Duration::from_secs(5)).unwrap()
    }

    fn parse(json: &serde_json::Value) -> Result<ProviderTaskReport, ProviderError> {
        serde_json::from_value::<TaskResultResponse>(json.clone())
            .unwrap()
            .into_report()
    }

    #[test]
    fn base_url_is_trimmed() {
        assert_eq!(provider().base_url, "https://api.novita.ai");
    }

    #[test]
    fn processing_reports_progress() {
        let report = parse(&serde_json::json!({
            "task": {"task_id": "t1", "status": "TASK_STATUS_PROCESSING", "progress_percent": 40}
        }))
        .unwrap();
        assert_eq!(report.provider_task_id, "t1");
        assert_eq!(report.status, ProviderTaskStatus::Processing { progress: 40 });
    }

    #[test]
    fn success_carries_images() {
        let report = parse(&serde_json::json!({
            "task": {"task_id": "t1", "status": "TASK_STATUS_SUCCEED"},
            "images": [
                {"image_url": "https://cdn.example/a.jpeg", "image_type": "jpeg", "image_url_ttl": 3600}
            ]
        }))
        .unwrap();

        let ProviderTaskStatus::Succeeded { assets } = report.status else {
            panic!("expected success");
        };
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].url, "https://cdn.example/a.jpeg");
        assert_eq!(assets[0].url_ttl_seconds, Some(3600));
    }

    #[test]
    fn success_without_images_is_a_failure() {
        let report = parse(&serde_json::json!({
            "task": {"task_id": "t1", "status": "TASK_STATUS_SUCCEED"},
            "images": []
        }))
        .unwrap();
        assert!(matches!(report.status, ProviderTaskStatus::Failed { .. }));
    }

    #[test]
    fn failure_keeps_reason() {
        let report = parse(&serde_json::json!({
            "task": {"task_id": "t1", "status": "TASK_STATUS_FAILED", "reason": "queue timeout"}
        }))
        .unwrap();
        assert_eq!(
            report.status,
            ProviderTaskStatus::Failed {
                reason: "queue timeout".into()
            }
        );
    }

    #[test]
    fn unknown_status_is_malformed() {
        let result = parse(&serde_json::json!({
            "task": {"task_id": "t1", "status": "TASK_STATUS_EXPLODED"}
        }));
        assert!(matches!(result, Err(ProviderError::Malformed(_))));
    }

    #[test]
    fn callback_parsing() {
        let provider = provider();

        let body = serde_json::json!({
            "event_type": "ASYNC_TASK_RESULT",
            "payload": {"task": {"task_id": "t9", "status": "TASK_STATUS_QUEUED"}}
        });
        let report = provider
            .parse_callback(body.to_string().as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(report.provider_task_id, "t9");
        assert_eq!(report.status, ProviderTaskStatus::Queued);

        let other = serde_json::json!({"event_type": "PING"});
        assert!(provider
            .parse_callback(other.to_string().as_bytes())
            .unwrap()
            .is_none());

        assert!(matches!(
            provider.parse_callback(b"not json"),
            Err(ProviderError::Malformed(_))
        ));
    }

    #[test]
    fn submit_body_shape() {
        let request = ProviderRequest {
            generation: muse_core::GenerationRequest::new("a red kite").with_image_count(2),
            webhook_url: Some("https://muse.example/webhooks/provider?task=1".into()),
        };

        let json = serde_json::to_value(Txt2ImgRequest::new(&request)).unwrap();
        assert_eq!(json["request"]["image_num"], 2);
        assert_eq!(json["request"]["prompt"], "a red kite");
        assert_eq!(
            json["extra"]["webhook"]["url"],
            "https://muse.example/webhooks/provider?task=1"
        );

        let polling_only = ProviderRequest {
            webhook_url: None,
            ..request
        };
        let json = serde_json::to_value(Txt2ImgRequest::new(&polling_only)).unwrap();
        assert!(json["extra"].get("webhook").is_none());
    }
}
