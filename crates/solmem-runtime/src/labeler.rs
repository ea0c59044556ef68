//! [`HttpLabelDetector`] – image-labeling service client.
//!
//! POSTs raw image bytes (`application/octet-stream`) to a labeling endpoint
//! and reads back `{"labels": [{"name", "confidence"}]}`. Rekognition-style
//! capitalised keys (`Labels`, `Name`, `Confidence`) are accepted as well.

use async_trait::async_trait;
use serde::Deserialize;
use solmem_types::{CollaboratorError, Label};

use crate::collaborators::{LabelDetector, http_error};

const SERVICE: &str = "label_detector";

#[derive(Deserialize)]
struct LabelsResponse {
    #[serde(alias = "Labels", default)]
    labels: Vec<ApiLabel>,
}

#[derive(Deserialize)]
struct ApiLabel {
    #[serde(alias = "Name")]
    name: String,
    #[serde(alias = "Confidence")]
    confidence: f32,
}

pub struct HttpLabelDetector {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpLabelDetector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl LabelDetector for HttpLabelDetector {
    async fn detect_labels(&self, image: &[u8]) -> Result<Vec<Label>, CollaboratorError> {
        let response: LabelsResponse = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(image.to_vec())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| http_error(SERVICE, e))?
            .json()
            .await
            .map_err(|e| http_error(SERVICE, e))?;

        Ok(response
            .labels
            .into_iter()
            .map(|l| Label {
                name: l.name,
                confidence: l.confidence,
            })
            .collect())
    }
}
