//! Google Cloud Vision `images:annotate` backend (TEXT_DETECTION).

use async_trait::async_trait;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::recognizer::{OcrBackend, OcrError};
use crate::types::{OcrResponse, OcrToken, Vertex};

// google.rpc.Code values that mean "stop calling this provider".
const RPC_PERMISSION_DENIED: i32 = 7;
const RPC_RESOURCE_EXHAUSTED: i32 = 8;
const RPC_UNAUTHENTICATED: i32 = 16;

pub struct VisionRecognizer {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl VisionRecognizer {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl OcrBackend for VisionRecognizer {
    async fn recognize(&self, image_png: &[u8]) -> Result<OcrResponse, OcrError> {
        let body = AnnotateRequest::text_detection(image_png);
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| OcrError::Engine(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| OcrError::Engine(e.to_string()))?;

        match status.as_u16() {
            401 | 403 => return Err(OcrError::Authentication(format!("HTTP {status}: {text}"))),
            429 => return Err(OcrError::QuotaExceeded(format!("HTTP {status}: {text}"))),
            _ if !status.is_success() => {
                return Err(OcrError::Engine(format!("HTTP {status}: {text}")))
            }
            _ => {}
        }

        parse_annotate_response(&text)
    }
}

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct AnnotateRequest {
    requests: Vec<ImageRequest>,
}

#[derive(Debug, Serialize)]
struct ImageRequest {
    image: ImageContent,
    features: Vec<Feature>,
}

#[derive(Debug, Serialize)]
struct ImageContent {
    content: String,
}

#[derive(Debug, Serialize)]
struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
}

impl AnnotateRequest {
    fn text_detection(image: &[u8]) -> Self {
        Self {
            requests: vec![ImageRequest {
                image: ImageContent {
                    content: base64::engine::general_purpose::STANDARD.encode(image),
                },
                features: vec![Feature { kind: "TEXT_DETECTION" }],
            }],
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<ImageResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageResponse {
    #[serde(default)]
    text_annotations: Vec<TextAnnotation>,
    error: Option<RpcStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextAnnotation {
    #[serde(default)]
    description: String,
    bounding_poly: Option<BoundingPoly>,
}

#[derive(Debug, Deserialize)]
struct BoundingPoly {
    #[serde(default)]
    vertices: Vec<WireVertex>,
}

#[derive(Debug, Deserialize)]
struct WireVertex {
    #[serde(default)]
    x: i32,
    #[serde(default)]
    y: i32,
}

#[derive(Debug, Deserialize)]
struct RpcStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

/// Map an `images:annotate` body to an [`OcrResponse`]. The first annotation
/// is the aggregate block; the rest are individual detections.
pub fn parse_annotate_response(body: &str) -> Result<OcrResponse, OcrError> {
    let parsed: AnnotateResponse = serde_json::from_str(body)
        .map_err(|e| OcrError::Engine(format!("malformed Vision response: {e}")))?;

    let Some(first) = parsed.responses.into_iter().next() else {
        return Ok(OcrResponse::empty());
    };

    if let Some(err) = first.error {
        let message = format!("code {}: {}", err.code, err.message);
        return Err(match err.code {
            RPC_PERMISSION_DENIED | RPC_UNAUTHENTICATED => OcrError::Authentication(message),
            RPC_RESOURCE_EXHAUSTED => OcrError::QuotaExceeded(message),
            _ => OcrError::Engine(message),
        });
    }

    let mut annotations = first.text_annotations.into_iter();
    let full_text = annotations.next().map(|a| a.description);
    let tokens = annotations
        .map(|a| {
            let vertices = a
                .bounding_poly
                .map(|p| p.vertices.into_iter().map(|v| Vertex { x: v.x, y: v.y }).collect())
                .unwrap_or_default();
            OcrToken::new(a.description, vertices)
        })
        .collect();

    Ok(OcrResponse { full_text, tokens, confidence: None })
}
