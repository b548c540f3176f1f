use meter_core::Kwh;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One corner of a token's bounding polygon, in source-image pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vertex {
    pub x: i32,
    pub y: i32,
}

/// A single detected word or number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrToken {
    pub text: String,
    pub vertices: Vec<Vertex>,
}

impl OcrToken {
    pub fn new(text: impl Into<String>, vertices: Vec<Vertex>) -> Self {
        Self { text: text.into(), vertices }
    }

    /// A token with an axis-aligned box at the given origin and size.
    pub fn boxed(text: impl Into<String>, x: i32, y: i32, w: i32, h: i32) -> Self {
        let vertices = vec![
            Vertex { x, y },
            Vertex { x: x + w, y },
            Vertex { x: x + w, y: y + h },
            Vertex { x, y: y + h },
        ];
        Self::new(text, vertices)
    }
}

/// What one text-detection call returned: the aggregate block plus the
/// individual detections (the aggregate block is never part of `tokens`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OcrResponse {
    pub full_text: Option<String>,
    pub tokens: Vec<OcrToken>,
    /// Engine-reported confidence (0–100). When present it replaces the
    /// token heuristic.
    pub confidence: Option<f64>,
}

impl OcrResponse {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Plain text with an engine-reported confidence and no token boxes.
    pub fn scored(text: impl Into<String>, confidence: f64) -> Self {
        let text = text.into();
        let tokens = text.split_whitespace().map(|w| OcrToken::new(w, vec![])).collect();
        Self { full_text: Some(text), tokens, confidence: Some(confidence) }
    }

    /// The detected text, falling back to the joined tokens when the
    /// provider sent no aggregate block.
    pub fn text(&self) -> String {
        match &self.full_text {
            Some(t) if !t.trim().is_empty() => t.clone(),
            _ => self
                .tokens
                .iter()
                .map(|t| t.text.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    pub fn has_text(&self) -> bool {
        !self.text().trim().is_empty()
    }
}

/// Image preparation applied before a text-detection call, in escalation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreprocessStrategy {
    Standard,
    Aggressive,
    AdaptiveThreshold,
}

impl PreprocessStrategy {
    /// The fixed escalation ladder. Its length bounds OCR calls per image.
    pub const LADDER: [PreprocessStrategy; 3] = [
        PreprocessStrategy::Standard,
        PreprocessStrategy::Aggressive,
        PreprocessStrategy::AdaptiveThreshold,
    ];
}

impl std::fmt::Display for PreprocessStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreprocessStrategy::Standard => write!(f, "standard"),
            PreprocessStrategy::Aggressive => write!(f, "aggressive"),
            PreprocessStrategy::AdaptiveThreshold => write!(f, "adaptive_threshold"),
        }
    }
}

/// Outcome of one strategy's OCR call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OcrAttemptResult {
    pub strategy: PreprocessStrategy,
    pub success: bool,
    pub raw_text: Option<String>,
    /// Aggregate confidence (0–100); only set when text was detected.
    pub confidence: Option<f64>,
    pub error: Option<String>,
}

/// A numeric token found in normalized OCR text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadingCandidate {
    pub value: Kwh,
    pub score: i32,
    /// Byte offset of the number in the normalized text.
    pub source_position: usize,
    /// Normalized text surrounding the number.
    pub context: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceBand {
    /// At or above the "good" threshold.
    Good,
    /// Accepted, but the user should double-check the value.
    Acceptable,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrStatus {
    Accepted,
    LowConfidence,
    NoReadingFound,
    NoTextDetected,
    UnreadableImage,
}

/// Result of running the whole escalation ladder on one image.
#[derive(Debug, Clone, Serialize)]
pub struct OcrResult {
    pub status: OcrStatus,
    /// The selected candidate. For `LowConfidence` this is only a hint.
    pub reading: Option<ReadingCandidate>,
    pub confidence: Option<f64>,
    pub band: Option<ConfidenceBand>,
    /// Strategy whose output was evaluated.
    pub strategy: Option<PreprocessStrategy>,
    pub raw_text: Option<String>,
    pub attempts: Vec<OcrAttemptResult>,
    pub suggestions: Vec<String>,
    pub processing_time: Duration,
}

impl OcrResult {
    pub fn is_accepted(&self) -> bool {
        self.status == OcrStatus::Accepted && self.reading.is_some()
    }
}
