use image::DynamicImage;
use meter_core::{OcrSettings, ReadingLimits};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::confidence;
use crate::extract::CandidateExtractor;
use crate::preprocess;
use crate::recognizer::{OcrBackend, OcrError};
use crate::types::{OcrAttemptResult, OcrResult, OcrStatus, PreprocessStrategy};

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Authentication or quota failure; retrying the same provider is pointless.
    #[error("OCR provider unavailable: {0}")]
    Provider(OcrError),
    #[error("OCR timed out after {0:?}")]
    Timeout(Duration),
}

/// Runs the preprocessing escalation ladder against one OCR backend:
/// decode → (preprocess → OCR → score) × up to 3 → extract.
pub struct ReadingPipeline<R: OcrBackend> {
    recognizer: R,
    extractor: CandidateExtractor,
    settings: OcrSettings,
}

impl<R: OcrBackend> ReadingPipeline<R> {
    pub fn new(recognizer: R, limits: &ReadingLimits, settings: OcrSettings) -> Self {
        Self {
            recognizer,
            extractor: CandidateExtractor::new(limits),
            settings,
        }
    }

    pub fn recognizer(&self) -> &R {
        &self.recognizer
    }

    pub fn settings(&self) -> &OcrSettings {
        &self.settings
    }

    /// [`extract_kwh_reading`](Self::extract_kwh_reading) under a single
    /// deadline covering every strategy.
    pub async fn extract_kwh_reading_with_timeout(
        &self,
        image: &[u8],
    ) -> Result<OcrResult, PipelineError> {
        let limit = self.settings.submission_timeout();
        match tokio::time::timeout(limit, self.extract_kwh_reading(image)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(timeout = ?limit, "OCR ladder timed out");
                Err(PipelineError::Timeout(limit))
            }
        }
    }

    /// Try each strategy in order, stopping at the first whose confidence
    /// reaches the acceptance threshold. Issues at most
    /// `PreprocessStrategy::LADDER.len()` OCR calls.
    pub async fn extract_kwh_reading(&self, image: &[u8]) -> Result<OcrResult, PipelineError> {
        let started = Instant::now();

        let decoded = match preprocess::load_oriented(image) {
            Ok(img) => Arc::new(img),
            Err(e) => {
                tracing::warn!("Submitted image could not be decoded: {e}");
                return Ok(OcrResult {
                    status: OcrStatus::UnreadableImage,
                    reading: None,
                    confidence: None,
                    band: None,
                    strategy: None,
                    raw_text: None,
                    attempts: vec![],
                    suggestions: suggestions(OcrStatus::UnreadableImage),
                    processing_time: started.elapsed(),
                });
            }
        };

        let mut attempts = Vec::with_capacity(PreprocessStrategy::LADDER.len());
        for strategy in PreprocessStrategy::LADDER {
            let attempt = self.attempt(&decoded, strategy).await?;
            let accepted = self.meets_threshold(&attempt);
            tracing::debug!(
                %strategy,
                success = attempt.success,
                confidence = attempt.confidence,
                "OCR attempt finished"
            );
            attempts.push(attempt);
            if accepted {
                break;
            }
        }

        Ok(self.evaluate(attempts, started.elapsed()))
    }

    fn meets_threshold(&self, attempt: &OcrAttemptResult) -> bool {
        attempt.success && attempt.confidence.is_some_and(|c| c >= self.settings.min_confidence)
    }

    async fn attempt(
        &self,
        image: &Arc<DynamicImage>,
        strategy: PreprocessStrategy,
    ) -> Result<OcrAttemptResult, PipelineError> {
        let failed = |error: String| OcrAttemptResult {
            strategy,
            success: false,
            raw_text: None,
            confidence: None,
            error: Some(error),
        };

        let img = Arc::clone(image);
        let png = match tokio::task::spawn_blocking(move || preprocess::render(&img, strategy)).await
        {
            Ok(Ok(png)) => png,
            Ok(Err(e)) => return Ok(failed(e.to_string())),
            Err(e) => return Ok(failed(format!("preprocessing task failed: {e}"))),
        };

        let response = match self.recognizer.recognize(&png).await {
            Ok(r) => r,
            Err(e) if e.is_provider_fatal() => {
                tracing::error!(%strategy, "OCR provider rejected request: {e}");
                return Err(PipelineError::Provider(e));
            }
            Err(e) => {
                tracing::warn!(%strategy, "OCR call failed: {e}");
                return Ok(failed(e.to_string()));
            }
        };

        if !response.has_text() {
            return Ok(failed("no text detected".into()));
        }

        let text = response.text();
        let score = confidence::score_response(&response);
        if confidence::is_hard_failure(score, &self.settings) {
            return Ok(OcrAttemptResult {
                strategy,
                success: false,
                raw_text: Some(text),
                confidence: Some(score),
                error: Some(format!("confidence {score:.1} is too low to use")),
            });
        }

        Ok(OcrAttemptResult {
            strategy,
            success: true,
            raw_text: Some(text),
            confidence: Some(score),
            error: None,
        })
    }

    fn evaluate(&self, attempts: Vec<OcrAttemptResult>, elapsed: Duration) -> OcrResult {
        let accepted = attempts.last().is_some_and(|a| self.meets_threshold(a));
        // Once the ladder is exhausted, the latest usable output is what gets evaluated.
        let evaluated = attempts.iter().rev().find(|a| a.success).cloned();

        let (status, reading, confidence, strategy, raw_text) = match evaluated {
            Some(a) => {
                let reading = a.raw_text.as_deref().and_then(|t| self.extractor.extract_reading(t));
                let status = match (accepted, reading.is_some()) {
                    (true, true) => OcrStatus::Accepted,
                    (true, false) => OcrStatus::NoReadingFound,
                    (false, _) => OcrStatus::LowConfidence,
                };
                (status, reading, a.confidence, Some(a.strategy), a.raw_text)
            }
            None => {
                let best = attempts
                    .iter()
                    .filter_map(|a| a.confidence)
                    .fold(None, |acc: Option<f64>, c| Some(acc.map_or(c, |b| b.max(c))));
                let status = if best.is_some() {
                    OcrStatus::LowConfidence
                } else {
                    OcrStatus::NoTextDetected
                };
                (status, None, best, None, None)
            }
        };

        if status == OcrStatus::Accepted {
            tracing::info!(
                confidence,
                strategy = ?strategy,
                attempts = attempts.len(),
                "Meter reading extracted"
            );
        } else {
            tracing::info!(?status, confidence, attempts = attempts.len(), "No usable meter reading");
        }

        OcrResult {
            status,
            reading,
            band: confidence.map(|c| confidence::band(c, &self.settings)),
            confidence,
            strategy,
            raw_text,
            suggestions: if status == OcrStatus::Accepted { vec![] } else { suggestions(status) },
            attempts,
            processing_time: elapsed,
        }
    }
}

fn suggestions(status: OcrStatus) -> Vec<String> {
    let list: &[&str] = match status {
        OcrStatus::Accepted => &[],
        OcrStatus::UnreadableImage => &["Send the photo as a JPEG or PNG image"],
        OcrStatus::NoTextDetected => &[
            "Make sure the meter display is inside the frame",
            "Turn on the display or wait for it to light up",
            "Avoid glare from lights or the sun",
        ],
        OcrStatus::LowConfidence => &[
            "Hold the camera steady and tap to focus",
            "Move closer so the digits fill most of the frame",
            "Avoid glare and reflections on the display",
        ],
        OcrStatus::NoReadingFound => &[
            "Make sure the kWh reading is visible, not another screen",
            "Include the kWh label in the photo if there is one",
        ],
    };
    list.iter().map(|s| s.to_string()).collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::{MockRecognizer, ScriptedRecognizer};
    use crate::types::OcrResponse;
    use image::{GrayImage, ImageBuffer, Luma};
    use meter_core::Kwh;
    use std::io::Cursor;

    fn tiny_png() -> Vec<u8> {
        let img: GrayImage = ImageBuffer::from_fn(8, 8, |x, _| Luma([if x < 4 { 30 } else { 220 }]));
        let mut buf = Vec::new();
        DynamicImage::ImageLuma8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        buf
    }

    fn pipeline<R: OcrBackend>(r: R) -> ReadingPipeline<R> {
        ReadingPipeline::new(r, &ReadingLimits::default(), OcrSettings::default())
    }

    fn kwh(s: &str) -> Kwh {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn first_strategy_accepted_stops_ladder() {
        let p = pipeline(ScriptedRecognizer::new(vec![
            Ok(OcrResponse::scored("METER: 1245.8 KWH", 92.0)),
            Ok(OcrResponse::scored("never used", 99.0)),
        ]));
        let r = p.extract_kwh_reading(&tiny_png()).await.unwrap();
        assert!(r.is_accepted());
        assert_eq!(r.reading.unwrap().value, kwh("1245.8"));
        assert_eq!(r.strategy, Some(PreprocessStrategy::Standard));
        assert_eq!(r.band, Some(crate::types::ConfidenceBand::Good));
        assert!(r.suggestions.is_empty());
        assert_eq!(p.recognizer().calls(), 1);
    }

    #[tokio::test]
    async fn escalates_until_threshold_met() {
        let p = pipeline(ScriptedRecognizer::new(vec![
            Ok(OcrResponse::scored("1Z45.8", 45.0)),
            Ok(OcrResponse::scored("1245.8 kWh", 72.0)),
        ]));
        let r = p.extract_kwh_reading(&tiny_png()).await.unwrap();
        assert_eq!(r.status, OcrStatus::Accepted);
        assert_eq!(r.strategy, Some(PreprocessStrategy::Aggressive));
        assert_eq!(r.band, Some(crate::types::ConfidenceBand::Acceptable));
        assert_eq!(r.attempts.len(), 2);
        assert_eq!(p.recognizer().calls(), 2);
    }

    #[tokio::test]
    async fn three_low_attempts_fail_without_fourth_call() {
        let p = pipeline(ScriptedRecognizer::new(vec![
            Ok(OcrResponse::scored("1245.8 kWh", 55.0)),
            Ok(OcrResponse::scored("1245.8 kWh", 58.0)),
            Ok(OcrResponse::scored("1245.8 kWh", 59.0)),
            Ok(OcrResponse::scored("1245.8 kWh", 99.0)),
        ]));
        let r = p.extract_kwh_reading(&tiny_png()).await.unwrap();
        assert!(!r.is_accepted());
        assert_eq!(r.status, OcrStatus::LowConfidence);
        assert_eq!(r.confidence, Some(59.0));
        assert_eq!(r.strategy, Some(PreprocessStrategy::AdaptiveThreshold));
        // The last attempt's text is still evaluated as a hint.
        assert_eq!(r.reading.unwrap().value, kwh("1245.8"));
        assert!(!r.suggestions.is_empty());
        assert_eq!(p.recognizer().calls(), 3);
        assert_eq!(p.recognizer().remaining(), 1);
    }

    #[tokio::test]
    async fn hard_failures_report_low_confidence_without_reading() {
        let p = pipeline(ScriptedRecognizer::new(vec![
            Ok(OcrResponse::scored("~~", 10.0)),
            Ok(OcrResponse::scored("~~", 20.0)),
            Ok(OcrResponse::scored("~~", 25.0)),
        ]));
        let r = p.extract_kwh_reading(&tiny_png()).await.unwrap();
        assert_eq!(r.status, OcrStatus::LowConfidence);
        assert_eq!(r.confidence, Some(25.0));
        assert!(r.reading.is_none());
        assert!(r.attempts.iter().all(|a| !a.success && a.raw_text.is_some()));
    }

    #[tokio::test]
    async fn no_text_on_every_strategy() {
        let p = pipeline(ScriptedRecognizer::new(vec![
            Ok(OcrResponse::empty()),
            Err(OcrError::Engine("HTTP 503".into())),
            Ok(OcrResponse::empty()),
        ]));
        let r = p.extract_kwh_reading(&tiny_png()).await.unwrap();
        assert_eq!(r.status, OcrStatus::NoTextDetected);
        assert_eq!(r.confidence, None);
        assert_eq!(r.attempts.len(), 3);
        assert_eq!(r.attempts[1].error.as_deref(), Some("OCR engine error: HTTP 503"));
    }

    #[tokio::test]
    async fn confident_text_without_number_is_no_reading() {
        let p = pipeline(MockRecognizer::new("CHARGING COMPLETE THANK YOU"));
        let r = p.extract_kwh_reading(&tiny_png()).await.unwrap();
        assert_eq!(r.status, OcrStatus::NoReadingFound);
        assert!(r.reading.is_none());
        // Heuristic scoring: every token at least 75.
        assert!(r.confidence.unwrap() >= 60.0);
    }

    #[tokio::test]
    async fn provider_auth_error_aborts_ladder() {
        let p = pipeline(ScriptedRecognizer::new(vec![
            Err(OcrError::Authentication("API key not valid".into())),
            Ok(OcrResponse::scored("1245.8 kWh", 99.0)),
        ]));
        let err = p.extract_kwh_reading(&tiny_png()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Provider(OcrError::Authentication(_))));
        assert_eq!(p.recognizer().calls(), 1);
    }

    #[tokio::test]
    async fn undecodable_image_makes_no_ocr_call() {
        let p = pipeline(ScriptedRecognizer::new(vec![]));
        let r = p.extract_kwh_reading(b"not an image").await.unwrap();
        assert_eq!(r.status, OcrStatus::UnreadableImage);
        assert_eq!(p.recognizer().calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_wraps_whole_ladder() {
        let settings = OcrSettings { submission_timeout_secs: 30, ..OcrSettings::default() };
        // Each call alone fits in the deadline; three of them do not.
        let recognizer = ScriptedRecognizer::new(vec![
            Ok(OcrResponse::scored("x", 10.0)),
            Ok(OcrResponse::scored("x", 10.0)),
            Ok(OcrResponse::scored("x", 10.0)),
        ])
        .with_delay(Duration::from_secs(12));
        let p = ReadingPipeline::new(recognizer, &ReadingLimits::default(), settings);
        let err = p.extract_kwh_reading_with_timeout(&tiny_png()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Timeout(d) if d == Duration::from_secs(30)));
        assert!(p.recognizer().calls() >= 1);
    }
}
