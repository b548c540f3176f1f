use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::types::{OcrResponse, OcrToken};

#[derive(Debug, Clone, Error)]
pub enum OcrError {
    #[error("Image decode error: {0}")]
    ImageDecode(String),
    #[error("OCR engine error: {0}")]
    Engine(String),
    #[error("OCR provider rejected the credentials: {0}")]
    Authentication(String),
    #[error("OCR provider quota exhausted: {0}")]
    QuotaExceeded(String),
    #[error("No OCR backend is available")]
    NotAvailable,
}

impl OcrError {
    /// Errors that will not go away by retrying the same provider.
    pub fn is_provider_fatal(&self) -> bool {
        matches!(
            self,
            OcrError::Authentication(_) | OcrError::QuotaExceeded(_) | OcrError::NotAvailable
        )
    }
}

/// Abstraction over a text-detection provider.
/// Implementations accept PNG bytes and return the aggregate text plus
/// per-token detections.
#[async_trait]
pub trait OcrBackend: Send + Sync {
    async fn recognize(&self, image_png: &[u8]) -> Result<OcrResponse, OcrError>;
}

#[async_trait]
impl<T: OcrBackend + ?Sized> OcrBackend for Box<T> {
    async fn recognize(&self, image_png: &[u8]) -> Result<OcrResponse, OcrError> {
        (**self).recognize(image_png).await
    }
}

#[async_trait]
impl<T: OcrBackend + ?Sized> OcrBackend for std::sync::Arc<T> {
    async fn recognize(&self, image_png: &[u8]) -> Result<OcrResponse, OcrError> {
        (**self).recognize(image_png).await
    }
}

/// Split plain text into boxed tokens laid out on one line.
pub fn tokens_from_text(text: &str) -> Vec<OcrToken> {
    let mut x = 0;
    text.split_whitespace()
        .map(|word| {
            let w = 10 * word.chars().count() as i32;
            let token = OcrToken::boxed(word, x, 0, w, 20);
            x += w + 10;
            token
        })
        .collect()
}

// ── Mock backend (always available, used for tests) ───────────────────────────

/// Returns a pre-set response for every image.
pub struct MockRecognizer {
    pub response: OcrResponse,
}

impl MockRecognizer {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let tokens = tokens_from_text(&text);
        let full_text = if text.trim().is_empty() { None } else { Some(text) };
        Self { response: OcrResponse { full_text, tokens, confidence: None } }
    }

    pub fn with_response(response: OcrResponse) -> Self {
        Self { response }
    }
}

#[async_trait]
impl OcrBackend for MockRecognizer {
    async fn recognize(&self, _image_png: &[u8]) -> Result<OcrResponse, OcrError> {
        Ok(self.response.clone())
    }
}

/// Replays a queue of responses, one per call, and counts calls. Used to
/// drive the escalation ladder through specific confidence sequences.
pub struct ScriptedRecognizer {
    script: Mutex<VecDeque<Result<OcrResponse, OcrError>>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedRecognizer {
    pub fn new(script: impl IntoIterator<Item = Result<OcrResponse, OcrError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Sleep before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl OcrBackend for ScriptedRecognizer {
    async fn recognize(&self, _image_png: &[u8]) -> Result<OcrResponse, OcrError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .script
            .lock()
            .map_err(|_| OcrError::Engine("script lock poisoned".into()))?
            .pop_front();
        next.unwrap_or_else(|| Err(OcrError::Engine("script exhausted".into())))
    }
}

// ── Tesseract backend (optional, gated behind `tesseract` feature) ─────────────

#[cfg(feature = "tesseract")]
pub mod tesseract_backend {
    use super::{tokens_from_text, OcrBackend, OcrError};
    use crate::types::OcrResponse;
    use async_trait::async_trait;
    use leptess::LepTess;

    /// Local Tesseract engine. It reports plain text and a mean word
    /// confidence, so tokens carry synthetic boxes.
    pub struct TesseractRecognizer {
        data_path: Option<String>,
        lang: String,
    }

    impl TesseractRecognizer {
        pub fn new(data_path: Option<String>, lang: &str) -> Self {
            Self { data_path, lang: lang.to_string() }
        }

        fn run(data_path: Option<&str>, lang: &str, image_png: &[u8]) -> Result<(String, f64), OcrError> {
            let mut lt = LepTess::new(data_path, lang)
                .map_err(|e| OcrError::Engine(e.to_string()))?;
            lt.set_image_from_mem(image_png)
                .map_err(|e| OcrError::ImageDecode(e.to_string()))?;
            let text = lt.get_utf8_text().map_err(|e| OcrError::Engine(e.to_string()))?;
            Ok((text, lt.mean_text_conf() as f64))
        }
    }

    #[async_trait]
    impl OcrBackend for TesseractRecognizer {
        async fn recognize(&self, image_png: &[u8]) -> Result<OcrResponse, OcrError> {
            // LepTess is synchronous; keep it off the async workers.
            let data_path = self.data_path.clone();
            let lang = self.lang.clone();
            let image = image_png.to_vec();
            let (text, confidence) = tokio::task::spawn_blocking(move || {
                Self::run(data_path.as_deref(), &lang, &image)
            })
            .await
            .map_err(|e| OcrError::Engine(format!("tesseract task failed: {e}")))??;
            let tokens = tokens_from_text(&text);
            Ok(OcrResponse { full_text: Some(text), tokens, confidence: Some(confidence) })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::sync::{Arc, Mutex};

        #[tokio::test]
        async fn recognition_yields_to_other_tasks() {
            let order = Arc::new(Mutex::new(Vec::new()));
            let ocr = {
                let order = order.clone();
                tokio::spawn(async move {
                    let r = TesseractRecognizer::new(None, "eng");
                    // The outcome does not matter, only that the task yielded.
                    let _ = r.recognize(b"not an image").await;
                    order.lock().unwrap().push("ocr");
                })
            };
            tokio::task::yield_now().await;
            order.lock().unwrap().push("main");
            ocr.await.unwrap();
            assert_eq!(*order.lock().unwrap(), vec!["main", "ocr"]);
        }
    }
}
