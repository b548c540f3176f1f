// ── Compiled regex cache ─────────────────────────────────────────────────────

macro_rules! re {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static ::regex::Regex {
            static R: ::std::sync::OnceLock<::regex::Regex> = ::std::sync::OnceLock::new();
            R.get_or_init(|| ::regex::Regex::new($pat).expect("invalid regex"))
        }
    };
}

pub mod confidence;
pub mod extract;
pub mod pipeline;
pub mod preprocess;
pub mod recognizer;
pub mod types;
pub mod vision;

pub use extract::{normalize, CandidateExtractor};
pub use pipeline::{PipelineError, ReadingPipeline};
pub use preprocess::{prepare_for_ocr_from_bytes, PreprocessError};
pub use recognizer::{MockRecognizer, OcrBackend, OcrError, ScriptedRecognizer};
pub use types::{
    ConfidenceBand, OcrAttemptResult, OcrResponse, OcrResult, OcrStatus, OcrToken,
    PreprocessStrategy, ReadingCandidate, Vertex,
};
pub use vision::VisionRecognizer;
