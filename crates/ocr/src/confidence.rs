use meter_core::OcrSettings;

use crate::types::{ConfidenceBand, OcrResponse, OcrToken};

const BASE: f64 = 70.0;
const DIGIT_BONUS: f64 = 15.0;
const KEYWORD_BONUS: f64 = 10.0;
const BOX_BONUS: f64 = 5.0;
/// Used when the provider returned no per-token detections.
const NO_TOKENS: f64 = 70.0;

re!(re_keyword, r"(?i)kwh|energy|meter");

/// Heuristic confidence of a single detection.
pub fn token_confidence(token: &OcrToken) -> f64 {
    let mut score = BASE;
    if token.text.chars().any(|c| c.is_ascii_digit()) {
        score += DIGIT_BONUS;
    }
    if re_keyword().is_match(&token.text) {
        score += KEYWORD_BONUS;
    }
    if token.vertices.len() == 4 {
        score += BOX_BONUS;
    }
    score
}

/// Average per-token confidence over the individual detections (the
/// aggregate block is not a token), clamped to 0–100.
pub fn score(tokens: &[OcrToken]) -> f64 {
    if tokens.is_empty() {
        return NO_TOKENS;
    }
    let total: f64 = tokens.iter().map(token_confidence).sum();
    (total / tokens.len() as f64).clamp(0.0, 100.0)
}

/// Confidence of a whole response: the engine's own figure when it reports
/// one, the token heuristic otherwise.
pub fn score_response(response: &OcrResponse) -> f64 {
    match response.confidence {
        Some(c) if c.is_finite() => c.clamp(0.0, 100.0),
        _ => score(&response.tokens),
    }
}

/// Below half the acceptance threshold the text is not worth evaluating.
pub fn is_hard_failure(score: f64, settings: &OcrSettings) -> bool {
    score < settings.min_confidence / 2.0
}

pub fn band(score: f64, settings: &OcrSettings) -> ConfidenceBand {
    if score >= settings.good_confidence {
        ConfidenceBand::Good
    } else if score >= settings.min_confidence {
        ConfidenceBand::Acceptable
    } else {
        ConfidenceBand::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Vertex;

    fn unboxed(text: &str) -> OcrToken {
        OcrToken::new(text, vec![])
    }

    #[test]
    fn no_tokens_defaults_to_seventy() {
        assert_eq!(score(&[]), 70.0);
    }

    #[test]
    fn bonuses_stack_per_token() {
        assert_eq!(token_confidence(&unboxed("hello")), 70.0);
        assert_eq!(token_confidence(&unboxed("1245.8")), 85.0);
        assert_eq!(token_confidence(&unboxed("kWh")), 80.0);
        assert_eq!(token_confidence(&unboxed("1245kWh")), 95.0);
        assert_eq!(token_confidence(&OcrToken::boxed("1245kWh", 0, 0, 10, 10)), 100.0);
        assert_eq!(token_confidence(&OcrToken::boxed("Energy", 0, 0, 10, 10)), 85.0);
    }

    #[test]
    fn only_four_vertex_boxes_count() {
        let three = OcrToken::new("x", vec![Vertex::default(); 3]);
        let five = OcrToken::new("x", vec![Vertex::default(); 5]);
        assert_eq!(token_confidence(&three), 70.0);
        assert_eq!(token_confidence(&five), 70.0);
    }

    #[test]
    fn score_is_mean_of_tokens() {
        let tokens = vec![
            OcrToken::boxed("METER", 0, 0, 10, 10),  // 85
            OcrToken::boxed("1245.8", 0, 0, 10, 10), // 90
            unboxed("kWh"),                          // 80
        ];
        assert_eq!(score(&tokens), 85.0);
    }

    #[test]
    fn engine_confidence_overrides_heuristic() {
        assert_eq!(score_response(&OcrResponse::scored("1245.8 kWh", 55.0)), 55.0);
        assert_eq!(score_response(&OcrResponse::scored("1245.8", 140.0)), 100.0);
        let heuristic = OcrResponse {
            full_text: Some("1245.8".into()),
            tokens: vec![OcrToken::boxed("1245.8", 0, 0, 10, 10)],
            confidence: None,
        };
        assert_eq!(score_response(&heuristic), 90.0);
    }

    #[test]
    fn hard_failure_is_below_half_threshold() {
        let s = OcrSettings::default();
        assert!(is_hard_failure(29.9, &s));
        assert!(!is_hard_failure(30.0, &s));
    }

    #[test]
    fn bands_follow_thresholds() {
        let s = OcrSettings::default();
        assert_eq!(band(85.0, &s), ConfidenceBand::Good);
        assert_eq!(band(84.9, &s), ConfidenceBand::Acceptable);
        assert_eq!(band(60.0, &s), ConfidenceBand::Acceptable);
        assert_eq!(band(59.9, &s), ConfidenceBand::Low);
    }
}
