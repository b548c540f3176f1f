use meter_core::{Kwh, ReadingLimits};
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::types::ReadingCandidate;

// ── Compiled regex cache ─────────────────────────────────────────────────────

re!(re_anchor_kwh,
    r"(?:^|[^\d.])(\d{2,6}(?:\.\d{1,3})?)\s*KWH\b");
re!(re_anchor_energy,
    r"\bENERGY\s*:?\s*(\d{2,6}(?:\.\d{1,3})?)(?:\.?(?:[^\d.]|$))");
re!(re_anchor_meter,
    r"\bMETER\s*:?\s*(\d{2,6}(?:\.\d{1,3})?)(?:\.?(?:[^\d.]|$))");
re!(re_anchor_reading,
    r"\bREADING\s*:?\s*(\d{2,6}(?:\.\d{1,3})?)(?:\.?(?:[^\d.]|$))");

re!(re_number_run, r"\d+(?:\.\d+)?");
re!(re_keyword, r"KWH|ENERGY|METER");

/// Anchored matches are tried in this order; the first in-range hit wins.
fn anchors() -> [&'static regex::Regex; 4] {
    [re_anchor_kwh(), re_anchor_energy(), re_anchor_meter(), re_anchor_reading()]
}

const ANCHORED_SCORE: i32 = 100;
const BASE_SCORE: i32 = 50;
const KEYWORD_BONUS: i32 = 30;
const DECIMAL_BONUS: i32 = 10;
const TYPICAL_RANGE_BONUS: i32 = 10;
/// Most characters allowed between a number and a keyword for the bonus.
const KEYWORD_WINDOW: usize = 20;
const CONTEXT_WINDOW: usize = 15;

/// Characters OCR engines commonly return in place of digits.
fn confusion(c: char) -> Option<char> {
    match c {
        'O' => Some('0'),
        'I' | 'L' => Some('1'),
        'S' => Some('5'),
        'Z' => Some('2'),
        'B' => Some('8'),
        _ => None,
    }
}

/// Collapse whitespace, uppercase, and replace confusable letters that sit
/// inside a run of digits (`1O45` → `1045`). Words without digits are left
/// alone so anchors like `READING` stay matchable. Lossy and applied once.
pub fn normalize(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
    let chars: Vec<char> = collapsed.chars().collect();
    let mut out = String::with_capacity(collapsed.len());

    let mut i = 0;
    while i < chars.len() {
        let digitish = |c: char| c.is_ascii_digit() || c == '.' || c == ',' || confusion(c).is_some();
        if !digitish(chars[i]) {
            out.push(chars[i]);
            i += 1;
            continue;
        }

        let start = i;
        while i < chars.len() && digitish(chars[i]) {
            i += 1;
        }
        let run = &chars[start..i];
        if !run.iter().any(|c| c.is_ascii_digit()) {
            out.extend(run);
            continue;
        }

        let has_point = run.contains(&'.');
        for &c in run {
            match c {
                // A comma next to a point is a thousands separator; alone it is
                // a decimal separator.
                ',' if has_point => {}
                ',' => out.push('.'),
                c => out.push(confusion(c).unwrap_or(c)),
            }
        }
    }
    out
}

/// Turns raw OCR text into meter-reading candidates.
#[derive(Debug, Clone)]
pub struct CandidateExtractor {
    min: Decimal,
    max: Decimal,
    typical_min: Decimal,
    typical_max: Decimal,
}

impl Default for CandidateExtractor {
    fn default() -> Self {
        Self::new(&ReadingLimits::default())
    }
}

impl CandidateExtractor {
    pub fn new(limits: &ReadingLimits) -> Self {
        Self {
            min: limits.min_reading,
            max: limits.max_reading,
            typical_min: Decimal::from(100),
            typical_max: Decimal::from(10_000),
        }
    }

    /// The single best reading in `raw_text`, if any.
    pub fn extract_reading(&self, raw_text: &str) -> Option<ReadingCandidate> {
        self.candidates(raw_text).into_iter().next()
    }

    /// All surviving candidates, best first. An anchored match yields a
    /// single-element list.
    pub fn candidates(&self, raw_text: &str) -> Vec<ReadingCandidate> {
        let text = normalize(raw_text);
        if let Some(anchored) = self.anchored(&text) {
            return vec![anchored];
        }
        self.ranked(&text)
    }

    fn in_range(&self, value: Decimal) -> bool {
        value >= self.min && value <= self.max
    }

    fn anchored(&self, text: &str) -> Option<ReadingCandidate> {
        for re in anchors() {
            for caps in re.captures_iter(text) {
                let Some(m) = caps.get(1) else { continue };
                let Ok(value) = Decimal::from_str(m.as_str()) else { continue };
                if self.in_range(value) {
                    return Some(ReadingCandidate {
                        value: Kwh::new(value),
                        score: ANCHORED_SCORE,
                        source_position: m.start(),
                        context: window(text, m.start(), m.end(), CONTEXT_WINDOW).to_string(),
                    });
                }
            }
        }
        None
    }

    fn ranked(&self, text: &str) -> Vec<ReadingCandidate> {
        let mut found: Vec<ReadingCandidate> = re_number_run()
            .find_iter(text)
            .filter_map(|m| {
                let s = m.as_str();
                let (int_part, frac_part) = match s.split_once('.') {
                    Some((i, f)) => (i, Some(f)),
                    None => (s, None),
                };
                if !(2..=6).contains(&int_part.len()) || frac_part.is_some_and(|f| f.len() > 3) {
                    return None;
                }
                let value = Decimal::from_str(s).ok()?;
                if !self.in_range(value) {
                    return None;
                }

                let mut score = BASE_SCORE;
                if keyword_near(text, m.start(), m.end()) {
                    score += KEYWORD_BONUS;
                }
                if frac_part.is_some() {
                    score += DECIMAL_BONUS;
                }
                if value >= self.typical_min && value <= self.typical_max {
                    score += TYPICAL_RANGE_BONUS;
                }

                Some(ReadingCandidate {
                    value: Kwh::new(value),
                    score,
                    source_position: m.start(),
                    context: window(text, m.start(), m.end(), CONTEXT_WINDOW).to_string(),
                })
            })
            .collect();

        // Score first, then the larger value. The sort is stable, so among
        // equal (score, value) pairs the earliest occurrence is kept.
        found.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| b.value.cmp(&a.value)));
        found.dedup_by(|later, earlier| later.score == earlier.score && later.value == earlier.value);
        found
    }
}

/// Whether a keyword sits at most `KEYWORD_WINDOW` characters before or after
/// `text[start..end]`.
fn keyword_near(text: &str, start: usize, end: usize) -> bool {
    re_keyword().find_iter(text).any(|k| {
        let gap = if k.end() <= start {
            &text[k.end()..start]
        } else if k.start() >= end {
            &text[end..k.start()]
        } else {
            ""
        };
        gap.chars().count() <= KEYWORD_WINDOW
    })
}

/// `text[start - pad .. end + pad]`, clamped to the string and to char boundaries.
fn window(text: &str, start: usize, end: usize, pad: usize) -> &str {
    let mut lo = start.saturating_sub(pad);
    while !text.is_char_boundary(lo) {
        lo -= 1;
    }
    let mut hi = (end + pad).min(text.len());
    while !text.is_char_boundary(hi) {
        hi += 1;
    }
    &text[lo..hi]
}

// ── Tests ─────────────────────────────────────────────────────────────────────
