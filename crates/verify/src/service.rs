use chrono::{DateTime, Utc};
use meter_core::{
    ChargeContext, ChargingSession, ConsumptionWarning, Kwh, MeterConfig, MeterReading, Provider,
    ReadingKind, ReadingValidator, SessionStore, StoreError, ValidationError,
    VerificationSettings,
};
use meter_ocr::{ConfidenceBand, OcrBackend, OcrResult, OcrStatus, PipelineError, ReadingPipeline};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::prompt::{Prompt, Prompter};
use crate::state::{Phase, StateStore, VerificationState};

#[derive(Debug, Error)]
pub enum VerifyError {
    /// Never started, cancelled, confirmed, expired, or replaced by a newer
    /// verification. The caller has to start over.
    #[error("No active meter verification for user '{0}'")]
    NotFound(String),
    #[error("Charging session '{0}' has no confirmed start reading")]
    MissingStartReading(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a photo did not produce a usable reading.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryReason {
    LowConfidence { confidence: Option<f64> },
    NoReadingFound,
    NoTextDetected,
    UnreadableImage,
    Timeout(Duration),
}

impl std::fmt::Display for RetryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryReason::LowConfidence { confidence: Some(c) } => {
                write!(f, "The photo was not clear enough to read ({c:.0}% confidence)")
            }
            RetryReason::LowConfidence { confidence: None } => {
                write!(f, "The photo was not clear enough to read")
            }
            RetryReason::NoReadingFound => write!(f, "No kWh reading was found in the photo"),
            RetryReason::NoTextDetected => write!(f, "No text was detected in the photo"),
            RetryReason::UnreadableImage => write!(f, "The file could not be opened as an image"),
            RetryReason::Timeout(d) => {
                write!(f, "Reading the photo took longer than {} seconds", d.as_secs())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PhotoOutcome {
    /// A valid candidate is waiting for confirmation.
    ReadingFound {
        reading: Kwh,
        confidence: f64,
        band: ConfidenceBand,
        warnings: Vec<ConsumptionWarning>,
        processing_time: Duration,
    },
    Retry {
        reason: RetryReason,
        attempt: u32,
        remaining: u32,
        suggestions: Vec<String>,
        processing_time: Option<Duration>,
    },
    /// Photo attempts are used up; only a typed reading is accepted now.
    ManualEntryRequired { attempts: u32, reason: Option<RetryReason> },
    /// A reading was recognized but failed validation.
    Rejected {
        reading: Kwh,
        error: ValidationError,
        manual_entry_required: bool,
        processing_time: Duration,
    },
    /// The OCR provider refused the request (credentials or quota).
    ProviderUnavailable { message: String },
    /// A candidate is already waiting; confirm or retake first.
    AwaitingConfirmation { reading: Option<Kwh> },
}

impl PhotoOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PhotoOutcome::ReadingFound { .. })
    }

    pub fn reading(&self) -> Option<Kwh> {
        match self {
            PhotoOutcome::ReadingFound { reading, .. } => Some(*reading),
            PhotoOutcome::AwaitingConfirmation { reading } => *reading,
            _ => None,
        }
    }

    pub fn confidence(&self) -> Option<f64> {
        match self {
            PhotoOutcome::ReadingFound { confidence, .. } => Some(*confidence),
            PhotoOutcome::Retry { reason: RetryReason::LowConfidence { confidence }, .. } => {
                *confidence
            }
            _ => None,
        }
    }

    pub fn should_retry(&self) -> bool {
        match self {
            PhotoOutcome::Retry { .. } => true,
            PhotoOutcome::Rejected { manual_entry_required, .. } => !manual_entry_required,
            _ => false,
        }
    }

    pub fn processing_time(&self) -> Option<Duration> {
        match self {
            PhotoOutcome::ReadingFound { processing_time, .. }
            | PhotoOutcome::Rejected { processing_time, .. } => Some(*processing_time),
            PhotoOutcome::Retry { processing_time, .. } => *processing_time,
            _ => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            PhotoOutcome::ReadingFound { reading, band, warnings, .. } => {
                let mut msg = format!("Read {reading}. Reply 'confirm' if this matches the meter.");
                if *band == ConfidenceBand::Acceptable {
                    msg.push_str(" Please double-check the digits.");
                }
                for w in warnings {
                    msg.push_str(&format!("\nNote: {w}"));
                }
                msg
            }
            PhotoOutcome::Retry { reason, remaining, suggestions, .. } => {
                let mut msg = format!("{reason}. Please send another photo ({remaining} left).");
                for s in suggestions {
                    msg.push_str(&format!("\n- {s}"));
                }
                msg
            }
            PhotoOutcome::ManualEntryRequired { reason, .. } => match reason {
                Some(r) => format!("{r}. Please type the kWh reading shown on the meter."),
                None => "Please type the kWh reading shown on the meter.".to_string(),
            },
            PhotoOutcome::Rejected { reading, error, manual_entry_required, .. } => {
                if *manual_entry_required {
                    format!("Read {reading}, but {error}. Please type the reading instead.")
                } else {
                    format!("Read {reading}, but {error}. Please send another photo.")
                }
            }
            PhotoOutcome::ProviderUnavailable { .. } => {
                "Photo recognition is unavailable right now. Please type the kWh reading."
                    .to_string()
            }
            PhotoOutcome::AwaitingConfirmation { reading } => match reading {
                Some(r) => format!("{r} is waiting for confirmation. Reply 'confirm' or 'retake'."),
                None => "A reading is waiting for confirmation.".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ManualOutcome {
    Accepted { reading: Kwh, warnings: Vec<ConsumptionWarning> },
    Invalid { error: ValidationError, attempts: u32 },
    AwaitingConfirmation { reading: Option<Kwh> },
}

impl ManualOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ManualOutcome::Accepted { .. })
    }

    pub fn message(&self) -> String {
        match self {
            ManualOutcome::Accepted { reading, warnings } => {
                let mut msg = format!("Got {reading}. Reply 'confirm' to save it.");
                for w in warnings {
                    msg.push_str(&format!("\nNote: {w}"));
                }
                msg
            }
            ManualOutcome::Invalid { error, .. } => format!("{error}. Please try again."),
            ManualOutcome::AwaitingConfirmation { .. } => {
                "A reading is already waiting. Reply 'confirm' or 'retake'.".to_string()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmOutcome {
    StartConfirmed { session_id: String, reading: MeterReading },
    EndConfirmed {
        session_id: String,
        start: Kwh,
        reading: MeterReading,
        consumption: Kwh,
    },
    /// The start reading changed since the candidate was checked.
    Rejected { error: ValidationError },
    NothingToConfirm { phase: Phase },
}

impl ConfirmOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, ConfirmOutcome::StartConfirmed { .. } | ConfirmOutcome::EndConfirmed { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetakeOutcome {
    /// The candidate was discarded and a new photo was requested.
    Retaking { attempts: u32 },
    /// Only a waiting candidate can be retaken.
    NothingToRetake { phase: Phase },
}

type CandidateCheck = Result<Vec<ConsumptionWarning>, ValidationError>;

/// Drives one verification per user: photo → OCR ladder → validation →
/// confirmation, with a manual-entry fallback once photo attempts run out.
///
/// Concurrent submissions for the same user are not serialized. Each one
/// runs OCR against a snapshot and then applies its result to the live
/// entry, so the last to finish wins the candidate fields while every
/// attempt is still counted. A result whose verification was replaced or
/// removed during OCR is discarded.
pub struct VerificationService<R: OcrBackend> {
    pub(crate) states: StateStore,
    pipeline: ReadingPipeline<R>,
    validator: ReadingValidator,
    sessions: Arc<dyn SessionStore>,
    prompter: Arc<dyn Prompter>,
    settings: VerificationSettings,
}

impl<R: OcrBackend> VerificationService<R> {
    pub fn new(
        pipeline: ReadingPipeline<R>,
        validator: ReadingValidator,
        sessions: Arc<dyn SessionStore>,
        prompter: Arc<dyn Prompter>,
        settings: VerificationSettings,
    ) -> Self {
        Self {
            states: StateStore::new(),
            pipeline,
            validator,
            sessions,
            prompter,
            settings,
        }
    }

    pub fn from_config(
        recognizer: R,
        config: &MeterConfig,
        sessions: Arc<dyn SessionStore>,
        prompter: Arc<dyn Prompter>,
    ) -> Self {
        Self::new(
            ReadingPipeline::new(recognizer, &config.readings, config.ocr.clone()),
            ReadingValidator::new(config.readings.clone()),
            sessions,
            prompter,
            config.verification.clone(),
        )
    }

    pub fn pipeline(&self) -> &ReadingPipeline<R> {
        &self.pipeline
    }

    pub fn settings(&self) -> &VerificationSettings {
        &self.settings
    }

    /// Begin capturing a start or end reading, replacing any verification
    /// the user already had.
    pub async fn start_verification(&self, user_id: &str, session_id: &str, kind: ReadingKind) {
        let state = VerificationState::new(user_id, session_id, kind, Utc::now());
        if let Some(previous) = self.states.insert(state) {
            tracing::debug!(user = user_id, previous = %previous.session_id, "Replaced verification");
        }
        tracing::info!(user = user_id, session = session_id, %kind, "Verification started");
        self.prompter
            .prompt(user_id, Prompt::Photo { session_id: session_id.to_string(), kind })
            .await;
    }

    pub async fn submit_photo(
        &self,
        user_id: &str,
        image: &[u8],
    ) -> Result<PhotoOutcome, VerifyError> {
        let state = self.live_state(user_id)?;
        let max = self.settings.max_attempts;

        match state.phase {
            Phase::AwaitingConfirmation => {
                return Ok(PhotoOutcome::AwaitingConfirmation { reading: state.last_reading });
            }
            Phase::ManualEntryRequired => {
                return Ok(PhotoOutcome::ManualEntryRequired {
                    attempts: state.attempt_count,
                    reason: None,
                });
            }
            Phase::AwaitingPhoto if state.attempt_count >= max => {
                self.states.update(user_id, |s| {
                    if s.id == state.id {
                        s.phase = Phase::ManualEntryRequired;
                    }
                });
                self.prompt_manual(&state).await;
                return Ok(PhotoOutcome::ManualEntryRequired {
                    attempts: state.attempt_count,
                    reason: None,
                });
            }
            Phase::AwaitingPhoto => {}
        }

        tracing::info!(
            user = user_id,
            session = %state.session_id,
            kind = %state.kind,
            attempt = state.attempt_count + 1,
            "Processing meter photo"
        );

        let result = match self.pipeline.extract_kwh_reading_with_timeout(image).await {
            Ok(result) => result,
            Err(PipelineError::Provider(e)) => {
                tracing::error!(user = user_id, "OCR provider unavailable: {e}");
                self.record_attempt(&state, |s| s.phase = Phase::ManualEntryRequired)?;
                self.prompt_manual(&state).await;
                return Ok(PhotoOutcome::ProviderUnavailable { message: e.to_string() });
            }
            Err(PipelineError::Timeout(limit)) => {
                let suggestions = vec!["Send a smaller or closer photo of the display".to_string()];
                return self
                    .photo_failed(&state, RetryReason::Timeout(limit), suggestions, None)
                    .await;
            }
        };

        self.evaluate_photo(&state, result).await
    }

    async fn evaluate_photo(
        &self,
        state: &VerificationState,
        result: OcrResult,
    ) -> Result<PhotoOutcome, VerifyError> {
        let processing_time = result.processing_time;
        let candidate = match (&result.status, &result.reading) {
            (OcrStatus::Accepted, Some(c)) => c.value,
            (status, _) => {
                let reason = match status {
                    OcrStatus::LowConfidence => {
                        RetryReason::LowConfidence { confidence: result.confidence }
                    }
                    OcrStatus::NoTextDetected => RetryReason::NoTextDetected,
                    OcrStatus::UnreadableImage => RetryReason::UnreadableImage,
                    OcrStatus::NoReadingFound | OcrStatus::Accepted => RetryReason::NoReadingFound,
                };
                return self
                    .photo_failed(state, reason, result.suggestions, Some(processing_time))
                    .await;
            }
        };
        let confidence = result.confidence.unwrap_or_default();
        let band = result.band.unwrap_or(ConfidenceBand::Acceptable);

        match self.check_candidate(state, candidate, Utc::now()).await? {
            Ok(warnings) => {
                let attempts = self.record_attempt(state, |s| {
                    s.phase = Phase::AwaitingConfirmation;
                    s.last_reading = Some(candidate);
                    s.last_confidence = Some(confidence);
                    s.provider = Provider::Vision;
                })?;
                tracing::info!(
                    user = %state.user_id,
                    session = %state.session_id,
                    reading = %candidate,
                    confidence,
                    attempts,
                    "Meter reading awaiting confirmation"
                );
                Ok(PhotoOutcome::ReadingFound {
                    reading: candidate,
                    confidence,
                    band,
                    warnings,
                    processing_time,
                })
            }
            Err(error) => {
                let max = self.settings.max_attempts;
                let attempts = self.record_attempt(state, |s| {
                    if s.attempt_count >= max {
                        s.phase = Phase::ManualEntryRequired;
                    }
                })?;
                tracing::warn!(
                    user = %state.user_id,
                    reading = %candidate,
                    attempts,
                    "Recognized reading rejected: {error}"
                );
                let manual_entry_required = attempts >= max;
                if manual_entry_required {
                    self.prompt_manual(state).await;
                }
                Ok(PhotoOutcome::Rejected {
                    reading: candidate,
                    error,
                    manual_entry_required,
                    processing_time,
                })
            }
        }
    }

    async fn photo_failed(
        &self,
        state: &VerificationState,
        reason: RetryReason,
        suggestions: Vec<String>,
        processing_time: Option<Duration>,
    ) -> Result<PhotoOutcome, VerifyError> {
        let max = self.settings.max_attempts;
        let attempts = self.record_attempt(state, |s| {
            if s.attempt_count >= max {
                s.phase = Phase::ManualEntryRequired;
            }
        })?;

        if attempts >= max {
            tracing::warn!(
                user = %state.user_id,
                attempts,
                "Photo attempts exhausted, falling back to manual entry: {reason}"
            );
            self.prompt_manual(state).await;
            return Ok(PhotoOutcome::ManualEntryRequired { attempts, reason: Some(reason) });
        }

        tracing::info!(user = %state.user_id, attempts, "Photo not usable: {reason}");
        Ok(PhotoOutcome::Retry {
            reason,
            attempt: attempts,
            remaining: max - attempts,
            suggestions,
            processing_time,
        })
    }

    /// Accept a typed reading. Allowed in any phase except while a
    /// candidate is waiting for confirmation.
    pub async fn submit_manual_reading(
        &self,
        user_id: &str,
        text: &str,
    ) -> Result<ManualOutcome, VerifyError> {
        let state = self.live_state(user_id)?;
        if state.phase == Phase::AwaitingConfirmation {
            return Ok(ManualOutcome::AwaitingConfirmation { reading: state.last_reading });
        }

        let checked = match self.validator.parse_manual_reading(text) {
            Ok(value) => self.check_candidate(&state, value, Utc::now()).await?.map(|w| (value, w)),
            Err(e) => Err(e),
        };

        match checked {
            Ok((reading, warnings)) => {
                self.record_attempt(&state, |s| {
                    s.phase = Phase::AwaitingConfirmation;
                    s.last_reading = Some(reading);
                    s.last_confidence = None;
                    s.provider = Provider::Manual;
                })?;
                tracing::info!(user = user_id, %reading, "Manual reading awaiting confirmation");
                Ok(ManualOutcome::Accepted { reading, warnings })
            }
            Err(error) => {
                let attempts = self.record_attempt(&state, |_| {})?;
                tracing::info!(user = user_id, attempts, "Manual reading rejected: {error}");
                Ok(ManualOutcome::Invalid { error, attempts })
            }
        }
    }

    /// Persist the waiting candidate and finish the verification.
    pub async fn confirm(&self, user_id: &str) -> Result<ConfirmOutcome, VerifyError> {
        let state = self.live_state(user_id)?;
        let (Phase::AwaitingConfirmation, Some(value)) = (state.phase, state.last_reading) else {
            return Ok(ConfirmOutcome::NothingToConfirm { phase: state.phase });
        };

        let reading = MeterReading {
            value,
            provider: state.provider,
            confidence: state.last_confidence,
            recorded_at: Utc::now(),
        };
        let session_id = state.session_id.clone();

        let outcome = match state.kind {
            ReadingKind::Start => {
                self.sessions.record_start_reading(&session_id, &reading).await?;
                ConfirmOutcome::StartConfirmed { session_id, reading }
            }
            ReadingKind::End => {
                let start = self
                    .sessions
                    .session(&session_id)
                    .await?
                    .and_then(|s| s.start_reading)
                    .ok_or_else(|| VerifyError::MissingStartReading(session_id.clone()))?;
                let consumption = match self.validator.calculate_consumption(start.value, value) {
                    Ok(c) => c,
                    Err(error) => return Ok(ConfirmOutcome::Rejected { error }),
                };
                self.sessions.record_end_reading(&session_id, &reading, consumption).await?;
                ConfirmOutcome::EndConfirmed { session_id, start: start.value, reading, consumption }
            }
        };

        self.states.remove_generation(user_id, state.id);
        tracing::info!(
            user = user_id,
            session = %state.session_id,
            kind = %state.kind,
            reading = %value,
            provider = %state.provider,
            "Meter reading confirmed"
        );
        Ok(outcome)
    }

    /// Discard the waiting candidate and ask for a new photo. The attempt
    /// counter is kept. Any other phase is left untouched, so manual entry
    /// cannot be escaped this way.
    pub async fn retake(&self, user_id: &str) -> Result<RetakeOutcome, VerifyError> {
        let state = self.live_state(user_id)?;
        let reopened = self
            .states
            .update(user_id, |s| {
                if s.id != state.id || s.phase != Phase::AwaitingConfirmation {
                    return false;
                }
                s.phase = Phase::AwaitingPhoto;
                s.last_reading = None;
                s.last_confidence = None;
                true
            })
            .unwrap_or(false);
        if !reopened {
            return Ok(RetakeOutcome::NothingToRetake { phase: state.phase });
        }

        tracing::debug!(user = user_id, attempts = state.attempt_count, "Retake requested");
        self.prompter
            .prompt(user_id, Prompt::Photo { session_id: state.session_id, kind: state.kind })
            .await;
        Ok(RetakeOutcome::Retaking { attempts: state.attempt_count })
    }

    /// Returns whether there was anything to cancel.
    pub fn cancel(&self, user_id: &str) -> bool {
        let removed = self.states.remove(user_id).is_some();
        if removed {
            tracing::info!(user = user_id, "Verification cancelled");
        }
        removed
    }

    pub fn is_active(&self, user_id: &str) -> bool {
        self.live_state(user_id).is_ok()
    }

    /// Snapshot of the user's live verification, if any.
    pub fn state(&self, user_id: &str) -> Option<VerificationState> {
        self.live_state(user_id).ok()
    }

    pub fn cleanup_expired(&self, now: DateTime<Utc>) -> usize {
        let removed = self.states.remove_expired(now, self.settings.state_ttl());
        if removed > 0 {
            tracing::info!(removed, "Expired verifications removed");
        }
        removed
    }

    fn live_state(&self, user_id: &str) -> Result<VerificationState, VerifyError> {
        let not_found = || VerifyError::NotFound(user_id.to_string());
        let state = self.states.get(user_id).ok_or_else(not_found)?;
        if state.is_expired(Utc::now(), self.settings.state_ttl()) {
            self.states.remove_generation(user_id, state.id);
            tracing::debug!(user = user_id, "Verification expired before sweep");
            return Err(not_found());
        }
        Ok(state)
    }

    /// Count one attempt against the live entry and apply `f` to it, as long
    /// as it is still the generation `state` was read from.
    fn record_attempt(
        &self,
        state: &VerificationState,
        f: impl FnOnce(&mut VerificationState),
    ) -> Result<u32, VerifyError> {
        let generation: Uuid = state.id;
        self.states
            .update(&state.user_id, |s| {
                if s.id != generation {
                    return None;
                }
                s.attempt_count += 1;
                f(s);
                Some(s.attempt_count)
            })
            .flatten()
            .ok_or_else(|| {
                tracing::debug!(user = %state.user_id, "Verification replaced during OCR, result discarded");
                VerifyError::NotFound(state.user_id.clone())
            })
    }

    /// Single-reading checks, plus consumption checks for end readings when
    /// the session already has a start reading.
    async fn check_candidate(
        &self,
        state: &VerificationState,
        value: Kwh,
        now: DateTime<Utc>,
    ) -> Result<CandidateCheck, VerifyError> {
        if let Err(e) = self.validator.check_reading(value) {
            return Ok(Err(e));
        }
        if state.kind == ReadingKind::Start {
            return Ok(Ok(vec![]));
        }
        let Some(session) = self.sessions.session(&state.session_id).await? else {
            return Ok(Ok(vec![]));
        };
        let Some(start) = session.start_reading.as_ref() else {
            return Ok(Ok(vec![]));
        };
        let consumption = match self.validator.calculate_consumption(start.value, value) {
            Ok(c) => c,
            Err(e) => return Ok(Err(e)),
        };
        Ok(self.check_context(&session, start, consumption, now))
    }

    fn check_context(
        &self,
        session: &ChargingSession,
        start: &MeterReading,
        consumption: Kwh,
        now: DateTime<Utc>,
    ) -> CandidateCheck {
        let Some(power) = session.charger_power_kw else {
            return Ok(vec![]);
        };
        let elapsed = (now - start.recorded_at).num_seconds().max(0);
        let context = ChargeContext {
            duration_minutes: Decimal::from(elapsed) / Decimal::from(60),
            charger_power_kw: power,
            battery_capacity_kwh: session.battery_capacity_kwh,
        };
        self.validator
            .validate_consumption_with_context(consumption, &context)
            .into_result()
    }

    async fn prompt_manual(&self, state: &VerificationState) {
        self.prompter
            .prompt(
                &state.user_id,
                Prompt::ManualEntry { session_id: state.session_id.clone(), kind: state.kind },
            )
            .await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
