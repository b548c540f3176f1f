pub mod prompt;
pub mod service;
pub mod state;
pub mod sweeper;

pub use prompt::{Prompt, Prompter, RecordingPrompter};
pub use service::{
    ConfirmOutcome, ManualOutcome, PhotoOutcome, RetakeOutcome, RetryReason, VerificationService,
    VerifyError,
};
pub use state::{Phase, StateStore, VerificationState};
pub use sweeper::spawn_sweeper;
