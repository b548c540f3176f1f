use async_trait::async_trait;
use meter_core::{ChargingSession, ReadingKind};
use meter_verify::{ConfirmOutcome, Prompt, Prompter, RetakeOutcome, VerifyError};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::str::FromStr;

use crate::AppState;

pub const HELP: &str = "\
Commands:
  session <id> [power_kw] [battery_kwh]   register a charging session
  start <user> <session>                  verify the start reading
  end <user> <session>                    verify the end reading
  photo <user> <image path>               submit a meter photo
  manual <user> <reading>                 type the reading instead
  confirm <user> | retake <user> | cancel <user> | status <user>
  help | quit";

#[derive(Debug)]
pub struct CommandError {
    pub message: String,
}

impl CommandError {
    fn usage(text: &str) -> Self {
        CommandError { message: format!("usage: {text}") }
    }
}

impl From<sqlx::Error> for CommandError {
    fn from(e: sqlx::Error) -> Self {
        CommandError { message: e.to_string() }
    }
}

impl From<VerifyError> for CommandError {
    fn from(e: VerifyError) -> Self {
        CommandError { message: e.to_string() }
    }
}

impl From<std::io::Error> for CommandError {
    fn from(e: std::io::Error) -> Self {
        CommandError { message: e.to_string() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Session { id: String, power_kw: Option<Decimal>, battery_kwh: Option<Decimal> },
    Begin { user: String, session: String, kind: ReadingKind },
    Photo { user: String, path: PathBuf },
    Manual { user: String, text: String },
    Confirm { user: String },
    Retake { user: String },
    Cancel { user: String },
    Status { user: String },
    Help,
    Quit,
}

pub fn parse(line: &str) -> Result<Command, CommandError> {
    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or_default().to_ascii_lowercase();
    let args: Vec<&str> = parts.collect();

    let user = |usage: &str| -> Result<String, CommandError> {
        args.first().map(|s| s.to_string()).ok_or_else(|| CommandError::usage(usage))
    };
    let decimal = |s: &str| {
        Decimal::from_str(s).map_err(|_| CommandError { message: format!("'{s}' is not a number") })
    };

    match verb.as_str() {
        "session" => {
            let id = user("session <id> [power_kw] [battery_kwh]")?;
            Ok(Command::Session {
                id,
                power_kw: args.get(1).map(|s| decimal(*s)).transpose()?,
                battery_kwh: args.get(2).map(|s| decimal(*s)).transpose()?,
            })
        }
        "start" | "end" => {
            let (Some(user), Some(session)) = (args.first(), args.get(1)) else {
                return Err(CommandError::usage(&format!("{verb} <user> <session>")));
            };
            let kind = if verb == "start" { ReadingKind::Start } else { ReadingKind::End };
            Ok(Command::Begin { user: user.to_string(), session: session.to_string(), kind })
        }
        "photo" => {
            let user = user("photo <user> <image path>")?;
            if args.len() < 2 {
                return Err(CommandError::usage("photo <user> <image path>"));
            }
            Ok(Command::Photo { user, path: PathBuf::from(args[1..].join(" ")) })
        }
        "manual" => {
            let user = user("manual <user> <reading>")?;
            if args.len() < 2 {
                return Err(CommandError::usage("manual <user> <reading>"));
            }
            Ok(Command::Manual { user, text: args[1..].join(" ") })
        }
        "confirm" => Ok(Command::Confirm { user: user("confirm <user>")? }),
        "retake" => Ok(Command::Retake { user: user("retake <user>")? }),
        "cancel" => Ok(Command::Cancel { user: user("cancel <user>")? }),
        "status" => Ok(Command::Status { user: user("status <user>")? }),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(CommandError { message: format!("unknown command '{other}', try 'help'") }),
    }
}

pub async fn execute(state: &AppState, command: Command) -> Result<String, CommandError> {
    let service = &state.service;
    match command {
        Command::Session { id, power_kw, battery_kwh } => {
            let mut session = ChargingSession::new(id.clone());
            session.charger_power_kw = power_kw;
            session.battery_capacity_kwh = battery_kwh;
            meter_storage::upsert_session(&state.db, &session).await?;
            Ok(format!("Session {id} registered"))
        }
        Command::Begin { user, session, kind } => {
            service.start_verification(&user, &session, kind).await;
            Ok(format!("Verifying the {kind} reading of session {session} for {user}"))
        }
        Command::Photo { user, path } => {
            let bytes = tokio::fs::read(&path).await?;
            let outcome = service.submit_photo(&user, &bytes).await?;
            let mut reply = outcome.message();
            if let Some(t) = outcome.processing_time() {
                reply.push_str(&format!(" [{} ms]", t.as_millis()));
            }
            Ok(reply)
        }
        Command::Manual { user, text } => {
            Ok(service.submit_manual_reading(&user, &text).await?.message())
        }
        Command::Confirm { user } => Ok(match service.confirm(&user).await? {
            ConfirmOutcome::StartConfirmed { session_id, reading } => {
                format!("Start reading {} saved for session {session_id}", reading.value)
            }
            ConfirmOutcome::EndConfirmed { session_id, start, reading, consumption } => format!(
                "End reading {} saved for session {session_id}; consumed {} since {}",
                reading.value, consumption, start
            ),
            ConfirmOutcome::Rejected { error } => format!("Cannot confirm: {error}"),
            ConfirmOutcome::NothingToConfirm { phase } => {
                format!("Nothing to confirm yet ({phase})")
            }
        }),
        Command::Retake { user } => Ok(match service.retake(&user).await? {
            RetakeOutcome::Retaking { .. } => "Send a new photo when ready".to_string(),
            RetakeOutcome::NothingToRetake { phase } => {
                format!("Nothing to retake ({phase})")
            }
        }),
        Command::Cancel { user } => Ok(if service.cancel(&user) {
            format!("Verification for {user} cancelled")
        } else {
            format!("{user} has no active verification")
        }),
        Command::Status { user } => Ok(match service.state(&user) {
            Some(s) => format!(
                "{user}: {} reading of session {}, {}, {} attempt(s){}",
                s.kind,
                s.session_id,
                s.phase,
                s.attempt_count,
                s.last_reading.map(|r| format!(", candidate {r}")).unwrap_or_default()
            ),
            None => format!("{user} has no active verification"),
        }),
        Command::Help => Ok(HELP.to_string()),
        Command::Quit => Ok(String::new()),
    }
}

/// Prints prompts to stdout, where the console user sees them.
pub struct ConsolePrompter;

#[async_trait]
impl Prompter for ConsolePrompter {
    async fn prompt(&self, user_id: &str, prompt: Prompt) {
        tracing::debug!(user = user_id, ?prompt, "Prompting user");
        match prompt {
            Prompt::Photo { kind, .. } => {
                println!("> {user_id}: send a photo of the meter's {kind} reading");
            }
            Prompt::ManualEntry { kind, .. } => {
                println!("> {user_id}: type the meter's {kind} reading in kWh");
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Backend;
    use meter_core::{MeterConfig, SessionStore};
    use meter_ocr::MockRecognizer;
    use meter_verify::VerificationService;
    use std::sync::Arc;

    async fn app(text: &str) -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let db = meter_storage::create_db(&dir.path().join("sessions.db")).await.unwrap();
        let sessions: Arc<dyn SessionStore> =
            Arc::new(meter_storage::SqliteSessionStore::new(db.clone()));
        let recognizer: Backend = Box::new(MockRecognizer::new(text));
        let service = Arc::new(VerificationService::from_config(
            recognizer,
            &MeterConfig::default(),
            sessions,
            Arc::new(ConsolePrompter) as Arc<dyn Prompter>,
        ));
        (dir, AppState { db, service })
    }

    async fn run(state: &AppState, line: &str) -> String {
        execute(state, parse(line).unwrap()).await.unwrap()
    }

    #[test]
    fn parses_commands() {
        assert_eq!(
            parse("start alice s1").unwrap(),
            Command::Begin { user: "alice".into(), session: "s1".into(), kind: ReadingKind::Start }
        );
        assert_eq!(
            parse("manual bob 1245,8 kWh").unwrap(),
            Command::Manual { user: "bob".into(), text: "1245,8 kWh".into() }
        );
        assert_eq!(
            parse("session s1 50").unwrap(),
            Command::Session { id: "s1".into(), power_kw: Some(Decimal::from(50)), battery_kwh: None }
        );
        assert_eq!(parse("QUIT").unwrap(), Command::Quit);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse("start alice").unwrap_err().message.starts_with("usage:"));
        assert!(parse("photo alice").is_err());
        assert!(parse("session s1 fast").unwrap_err().message.contains("not a number"));
        assert!(parse("dance").unwrap_err().message.contains("unknown command"));
    }

    #[tokio::test]
    async fn manual_start_and_end_flow() {
        let (_dir, state) = app("").await;
        run(&state, "session s1").await;

        run(&state, "start alice s1").await;
        assert!(run(&state, "manual alice 1000").await.starts_with("Got 1000 kWh"));
        assert_eq!(run(&state, "confirm alice").await, "Start reading 1000 kWh saved for session s1");

        run(&state, "end alice s1").await;
        run(&state, "manual alice 1012.5").await;
        let reply = run(&state, "confirm alice").await;
        assert!(reply.contains("consumed 12.5 kWh"), "{reply}");

        let session = meter_storage::get_session(&state.db, "s1").await.unwrap().unwrap();
        assert_eq!(session.consumption.unwrap().to_string(), "12.5 kWh");
    }

    #[tokio::test]
    async fn photo_flow_reads_file() {
        let (dir, state) = app("METER: 1245.8 KWH").await;
        let path = dir.path().join("meter.png");
        image::DynamicImage::new_luma8(16, 16).save(&path).unwrap();

        run(&state, "start alice s1").await;
        assert_eq!(run(&state, "retake alice").await, "Nothing to retake (awaiting_photo)");
        let reply = run(&state, &format!("photo alice {}", path.display())).await;
        assert!(reply.starts_with("Read 1245.8 kWh"), "{reply}");
        assert!(run(&state, "status alice").await.contains("awaiting_confirmation"));
        assert_eq!(run(&state, "retake alice").await, "Send a new photo when ready");
    }

    #[tokio::test]
    async fn unknown_user_surfaces_error() {
        let (_dir, state) = app("").await;
        let err = execute(&state, parse("confirm nobody").unwrap()).await.unwrap_err();
        assert!(err.message.contains("No active meter verification"));
        assert_eq!(run(&state, "cancel nobody").await, "nobody has no active verification");
    }
}
