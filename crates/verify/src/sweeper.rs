use chrono::Utc;
use meter_ocr::OcrBackend;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::service::VerificationService;

/// Periodically drop expired verifications. Runs on its own task, so a slow
/// OCR call never delays it and it never waits on one.
pub fn spawn_sweeper<R>(service: Arc<VerificationService<R>>, every: Duration) -> JoinHandle<()>
where
    R: OcrBackend + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            service.cleanup_expired(Utc::now());
        }
    })
}
