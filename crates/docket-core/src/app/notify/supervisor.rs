//! Restart-on-death loop around a [`NotificationSource`].

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::NotificationSource;
use crate::app::backoff::RestartPolicy;

/// Run `source` until `cancel` fires or it fails fatally.
///
/// - clean end of feed: reopen after the base delay, failure count reset
/// - transient error: reopen after an exponential, capped delay
/// - fatal error: log and stop; the host keeps running without push wake-ups
pub(crate) async fn supervise(
    mut source: Box<dyn NotificationSource>,
    policy: RestartPolicy,
    cancel: CancellationToken,
) {
    let name = source.name();
    let mut failures: u32 = 0;

    while !cancel.is_cancelled() {
        let delay = match source.run_once(&cancel).await {
            Ok(()) => {
                if cancel.is_cancelled() {
                    break;
                }
                failures = 0;
                debug!(strategy = name, "notification feed ended; reopening");
                policy.base_delay
            }
            Err(e) if e.is_fatal() => {
                error!(
                    strategy = name,
                    error = %e,
                    "notification bridge stopped; dequeues fall back to polling"
                );
                return;
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                let delay = policy.next_delay(failures);
                warn!(
                    strategy = name,
                    attempt = failures,
                    ?delay,
                    error = %e,
                    "notification feed failed; restarting"
                );
                delay
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!(strategy = name, "notification bridge shut down");
}
