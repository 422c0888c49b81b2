//! Fixed-period scheduling for maintenance tasks.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Run `tick` every `period` until `shutdown` flips to `true` or its sender
/// is dropped. The first tick runs immediately.
///
/// `tick` is awaited to completion; a shutdown arriving mid-tick takes
/// effect once it returns. Errors are the tick's own business to log.
pub async fn run_periodically<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(task = name, period_secs = period.as_secs_f64(), "Scheduled task started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = ticker.tick() => {
                debug!(task = name, "Scheduled task tick");
                tick().await;
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!(task = name, "Scheduled task stopped");
}
