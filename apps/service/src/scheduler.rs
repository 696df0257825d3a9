use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval};

use crate::checks::CheckRunner;

/// Run check cycles forever on a fixed cadence. The first cycle starts
/// immediately; a cycle that overruns the interval delays the next tick
/// instead of stacking up.
pub async fn run_forever(mut runner: CheckRunner, period: Duration) {
    let mut timer = interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        timer.tick().await;
        tracing::info!("starting check cycle");
        let started = std::time::Instant::now();
        match runner.run_cycle().await {
            Ok(()) => {
                tracing::info!("check cycle finished in {:.1?}", started.elapsed());
            }
            Err(err) => {
                tracing::error!("check cycle failed: {err:#}");
            }
        }
    }
}
