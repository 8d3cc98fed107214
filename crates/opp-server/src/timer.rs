//! Clock that fires `time_changed` on every second boundary

use chrono::{DateTime, Timelike, Utc};
use opp_core::events::{TimeChangedData, TimerOutOfSyncData, TIMER_OUT_OF_SYNC, TIME_CHANGED};
use opp_core::{Context, EventOrigin};
use opp_event_bus::SharedEventBus;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

/// Ticks later than this are reported as `timer_out_of_sync`
const MAX_LATENESS: Duration = Duration::from_secs(1);

/// Time left until the next whole second after `now`
fn until_next_second(now: DateTime<Utc>) -> Duration {
    let nanos = u64::from(now.nanosecond() % 1_000_000_000);
    Duration::from_nanos(1_000_000_000 - nanos)
}

struct Timer {
    bus: SharedEventBus,
    /// Shared by every event of this timer
    context: Context,
}

impl Timer {
    /// Fire the events of one tick that was due at `target`
    fn tick(&self, target: Instant) -> DateTime<Utc> {
        let now = Utc::now();
        self.bus.fire_with(
            TIME_CHANGED,
            serde_json::to_value(TimeChangedData { now }).ok(),
            EventOrigin::Local,
            Some(self.context.clone()),
            Some(now),
        );

        let late = Instant::now().saturating_duration_since(target);
        if late > MAX_LATENESS {
            warn!(seconds = late.as_secs_f64(), "Timer got out of sync");
            self.bus.fire_with(
                TIMER_OUT_OF_SYNC,
                serde_json::to_value(TimerOutOfSyncData {
                    seconds: late.as_secs_f64(),
                })
                .ok(),
                EventOrigin::Local,
                Some(self.context.clone()),
                Some(now),
            );
        }
        now
    }

    async fn run(self) {
        let mut now = Utc::now();
        loop {
            let target = Instant::now() + until_next_second(now);
            tokio::time::sleep_until(target).await;
            now = self.tick(target);
        }
    }
}

/// Start the timer on the current runtime
///
/// The task is not tracked by the scheduler, so waiting for pending work
/// never waits for the clock. Abort the handle to stop it.
pub(crate) fn start_timer(bus: SharedEventBus) -> JoinHandle<()> {
    info!("Timer:starting");
    let runtime = bus.scheduler().runtime().clone();
    runtime.spawn(
        Timer {
            bus,
            context: Context::new(),
        }
        .run(),
    )
}
