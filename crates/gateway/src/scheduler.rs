//! Background maintenance.
//!
//! Three periodic jobs at coprime intervals so their ticks drift apart:
//! the tree/user timeout sweep (29 s), client idle restart (31 s), and the
//! resource report (1103 s). Each job runs serially on its own task (a
//! slow pass skips the ticks it missed rather than piling up) and the
//! jobs touch disjoint state, so they may overlap each other freely.

use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::resources;
use crate::state::AppState;

const TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_secs(29);
const CLIENT_RESTART_INTERVAL: Duration = Duration::from_secs(31);
const RESOURCE_REPORT_INTERVAL: Duration = Duration::from_secs(1103);

/// Start the maintenance jobs. Runs until the process exits.
pub fn start(state: AppState) {
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TIMEOUT_SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                state.users.check_all_trees_timeout().await;
                state.users.check_all_users_timeout().await;
            }
        });
    }

    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLIENT_RESTART_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                state.users.check_restart_clients().await;
            }
        });
    }

    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RESOURCE_REPORT_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let Err(e) = resources::report(&state).await {
                    tracing::warn!(error = %e, "resource report failed");
                }
            }
        });
    }

    tracing::info!(
        sweep_secs = TIMEOUT_SWEEP_INTERVAL.as_secs(),
        restart_secs = CLIENT_RESTART_INTERVAL.as_secs(),
        report_secs = RESOURCE_REPORT_INTERVAL.as_secs(),
        "scheduler started"
    );
}
