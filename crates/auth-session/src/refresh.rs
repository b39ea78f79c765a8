//! Proactive background token refresh
//!
//! Spawns a periodic task that refreshes the session's tokens shortly before
//! the access token expires, so callers rarely hold an expired token. The
//! task runs independently of the operations it races with; the controller
//! serializes them.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::controller::AuthSessionController;

/// Spawn a background task that proactively refreshes an expiring session.
///
/// Runs every `interval` and refreshes when the access token expires within
/// `threshold`. A failed refresh has already cleared the session by the time
/// it is logged here; the task keeps running and picks up the next session.
///
/// Returns a `JoinHandle` for the spawned task.
pub fn spawn_refresh_task(
    controller: Arc<AuthSessionController>,
    interval: Duration,
    threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick; the session was just loaded.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            refresh_cycle(&controller, threshold).await;
        }
    })
}

/// Run one refresh cycle. Returns whether a refresh was attempted.
async fn refresh_cycle(controller: &AuthSessionController, threshold: Duration) -> bool {
    let Some(session) = controller.session().await else {
        return false;
    };
    // Opaque tokens carry no expiry; nothing to schedule against.
    let Some(expires_at) = session.expires_at else {
        return false;
    };

    let remaining = expires_at - Utc::now();
    let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
    if remaining > threshold {
        return false;
    }

    debug!(
        principal_id = %session.user.auth_principal_id,
        remaining_secs = remaining.num_seconds(),
        "access token expiring within threshold, refreshing"
    );
    match controller.refresh().await {
        Ok(_) => info!("background token refresh succeeded"),
        Err(e) => warn!(error = %e, "background token refresh failed, session cleared"),
    }
    true
}
