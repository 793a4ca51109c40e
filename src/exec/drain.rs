//! Shutdown drain - bounded wait for exec sessions on termination
//!
//! When the termination signal arrives, in-flight exec sessions get a
//! window to finish. The drain polls the registry, logging the outstanding
//! session ids, until it empties or the window expires; expiry force-closes
//! whatever is left.

use super::registry::ExecRegistry;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::defaults::SHUTDOWN_DRAIN_POLL_MS;

/// How the drain finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// No sessions were active when the signal arrived
    Immediate,
    /// All sessions finished inside the window
    Drained,
    /// The window expired; remaining sessions were force-closed
    ForcedExit,
}

/// Wait for active exec sessions to finish, up to `timeout`.
pub async fn run_drain(registry: &ExecRegistry, timeout: Duration) -> DrainOutcome {
    run_drain_with_poll(registry, timeout, Duration::from_millis(SHUTDOWN_DRAIN_POLL_MS)).await
}

/// Drain with an explicit poll interval (tests shrink it).
pub async fn run_drain_with_poll(
    registry: &ExecRegistry,
    timeout: Duration,
    poll: Duration,
) -> DrainOutcome {
    if registry.is_empty() {
        info!("Shutdown drain: no active exec sessions");
        return DrainOutcome::Immediate;
    }

    let deadline = Instant::now() + timeout;
    info!(
        active = registry.len(),
        window_secs = timeout.as_secs(),
        "Shutdown drain: waiting for exec sessions"
    );

    loop {
        tokio::time::sleep(poll.min(deadline.saturating_duration_since(Instant::now()))).await;

        if registry.is_empty() {
            info!("Shutdown drain: all exec sessions finished");
            return DrainOutcome::Drained;
        }
        if Instant::now() >= deadline {
            let outstanding = registry.active_ids();
            warn!(
                outstanding = ?outstanding,
                "Shutdown drain window expired — force-closing sessions"
            );
            registry.close_all().await;
            return DrainOutcome::ForcedExit;
        }

        info!(outstanding = ?registry.active_ids(), "Shutdown drain: sessions still active");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::registry::ExecSessionInfo;
    use crate::exec::session::ExecSessionHandle;
    use chrono::Utc;

    fn make_info(session_id: &str) -> ExecSessionInfo {
        ExecSessionInfo {
            session_id: session_id.to_string(),
            sprite_id: "s1".to_string(),
            command: "sleep".to_string(),
            started_at: Utc::now(),
            handle: ExecSessionHandle::detached(session_id),
        }
    }

    #[tokio::test]
    async fn test_empty_registry_exits_immediately() {
        let registry = ExecRegistry::new();
        let outcome = run_drain(&registry, Duration::from_secs(600)).await;
        assert_eq!(outcome, DrainOutcome::Immediate);
    }

    #[tokio::test]
    async fn test_drains_when_sessions_finish() {
        let registry = ExecRegistry::new();
        registry.register(make_info("exec_a"));

        let registry2 = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            registry2.remove("exec_a");
        });

        let outcome = run_drain_with_poll(
            &registry,
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await;
        assert_eq!(outcome, DrainOutcome::Drained);
    }

    #[tokio::test]
    async fn test_window_expiry_forces_exit() {
        let registry = ExecRegistry::new();
        registry.register(make_info("exec_stuck"));

        let outcome = run_drain_with_poll(
            &registry,
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .await;
        assert_eq!(outcome, DrainOutcome::ForcedExit);
    }
}
