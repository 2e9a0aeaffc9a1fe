//! Background tasks for the IIN agent.
//!
//! Includes:
//! - Periodic sync of every foreign security domain.
//! - Sweeping protocol runs that never completed.

use iin_protocol::IinAgent;
use iin_types::SecurityDomainMemberIdentity;
use tokio::time::{sleep, Duration};

/// Interval between sweeps for a given run timeout: half the timeout,
/// clamped to 1..=60 seconds.
pub fn sweep_interval(run_timeout: Duration) -> Duration {
    Duration::from_secs((run_timeout.as_secs() / 2).clamp(1, 60))
}

/// Starts the stranded-run sweeper.
///
/// Runs indefinitely, failing and removing runs older than the agent's run
/// timeout.
pub async fn start_sweeper_task(agent: IinAgent) {
    let run_timeout = agent.config().run_timeout;
    let interval = sweep_interval(run_timeout);

    tracing::info!(
        run_timeout_secs = run_timeout.as_secs(),
        interval_secs = interval.as_secs(),
        "starting stranded run sweeper"
    );

    loop {
        sleep(interval).await;
        let swept = agent.sweep_stranded_runs().await;
        if swept > 0 {
            tracing::debug!(swept, "sweeper pass finished");
        }
    }
}

/// Starts syncs for every configured foreign domain; returns how many
/// were accepted.
pub fn sync_foreign_domains(agent: &IinAgent) -> usize {
    let mut started = 0;
    for domain in agent.foreign_domains() {
        let target = SecurityDomainMemberIdentity::new(&domain, "");
        match agent.sync_external_state(&target) {
            Ok(ack) => {
                started += 1;
                tracing::info!(security_domain = %domain, nonce = %ack.request_id, "auto-sync started");
            }
            Err(e) => {
                tracing::error!(security_domain = %domain, error = %e, "auto-sync failed to start");
            }
        }
    }
    started
}

/// Starts the auto-sync task.
///
/// Every `period` the agent re-syncs all foreign domains. A zero period
/// disables the task.
pub async fn start_auto_sync_task(agent: IinAgent, period: Duration) {
    if period.is_zero() {
        tracing::warn!("auto-sync task disabled (sync_period=0)");
        return;
    }

    tracing::info!(
        period_secs = period.as_secs(),
        domains = agent.foreign_domains().len(),
        "starting auto-sync task"
    );

    loop {
        sync_foreign_domains(&agent);
        sleep(period).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_interval_is_clamped() {
        assert_eq!(sweep_interval(Duration::ZERO), Duration::from_secs(1));
        assert_eq!(sweep_interval(Duration::from_secs(30)), Duration::from_secs(15));
        assert_eq!(sweep_interval(Duration::from_secs(300)), Duration::from_secs(60));
    }
}
