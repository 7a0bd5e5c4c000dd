//! Periodic consistency checks.
//!
//! Push events can be lost. The guard sweep clears guard entries whose
//! instance has already settled, so a dropped terminal event cannot lock an
//! instance out of start/stop for good. Guards for ids with no record are
//! cleared too. The existence resync drops records
//! the backend no longer knows about, covering a lost `instance-removed`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::context::{log_best_effort, EngineContext};
use crate::error::GatewayError;
use crate::instance::InstanceStatus;

/// Floor for both periods; `interval_at` rejects a zero period.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// One guard sweep. Returns the ids it cleared.
pub(crate) fn sweep(ctx: &EngineContext) -> Vec<String> {
    let mut cleared = Vec::new();
    for id in ctx.guard.snapshot() {
        match ctx.store.status(&id) {
            Some(status) if status.is_terminal() => {
                if ctx.guard.release(&id) {
                    tracing::warn!(
                        "Failsafe clear of operation guard for {id} (status {status})"
                    );
                    cleared.push(id);
                }
            }
            Some(_) => {}
            None => {
                if ctx.guard.release(&id) {
                    tracing::warn!(
                        "Failsafe clear of operation guard for {id} (no instance record)"
                    );
                    cleared.push(id);
                }
            }
        }
    }
    cleared
}

/// Sweeps every `sweep_interval` while the guard holds anything; idles otherwise.
pub(crate) async fn run_sweeper(ctx: Arc<EngineContext>) {
    let shutdown = ctx.shutdown_token();
    let mut guarded = ctx.guard.subscribe();
    let period = ctx.settings.sweep_interval.max(MIN_PERIOD);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            alive = async { guarded.wait_for(|ids| !ids.is_empty()).await.is_ok() } => {
                if !alive {
                    return;
                }
            }
        }

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            sweep(&ctx);
            if ctx.guard.is_empty() {
                break;
            }
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct ResyncReport {
    pub removed: Vec<String>,
    pub added: Vec<String>,
}

/// Compare the store with the backend's list.
///
/// Only ids that were already known before the call (for removal) or still
/// unknown after it (for insertion) are touched, so records created or
/// deleted locally while the list was in flight are left alone. Guarded and
/// installing records are never removed.
pub(crate) async fn resync(ctx: &EngineContext) -> Result<ResyncReport, GatewayError> {
    let known_before: HashSet<String> = ctx.store.ids().into_iter().collect();
    let gateway = ctx.gateway.clone();
    let Some(listing) = ctx.unless_torn_down(gateway.list_instances()).await else {
        return Ok(ResyncReport::default());
    };
    let remote = listing?;
    let remote_ids: HashSet<&str> = remote.iter().map(|i| i.id.as_str()).collect();

    let mut report = ResyncReport::default();
    for id in ctx.store.ids() {
        if remote_ids.contains(id.as_str()) || !known_before.contains(&id) {
            continue;
        }
        if ctx.guard.contains(&id) || ctx.store.status(&id) == Some(InstanceStatus::Installing) {
            continue;
        }
        if ctx.store.remove(&id).is_some() {
            tracing::info!("Instance {id} no longer exists on the backend, dropping it");
            report.removed.push(id);
        }
    }

    for instance in remote {
        if known_before.contains(&instance.id) {
            continue;
        }
        let id = instance.id.clone();
        if ctx.store.insert_if_absent(instance) {
            tracing::info!("Picked up instance {id} from the backend");
            report.added.push(id);
        }
    }
    Ok(report)
}

pub(crate) async fn run_resync(ctx: Arc<EngineContext>, period: Duration) {
    let period = period.max(MIN_PERIOD);
    let shutdown = ctx.shutdown_token();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        match resync(&ctx).await {
            Ok(report) if !report.removed.is_empty() || !report.added.is_empty() => {
                tracing::debug!(
                    "Resync dropped {} and added {} instances",
                    report.removed.len(),
                    report.added.len()
                );
            }
            Ok(_) => {}
            Err(e) => log_best_effort("Existence resync", "all instances", &e),
        }
    }
}
