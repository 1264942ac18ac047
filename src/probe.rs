//! Probes
//!
//! A probe crawls some external data source and reports what it found as
//! entity snapshots. Each batch is installed as shadow replicas homed at the
//! probe's source identifier. Shadow replicas can be read and conveyed to
//! peers but never locked for writing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::Result;
use crate::identifier::NodeIdentifier;
use crate::node::MeshBase;
use crate::replication::EntitySnapshot;

/// A crawler over an external data source
#[async_trait]
pub trait Probe: Send + Sync {
    /// Synthetic home of every replica this probe produces
    fn source(&self) -> &NodeIdentifier;

    /// Crawl once and return the current state of the source
    async fn crawl(&self) -> Result<Vec<EntitySnapshot>>;
}

/// Runs a probe on a fixed interval
pub struct ProbeScheduler;

impl ProbeScheduler {
    /// Crawl now and then every `interval` until the node shuts down
    pub fn spawn(mesh: MeshBase, probe: Arc<dyn Probe>, interval: Duration) -> JoinHandle<()> {
        let mut shutdown = mesh.shutdown_signal();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!("Probe {} scheduled every {:?}", probe.source(), interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_once(&mesh, probe.as_ref()).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Probe {} stopped", probe.source());
        })
    }
}

/// Crawl once and install the batch. Failures are logged; the previous batch
/// stays in place.
pub async fn run_once(mesh: &MeshBase, probe: &dyn Probe) {
    match probe.crawl().await {
        Ok(batch) => {
            tracing::debug!("Probe {} produced {} snapshot(s)", probe.source(), batch.len());
            mesh.apply_probe_batch(probe.source(), &batch).await;
        }
        Err(e) => tracing::warn!("Probe {} crawl failed: {}", probe.source(), e),
    }
}
