//! Replica Sweeper
//!
//! Periodically evicts dependent replicas whose expiry time has passed and
//! that nobody else depends on. The home of each evicted replica is told to
//! stop sending deltas.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::node::MeshBase;

pub struct Sweeper;

impl Sweeper {
    pub fn spawn(mesh: MeshBase, interval: Duration) -> JoinHandle<()> {
        let mut shutdown = mesh.shutdown_signal();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = mesh.sweep().await;
                        if evicted > 0 {
                            tracing::debug!("Swept {} expired replica(s)", evicted);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Sweeper stopped");
        })
    }
}
