use std::{ops::Sub, sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use futures::{stream::FuturesOrdered, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::backend::ExecutionLog;

use super::PrunerConfig;

pub(crate) struct PrunerRunner {
    config: PrunerConfig,
    log: Arc<dyn ExecutionLog>,
}

impl PrunerRunner {
    pub fn new(log: Arc<dyn ExecutionLog>, config: PrunerConfig) -> Self {
        Self { log, config }
    }

    pub fn spawn(self, cancellation_token: CancellationToken) {
        tokio::spawn({
            async move {
                loop {
                    let Some(next) = self.config.schedule.upcoming(Utc).next() else {
                        tracing::warn!("No future scheduled time for the execution pruner");
                        break;
                    };
                    let delay = next
                        .sub(Utc::now())
                        .sub(TimeDelta::milliseconds(10))
                        .to_std()
                        .unwrap_or(Duration::ZERO);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            self.prune().await;
                            if let Ok(delay) = (next - Utc::now()).to_std() {
                                tokio::time::sleep(delay).await;
                            }
                        }
                        _ = cancellation_token.cancelled() => {
                            tracing::debug!("Shutting down the execution pruner");
                            break;
                        },
                    }
                }
            }
        });
    }

    async fn prune(&self) {
        self.config
            .pruners
            .iter()
            .map(|prune_spec| self.log.prune(prune_spec))
            .collect::<FuturesOrdered<_>>()
            .for_each_concurrent(self.config.max_concurrency, |res| async move {
                match res {
                    Ok(count) => tracing::debug!(count, "Pruned {count} execution records"),
                    Err(err) => {
                        tracing::error!(?err, "Failed to prune execution records with error {err}")
                    }
                }
            })
            .await;
    }
}
