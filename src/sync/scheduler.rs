use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::time::{interval, Duration as TokioDuration};
use tokio_util::sync::CancellationToken;

use crate::sync::SyncService;

const SCHEDULER_TICK: TokioDuration = TokioDuration::from_secs(60);

/// Drives auto-sync: every tick, each database with auto-sync enabled whose
/// interval has elapsed gets a bidirectional pass (or whatever direction it
/// is configured for). Concurrent runs per database are serialized inside
/// [`SyncService::sync_now`].
pub struct AutoSyncScheduler {
    service: Arc<SyncService>,
    cancel: CancellationToken,
}

impl AutoSyncScheduler {
    pub fn new(service: Arc<SyncService>) -> Self {
        Self {
            service,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn start(self: Arc<Self>) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(SCHEDULER_TICK);
            loop {
                tokio::select! {
                    _ = scheduler.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = scheduler.tick().await {
                            log::warn!("auto-sync tick failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    async fn tick(&self) -> Result<(), crate::error::SyncError> {
        let configs = self.service.store().list_external_databases().await?;

        for config in configs {
            if !config.sync_settings.auto_sync {
                continue;
            }
            if !self.is_due(&config.base.id, config.sync_settings.interval_minutes).await? {
                continue;
            }

            log::info!("scheduled sync for database {}", config.name);
            if let Err(e) = self
                .service
                .sync_now(&config.base.id, Some(config.sync_settings.direction))
                .await
            {
                log::warn!("scheduled sync for {} failed: {}", config.name, e);
            }
        }
        Ok(())
    }

    async fn is_due(
        &self,
        database_id: &str,
        interval_minutes: u32,
    ) -> Result<bool, crate::error::SyncError> {
        let last = self.service.store().last_completed_sync(database_id).await?;
        match last {
            None => Ok(true),
            Some(last) => {
                let next = last + Duration::minutes(interval_minutes as i64);
                Ok(Utc::now() >= next)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    #[test]
    fn interval_arithmetic() {
        let last = Utc::now() - Duration::minutes(20);
        let next = last + Duration::minutes(15);
        assert!(Utc::now() >= next);

        let recent = Utc::now() - Duration::minutes(5);
        let next = recent + Duration::minutes(15);
        assert!(Utc::now() < next);
    }
}
