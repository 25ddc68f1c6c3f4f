//! Releases big-value swaps automatically once they have waited long enough

use super::verify::VerifyEngine;
use super::WorkerContext;
use crate::swap::{now, RecordStatus};

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

pub struct PassBigValueJob {
    ctx: WorkerContext,
    verify: Arc<VerifyEngine>,
}

impl PassBigValueJob {
    pub fn new(ctx: WorkerContext, verify: Arc<VerifyEngine>) -> Self {
        Self { ctx, verify }
    }

    pub async fn run(self: Arc<Self>) {
        if !self.ctx.worker().enable_pass_big_value {
            info!("Pass big value job disabled");
            return;
        }
        info!("Pass big value job started");
        let interval = Duration::from_secs(self.ctx.worker().pass_big_value_interval_secs.max(1));
        loop {
            self.pass_once().await;
            if !self.ctx.shutdown.sleep(interval).await {
                break;
            }
        }
        info!("Pass big value job stopped");
    }

    /// Release every held swap detected before the waiting period; returns how many
    pub async fn pass_once(&self) -> usize {
        let worker = self.ctx.worker();
        let since = self.ctx.since(worker.max_verify_lifetime_secs);
        let records = match self
            .ctx
            .store
            .find_swaps_with_status(RecordStatus::BigValue, since)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                error!("Failed to find big value swaps: {}", e);
                return 0;
            }
        };

        let held_before = now() - worker.pass_big_value_after_secs as i64;
        let mut passed = 0;
        for record in records.iter().filter(|r| r.init_time < held_before) {
            match self.verify.pass_big_value(&record.key()).await {
                Ok(()) => passed += 1,
                Err(e) => warn!("Pass big value of {} failed: {}", record.key(), e),
            }
        }
        passed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SwapStore;
    use crate::test_utils::{sample_record, TestHarness};

    #[tokio::test]
    async fn test_only_old_big_values_are_passed() {
        let h = TestHarness::new();

        let mut old = sample_record(RecordStatus::BigValue);
        old.init_time = now() - 2 * 86400;
        h.src.add_swap(old.to_swap_info());
        h.store.put_swap(old.clone()).await;

        let mut fresh = sample_record(RecordStatus::BigValue);
        fresh.tx_id = "0x0000000000000000000000000000000000000000000000000000000000000f2e".into();
        h.src.add_swap(fresh.to_swap_info());
        h.store.put_swap(fresh.clone()).await;

        assert_eq!(h.workers.pass_big_value.pass_once().await, 1);
        assert_eq!(
            h.store.find_swap(&old.key()).await.unwrap().status,
            RecordStatus::Swappable
        );
        assert_eq!(
            h.store.find_swap(&fresh.key()).await.unwrap().status,
            RecordStatus::BigValue
        );
    }
}
