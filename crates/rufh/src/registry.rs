//! Process-wide map of live uploads.
//!
//! The registry is the single discovery point shared by all in-flight
//! transactions. It serializes record creation and lookup; everything that
//! happens to a record afterwards is governed by the record's own producer
//! slot. Its lifetime is tied to the middleware instance, so the sweeper
//! task only holds a weak reference and winds down with it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;

use crate::error::RufhError;
use crate::fields::UploadToken;
use crate::options::{CreateConflict, RufhOptions};
use crate::record::{CreateParams, ProducerGuard, UploadRecord};

#[derive(Default)]
pub(crate) struct UploadRegistry {
    uploads: Mutex<HashMap<UploadToken, Arc<UploadRecord>>>,
    sweeping: AtomicBool,
}

impl UploadRegistry {
    /// Atomically insert a fresh record with the creating transaction
    /// already holding the producer slot.
    ///
    /// A token already on record is resolved by the configured
    /// [`CreateConflict`] policy.
    pub(crate) fn create_attached(
        &self,
        token: UploadToken,
        params: CreateParams,
        options: &RufhOptions,
    ) -> Result<(Arc<UploadRecord>, ProducerGuard), RufhError> {
        let mut uploads = self.uploads.lock();
        if let Some(existing) = uploads.get(&token) {
            match options.create_conflict {
                CreateConflict::Reject => return Err(RufhError::AlreadyExists),
                CreateConflict::Replace => {
                    tracing::debug!(token = %token.to_segment(), "replacing existing upload");
                    existing.terminate();
                }
            }
        }
        let (record, guard) = UploadRecord::new_attached(token.clone(), params, options.buffer_size);
        uploads.insert(token, record.clone());
        Ok((record, guard))
    }

    pub(crate) fn find(&self, token: &UploadToken) -> Option<Arc<UploadRecord>> {
        self.uploads.lock().get(token).cloned()
    }

    pub(crate) fn remove(&self, token: &UploadToken) {
        self.uploads.lock().remove(token);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.uploads.lock().len()
    }

    /// Spawn the eviction sweeper on first use. The task keeps only a weak
    /// reference and exits once the registry is gone.
    pub(crate) fn ensure_sweeper(self: &Arc<Self>, options: &RufhOptions) {
        if self.sweeping.swap(true, Ordering::SeqCst) {
            return;
        }
        let registry = Arc::downgrade(self);
        let idle = options.idle_timeout;
        let tick = options.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                registry.sweep(idle);
            }
        });
    }

    fn sweep(&self, idle: std::time::Duration) {
        let expired: Vec<Arc<UploadRecord>> = {
            let uploads = self.uploads.lock();
            uploads
                .values()
                .filter(|record| record.expired(idle))
                .cloned()
                .collect()
        };
        for record in expired {
            tracing::debug!(token = %record.token().to_segment(), "evicting stale upload");
            record.terminate();
            self.remove(record.token());
        }
    }
}
