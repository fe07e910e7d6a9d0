//! Two-level bucket registry: signature → box → path → bucket.
//!
//! Lock order is registry map → box bucket map → bucket. A lock is never
//! taken while a lock later in that order is held, by requests and by the
//! reaper alike.

use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::bucket::{Admission, Bucket};
use super::rate::RateSpec;
use super::signature::ClientSignature;

/// Entries removed by one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub buckets_removed: usize,
    pub boxes_removed: usize,
}

#[derive(Debug)]
struct BoxInner {
    buckets: HashMap<String, Arc<Bucket>>,
    /// Creation time, raised to the newest bucket access seen.
    last_activity: Instant,
    /// Set once the box has been unlinked from the registry.
    retired: bool,
}

/// All buckets belonging to one client signature.
#[derive(Debug)]
pub struct ClientBox {
    signature: ClientSignature,
    inner: RwLock<BoxInner>,
}

impl ClientBox {
    fn new(signature: ClientSignature, now: Instant) -> Self {
        Self {
            signature,
            inner: RwLock::new(BoxInner {
                buckets: HashMap::new(),
                last_activity: now,
                retired: false,
            }),
        }
    }

    pub fn signature(&self) -> &ClientSignature {
        &self.signature
    }

    /// Number of buckets currently held.
    pub fn len(&self) -> usize {
        self.inner.read().buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the bucket for `path`, seeding a full one from `quota` if absent.
    ///
    /// Returns `None` if the box was retired by the reaper; the caller must
    /// fetch the box again.
    pub fn get_or_create_bucket(
        &self,
        path: &str,
        quota: RateSpec,
        now: Instant,
    ) -> Option<Arc<Bucket>> {
        {
            let inner = self.inner.read();
            if inner.retired {
                return None;
            }
            if let Some(bucket) = inner.buckets.get(path) {
                return Some(Arc::clone(bucket));
            }
        }

        let mut inner = self.inner.write();
        if inner.retired {
            return None;
        }
        let bucket = match inner.buckets.entry(path.to_string()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                debug!(
                    signature = %self.signature,
                    path = path,
                    capacity = quota.capacity(),
                    refill_period = ?quota.refill_period(),
                    "Creating new bucket"
                );
                Arc::clone(entry.insert(Arc::new(Bucket::new(quota, now))))
            }
        };
        inner.last_activity = inner.last_activity.max(now);
        Some(bucket)
    }

    /// Look up an existing bucket.
    pub fn bucket(&self, path: &str) -> Option<Arc<Bucket>> {
        self.inner.read().buckets.get(path).cloned()
    }

    /// Drop buckets idle for `bucket_ttl`. Returns how many were removed and
    /// whether the box itself is now empty and idle for `box_ttl`.
    fn reap_buckets(&self, now: Instant, bucket_ttl: Duration, box_ttl: Duration) -> (usize, bool) {
        let mut inner = self.inner.write();
        let before = inner.buckets.len();
        let mut last_activity = inner.last_activity;

        inner.buckets.retain(|_, bucket| {
            let check = bucket.retire_if_idle(now, bucket_ttl);
            last_activity = last_activity.max(check.last_access_at);
            !check.retired
        });
        inner.last_activity = last_activity;

        let removed = before - inner.buckets.len();
        let idle = inner.buckets.is_empty()
            && now.saturating_duration_since(last_activity) >= box_ttl;
        (removed, idle)
    }

    /// Mark the box retired if it is still empty and idle. Must be called
    /// with the registry write lock held.
    fn retire_if_idle(&self, now: Instant, box_ttl: Duration) -> bool {
        let mut inner = self.inner.write();
        if inner.buckets.is_empty()
            && now.saturating_duration_since(inner.last_activity) >= box_ttl
        {
            inner.retired = true;
        }
        inner.retired
    }
}

/// Concurrent store of every client's buckets.
///
/// Owned by whoever builds the limiter; there is no global instance.
#[derive(Debug, Default)]
pub struct BucketRegistry {
    boxes: RwLock<HashMap<ClientSignature, Arc<ClientBox>>>,
}

impl BucketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the box for `signature`, creating it on first use.
    ///
    /// Racing creators all receive the same box.
    pub fn get_or_create_box(&self, signature: &ClientSignature, now: Instant) -> Arc<ClientBox> {
        if let Some(client_box) = self.boxes.read().get(signature) {
            return Arc::clone(client_box);
        }

        let mut boxes = self.boxes.write();
        let client_box = boxes.entry(signature.clone()).or_insert_with(|| {
            debug!(signature = %signature, "Creating new client box");
            Arc::new(ClientBox::new(signature.clone(), now))
        });
        Arc::clone(client_box)
    }

    /// Look up an existing box.
    pub fn get_box(&self, signature: &ClientSignature) -> Option<Arc<ClientBox>> {
        self.boxes.read().get(signature).cloned()
    }

    /// Charge one request to the (signature, path) bucket, creating the box
    /// and bucket as needed.
    ///
    /// If the reaper retires the box or bucket between lookup and use, the
    /// lookup is repeated, so a live request always lands in a live bucket.
    pub fn acquire(
        &self,
        signature: &ClientSignature,
        path: &str,
        quota: RateSpec,
        now: Instant,
    ) -> Admission {
        loop {
            let client_box = self.get_or_create_box(signature, now);
            let Some(bucket) = client_box.get_or_create_bucket(path, quota, now) else {
                continue;
            };
            if let Some(admission) = bucket.try_acquire(now) {
                return admission;
            }
        }
    }

    /// Remove buckets idle for `bucket_ttl`, then boxes left empty and idle
    /// for `box_ttl`.
    pub fn sweep(&self, now: Instant, bucket_ttl: Duration, box_ttl: Duration) -> SweepStats {
        let boxes: Vec<Arc<ClientBox>> = self.boxes.read().values().cloned().collect();

        let mut stats = SweepStats::default();
        let mut idle = Vec::new();
        for client_box in boxes {
            let (removed, is_idle) = client_box.reap_buckets(now, bucket_ttl, box_ttl);
            stats.buckets_removed += removed;
            if is_idle {
                idle.push(client_box.signature().clone());
            }
        }

        if !idle.is_empty() {
            let mut boxes = self.boxes.write();
            for signature in idle {
                // A request may have repopulated the box since it was inspected
                let retired = boxes
                    .get(&signature)
                    .map(|client_box| client_box.retire_if_idle(now, box_ttl))
                    .unwrap_or(false);
                if retired {
                    boxes.remove(&signature);
                    stats.boxes_removed += 1;
                }
            }
        }

        stats
    }

    /// Number of client boxes.
    pub fn box_count(&self) -> usize {
        self.boxes.read().len()
    }

    /// Number of buckets across all boxes.
    pub fn bucket_count(&self) -> usize {
        let boxes: Vec<Arc<ClientBox>> = self.boxes.read().values().cloned().collect();
        boxes.iter().map(|b| b.len()).sum()
    }

    /// Drop all state.
    pub fn clear(&self) {
        let mut boxes = self.boxes.write();
        for client_box in boxes.values() {
            let mut inner = client_box.inner.write();
            inner.buckets.clear();
            inner.retired = true;
        }
        boxes.clear();
    }
}
