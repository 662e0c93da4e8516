//! Pending-request table and timeout sweep.
//!
//! The request manager owns the correlation table shared by three racing
//! completion paths: response arrival, broker no-route notification, and
//! deadline expiry. For a given correlation id exactly one path wins;
//! removal from the table and callback invocation happen together, so a
//! callback fires at most once no matter how the race resolves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::macros::{log_debug, log_warn};
use crate::{CorrelationId, Delivery};

/// Single-invocation completion handler for one request.
///
/// Receives the response payload and, on the success path, the delivery
/// it arrived in. Synthetic completions (timeout, no-route) pass `None`.
pub type ResponseCallback = Box<dyn FnOnce(Value, Option<Delivery>) + Send>;

struct PendingRequest {
    // ---
    destination: String,
    expires_at: Instant,
    callback: ResponseCallback,
}

type RequestMap = HashMap<CorrelationId, PendingRequest>;

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// The protected state is the pending-request map; there are no
/// invariants spanning multiple entries, and the worst outcome of
/// continuing past a poisoned lock is a dropped completion.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Correlation table with a periodic timeout sweep.
///
/// Explicitly constructed and injected; never a process-wide singleton.
pub(crate) struct RequestManager {
    // ---
    requests: Arc<Mutex<RequestMap>>,
    sweep_interval: Duration,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl RequestManager {
    pub fn new(sweep_interval: Duration) -> Self {
        // ---
        Self {
            requests: Arc::new(Mutex::new(HashMap::new())),
            sweep_interval,
            sweep_task: Mutex::new(None),
        }
    }

    /// Insert a pending request.
    ///
    /// Correlation ids are UUID-strength, so a duplicate registration is
    /// not expected; if one occurs the earlier entry is kept.
    pub fn register(
        &self,
        correlation_id: CorrelationId,
        destination: &str,
        timeout: Duration,
        callback: ResponseCallback,
    ) {
        // ---
        let entry = PendingRequest {
            destination: destination.to_string(),
            expires_at: Instant::now() + timeout,
            callback,
        };
        let mut requests = lock_ignore_poison(&self.requests);
        requests.entry(correlation_id).or_insert(entry);
    }

    /// Complete a request on response arrival.
    ///
    /// Returns false when the id is unknown (late or duplicate delivery,
    /// or a response for an already-timed-out request); this is a warning
    /// condition, never an error surfaced to a caller.
    pub fn complete(&self, correlation_id: &CorrelationId, payload: Value, delivery: Delivery) -> bool {
        // ---
        let entry = {
            let mut requests = lock_ignore_poison(&self.requests);
            requests.remove(correlation_id)
        };

        match entry {
            Some(request) => {
                log_debug!(
                    "got response for request to {} with correlation id {correlation_id}",
                    request.destination
                );
                (request.callback)(payload, Some(delivery));
                true
            }
            None => {
                log_warn!(
                    "got response for correlation id {correlation_id} but there is no requester"
                );
                false
            }
        }
    }

    /// Complete a request with a no-route error.
    ///
    /// Invoked from the broker returned-message hook; short-circuits the
    /// timeout wait when the destination does not exist.
    pub fn no_route(&self, correlation_id: &CorrelationId) {
        // ---
        let entry = {
            let mut requests = lock_ignore_poison(&self.requests);
            requests.remove(correlation_id)
        };

        if let Some(request) = entry {
            log_debug!(
                "no route to {} for correlation id {correlation_id}",
                request.destination
            );
            (request.callback)(json!({"error": "Specified destination does not exist"}), None);
        }
    }

    /// Remove a pending request without completing it.
    ///
    /// Used to take back an entry when the publish that followed
    /// registration failed.
    pub fn forget(&self, correlation_id: &CorrelationId) {
        // ---
        let mut requests = lock_ignore_poison(&self.requests);
        requests.remove(correlation_id);
    }

    /// Complete every request whose deadline has passed with a timeout
    /// error. The running task sweeps through `sweep_map` directly.
    #[cfg(test)]
    fn sweep(&self, now: Instant) {
        Self::sweep_map(&self.requests, now);
    }

    fn sweep_map(requests: &Mutex<RequestMap>, now: Instant) {
        // ---
        let expired: Vec<(CorrelationId, PendingRequest)> = {
            let mut requests = lock_ignore_poison(requests);
            let ids: Vec<CorrelationId> = requests
                .iter()
                .filter(|(_, request)| now > request.expires_at)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| requests.remove(&id).map(|request| (id, request)))
                .collect()
        };

        for (correlation_id, request) in expired {
            log_warn!(
                "request timed out waiting response from {}, correlation id {correlation_id}",
                request.destination
            );
            (request.callback)(
                json!({"error": "RequestTimeout", "message": "Timed out waiting for response"}),
                None,
            );
        }
    }

    /// Start the periodic sweep task.
    ///
    /// The sweep runs independently of message arrival so requests to
    /// silent destinations still terminate. Idempotent.
    pub fn start(&self) {
        // ---
        let mut task = lock_ignore_poison(&self.sweep_task);
        if task.is_some() {
            return;
        }

        let requests = Arc::clone(&self.requests);
        let interval = self.sweep_interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                Self::sweep_map(&requests, Instant::now());
            }
        }));
    }

    /// Stop the sweep task. Pending entries stay in the table.
    pub fn stop(&self) {
        // ---
        let mut task = lock_ignore_poison(&self.sweep_task);
        if let Some(handle) = task.take() {
            handle.abort();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        lock_ignore_poison(&self.requests).len()
    }
}

impl Drop for RequestManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::message::MessageProperties;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn delivery() -> Delivery {
        Delivery {
            payload: json!({}),
            properties: MessageProperties::default(),
            routing_key: "replies".into(),
            delivery_tag: 1,
        }
    }

    fn counting_callback(counter: &Arc<AtomicUsize>) -> ResponseCallback {
        let counter = Arc::clone(counter);
        Box::new(move |_payload, _delivery| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_complete_invokes_callback_once() {
        // ---
        let manager = RequestManager::new(Duration::from_millis(50));
        let counter = Arc::new(AtomicUsize::new(0));
        let id = CorrelationId::generate();

        manager.register(
            id.clone(),
            "dest",
            Duration::from_secs(5),
            counting_callback(&counter),
        );

        assert!(manager.complete(&id, json!({"ok": true}), delivery()));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Second completion is a no-op: the entry is gone.
        assert!(!manager.complete(&id, json!({"ok": true}), delivery()));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(manager.len(), 0);
    }

    #[test]
    fn test_no_route_beats_sweep() {
        // ---
        let manager = RequestManager::new(Duration::from_millis(50));
        let counter = Arc::new(AtomicUsize::new(0));
        let id = CorrelationId::generate();

        manager.register(
            id.clone(),
            "dest",
            Duration::from_millis(0),
            counting_callback(&counter),
        );

        manager.no_route(&id);
        manager.sweep(Instant::now() + Duration::from_secs(1));

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sweep_expires_only_past_deadline() {
        // ---
        let manager = RequestManager::new(Duration::from_millis(50));
        let expired = Arc::new(AtomicUsize::new(0));
        let live = Arc::new(AtomicUsize::new(0));

        let expired_id = CorrelationId::generate();
        manager.register(
            expired_id,
            "dest-a",
            Duration::from_millis(0),
            counting_callback(&expired),
        );
        let live_id = CorrelationId::generate();
        manager.register(
            live_id,
            "dest-b",
            Duration::from_secs(60),
            counting_callback(&live),
        );

        manager.sweep(Instant::now() + Duration::from_millis(10));

        assert_eq!(expired.load(Ordering::SeqCst), 1);
        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_sweep_error_payload_shape() {
        // ---
        let manager = RequestManager::new(Duration::from_millis(50));
        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        let id = CorrelationId::generate();

        manager.register(
            id,
            "dest",
            Duration::from_millis(0),
            Box::new(move |payload, delivery| {
                assert!(delivery.is_none());
                *slot.lock().unwrap() = Some(payload);
            }),
        );
        manager.sweep(Instant::now() + Duration::from_millis(1));

        let payload = seen.lock().unwrap().take().unwrap();
        assert_eq!(payload["error"], "RequestTimeout");
        assert_eq!(payload["message"], "Timed out waiting for response");
    }

    #[test]
    fn test_forget_drops_entry_silently() {
        // ---
        let manager = RequestManager::new(Duration::from_millis(50));
        let counter = Arc::new(AtomicUsize::new(0));
        let id = CorrelationId::generate();

        manager.register(
            id.clone(),
            "dest",
            Duration::from_millis(0),
            counting_callback(&counter),
        );
        manager.forget(&id);
        manager.sweep(Instant::now() + Duration::from_secs(1));

        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
