//! Human-in-the-loop gating for side-effecting tools.
//!
//! Two process-local tables keyed by tool-call id: `pending` holds a
//! single-slot signal per suspended call, `results` the decision once an
//! external actor posts it.  Both live behind one mutex; operations on them
//! are constant-time.  Every exit path — approval, denial, cancellation —
//! removes the call's entries, so a turn can never leak a waiter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::{debug, warn};

/// Substrings marking a tool as side-effecting and therefore gated.
const CONFIRM_MARKERS: &[&str] = &["add_", "update_", "delete_"];

/// Whether a tool needs human approval before execution.
pub fn requires_confirmation(tool_name: &str) -> bool {
    CONFIRM_MARKERS.iter().any(|marker| tool_name.contains(marker))
}

#[derive(Default)]
struct Tables {
    pending: HashMap<String, Arc<Notify>>,
    results: HashMap<String, bool>,
}

#[derive(Default)]
pub struct ConfirmationBroker {
    tables: Mutex<Tables>,
}

impl ConfirmationBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the pending entry for `id` and hand back a waiter.
    ///
    /// Registration happens before the `tool_confirmation_required` event is
    /// emitted, so a decision posted the instant the event is seen cannot
    /// miss.  Dropping the waiter (cancellation included) removes both table
    /// entries.
    pub fn register<'a>(&'a self, id: &'a str) -> DecisionWaiter<'a> {
        let notify = {
            let mut tables = self.tables.lock().expect("broker mutex");
            let notify = Arc::new(Notify::new());
            tables.pending.insert(id.to_string(), notify.clone());
            notify
        };
        DecisionWaiter { broker: self, id, notify }
    }

    /// Register and suspend in one step.
    pub async fn await_decision(&self, id: &str) -> bool {
        self.register(id).wait().await
    }

    /// Post the decision for a pending call.  Returns `false` when nothing is
    /// waiting under that id (already resolved, cancelled, or never asked).
    pub fn resolve(&self, id: &str, approved: bool) -> bool {
        let mut tables = self.tables.lock().expect("broker mutex");
        let Some(notify) = tables.pending.get(id).cloned() else {
            warn!(tool_call_id = id, "confirmation for unknown tool call");
            return false;
        };
        tables.results.insert(id.to_string(), approved);
        notify.notify_one();
        true
    }

    /// Number of calls currently suspended.
    pub fn pending_count(&self) -> usize {
        self.tables.lock().expect("broker mutex").pending.len()
    }

    /// True when both tables are empty — the post-turn invariant.
    pub fn is_clean(&self) -> bool {
        let tables = self.tables.lock().expect("broker mutex");
        tables.pending.is_empty() && tables.results.is_empty()
    }
}

/// A registered pending confirmation.  Removes the call's table entries on
/// every exit path, including drop without a decision.
pub struct DecisionWaiter<'a> {
    broker: &'a ConfirmationBroker,
    id: &'a str,
    notify: Arc<Notify>,
}

impl DecisionWaiter<'_> {
    /// Suspend until the decision for this call arrives.
    pub async fn wait(self) -> bool {
        loop {
            if let Some(approved) = {
                let tables = self.broker.tables.lock().expect("broker mutex");
                tables.results.get(self.id).copied()
            } {
                debug!(tool_call_id = self.id, approved, "confirmation received");
                return approved;
            }
            self.notify.notified().await;
        }
    }
}

impl Drop for DecisionWaiter<'_> {
    fn drop(&mut self) {
        let mut tables = self.broker.tables.lock().expect("broker mutex");
        tables.pending.remove(self.id);
        tables.results.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn confirmation_marker_matching() {
        assert!(requires_confirmation("add_fact"));
        assert!(requires_confirmation("update_fact_or_preference"));
        assert!(requires_confirmation("delete_memory"));
        assert!(requires_confirmation("kg_add_event"));
        assert!(!requires_confirmation("retrieve_context"));
        assert!(!requires_confirmation("read_file"));
        assert!(!requires_confirmation("search_knowledge"));
    }

    #[tokio::test]
    async fn approval_flows_through_and_cleans_up() {
        let broker = Arc::new(ConfirmationBroker::new());

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.await_decision("call_1").await })
        };
        // Give the waiter a moment to register.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(broker.pending_count(), 1);

        assert!(broker.resolve("call_1", true));
        assert!(waiter.await.unwrap());
        assert!(broker.is_clean());
    }

    #[tokio::test]
    async fn denial_flows_through() {
        let broker = Arc::new(ConfirmationBroker::new());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.await_decision("call_2").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(broker.resolve("call_2", false));
        assert!(!waiter.await.unwrap());
        assert!(broker.is_clean());
    }

    #[tokio::test]
    async fn resolve_before_wait_is_a_miss() {
        let broker = ConfirmationBroker::new();
        assert!(!broker.resolve("ghost", true));
        assert!(broker.is_clean());
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_no_orphans() {
        let broker = Arc::new(ConfirmationBroker::new());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.await_decision("call_3").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(broker.pending_count(), 1);

        waiter.abort();
        let _ = waiter.await;
        assert!(broker.is_clean(), "abort must clear pending and results");

        // A late decision is a harmless miss.
        assert!(!broker.resolve("call_3", true));
    }

    #[tokio::test]
    async fn decision_posted_immediately_after_registration_is_seen() {
        let broker = Arc::new(ConfirmationBroker::new());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.await_decision("call_4").await })
        };
        // Spin until the entry exists, then resolve without yielding to the
        // waiter in between.
        loop {
            if broker.pending_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(broker.resolve("call_4", true));
        assert!(waiter.await.unwrap());
    }
}
