//! In-memory subscription registry

use crate::types::SubscriptionKind;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use streamwire_core::Timestamp;

/// Lifecycle of a stored subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Active,
    Resetting,
}

/// A subscription the server has accepted
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub context_id: String,
    pub reference_id: String,
    pub kind: SubscriptionKind,
    /// Kind-specific arguments, replayed verbatim on resubscribe
    pub arguments: Value,
    pub endpoint: String,
    pub state: SubscriptionState,
    pub subscribed_at: Timestamp,
    pub last_message_at: Timestamp,
    /// `Location` header of the created resource, if the server sent one
    pub location: Option<String>,
}

impl Subscription {
    pub fn new(
        context_id: impl Into<String>,
        reference_id: impl Into<String>,
        kind: SubscriptionKind,
        arguments: Value,
    ) -> Self {
        let now = Timestamp::now();
        Self {
            context_id: context_id.into(),
            reference_id: reference_id.into(),
            kind,
            arguments,
            endpoint: kind.endpoint().to_string(),
            state: SubscriptionState::Active,
            subscribed_at: now,
            last_message_at: now,
            location: None,
        }
    }
}

/// Result of a liveness scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SilenceReport {
    pub total: usize,
    pub silent: Vec<String>,
}

impl SilenceReport {
    pub fn all_silent(&self) -> bool {
        self.total > 0 && self.silent.len() == self.total
    }
}

/// Subscriptions keyed by reference id
#[derive(Debug, Default)]
pub struct SubscriptionStore {
    entries: RwLock<HashMap<String, Subscription>>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Subscription>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Subscription>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, subscription: Subscription) {
        self.write()
            .insert(subscription.reference_id.clone(), subscription);
    }

    pub fn remove(&self, reference_id: &str) -> Option<Subscription> {
        self.write().remove(reference_id)
    }

    /// Swap `old_reference_id` for `subscription` under one lock
    pub fn replace(&self, old_reference_id: &str, subscription: Subscription) {
        let mut entries = self.write();
        entries.remove(old_reference_id);
        entries.insert(subscription.reference_id.clone(), subscription);
    }

    pub fn get(&self, reference_id: &str) -> Option<Subscription> {
        self.read().get(reference_id).cloned()
    }

    pub fn contains(&self, reference_id: &str) -> bool {
        self.read().contains_key(reference_id)
    }

    /// Record traffic for a subscription. Returns false if it is unknown.
    pub fn touch(&self, reference_id: &str) -> bool {
        self.touch_at(reference_id, Timestamp::now())
    }

    pub fn touch_at(&self, reference_id: &str, at: Timestamp) -> bool {
        match self.write().get_mut(reference_id) {
            Some(subscription) => {
                subscription.last_message_at = at;
                true
            }
            None => false,
        }
    }

    /// Mark every subscription as freshly heard from
    pub fn touch_all(&self) {
        let now = Timestamp::now();
        for subscription in self.write().values_mut() {
            subscription.last_message_at = now;
        }
    }

    pub fn set_state(&self, reference_id: &str, state: SubscriptionState) -> bool {
        match self.write().get_mut(reference_id) {
            Some(subscription) => {
                subscription.state = state;
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<Subscription> {
        self.read().values().cloned().collect()
    }

    pub fn reference_ids(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Subscriptions with no traffic for longer than `timeout` as of `now`
    pub fn silence_report(&self, timeout: Duration, now: Timestamp) -> SilenceReport {
        let entries = self.read();
        let silent = entries
            .values()
            .filter(|s| s.last_message_at.duration_until(now) > timeout)
            .map(|s| s.reference_id.clone())
            .collect();
        SilenceReport {
            total: entries.len(),
            silent,
        }
    }
}
