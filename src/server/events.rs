//! Event subscriptions and fan-out to the client notification channel.
//!
//! The server holds the single authoritative subscription table. Entries are
//! mirrored from successful `browser_event_subscribe` tool results (the
//! worker mints the ids) and removed on unsubscribe or session close. A
//! `browser_event` is delivered once per matching subscription: same agent,
//! event type in the subscribed set, and — when a pattern is present — the
//! event URL containing the pattern as a substring.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use tokio::sync::mpsc;

use crate::protocol::{unix_time_ms, BrowserEvent};

#[derive(Debug, Clone)]
pub struct EventSubscription {
    pub id: String,
    pub agent_id: String,
    pub event_types: HashSet<String>,
    pub url_pattern: Option<String>,
    pub created_at_ms: i64,
}

impl EventSubscription {
    #[must_use]
    pub fn matches(&self, event: &BrowserEvent) -> bool {
        if event.agent_id != self.agent_id {
            return false;
        }
        if !self.event_types.contains(&event.event_type) {
            return false;
        }
        match &self.url_pattern {
            Some(pattern) => event.url.contains(pattern.as_str()),
            None => true,
        }
    }
}

/// Client-facing notification produced for each matching subscription.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventNotification {
    pub subscription_id: String,
    pub agent_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub tab_id: u32,
    pub url: String,
    pub timestamp: i64,
    pub sequence_number: u64,
}

/// `subscriptionId → subscription` with agent-scoped purging.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    subscriptions: HashMap<String, EventSubscription>,
}

impl SubscriptionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        id: String,
        agent_id: String,
        event_types: HashSet<String>,
        url_pattern: Option<String>,
    ) {
        self.subscriptions.insert(
            id.clone(),
            EventSubscription {
                id,
                agent_id,
                event_types,
                url_pattern,
                created_at_ms: unix_time_ms(),
            },
        );
    }

    pub fn remove(&mut self, id: &str) -> Option<EventSubscription> {
        self.subscriptions.remove(id)
    }

    /// Drop every subscription owned by `agent_id` (session close).
    pub fn purge_agent(&mut self, agent_id: &str) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions
            .retain(|_, subscription| subscription.agent_id != agent_id);
        before - self.subscriptions.len()
    }

    /// Fan one event out to the notification channel, once per matching
    /// subscription. Send failures are swallowed: a slow or departed client
    /// must not stall the record loop.
    pub fn fan_out(
        &self,
        event: &BrowserEvent,
        notifier: &mpsc::UnboundedSender<EventNotification>,
    ) -> usize {
        let mut delivered = 0;
        for subscription in self.subscriptions.values() {
            if !subscription.matches(event) {
                continue;
            }
            let notification = EventNotification {
                subscription_id: subscription.id.clone(),
                agent_id: event.agent_id.clone(),
                event_type: event.event_type.clone(),
                payload: event.payload.clone(),
                tab_id: event.tab_id,
                url: event.url.clone(),
                timestamp: event.timestamp,
                sequence_number: event.sequence_number,
            };
            if notifier.send(notification).is_err() {
                tracing::debug!(
                    subscription_id = %subscription.id,
                    "dropping event notification, client channel closed"
                );
            } else {
                delivered += 1;
            }
        }
        delivered
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
