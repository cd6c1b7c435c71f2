// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process publish/subscribe fabric with glob-prefix delivery.
//!
//! Publishing `a.b.c` delivers to subscribers of `a.b.c` and to wildcard
//! prefix patterns such as `a.b.*`, `a.*`, and `*`. Prefix patterns live in
//! a sorted table keyed by the prefix up to (and including) the final dot,
//! so matching a topic costs one lookup per dot. Delivery order for one
//! event is subscription insertion order.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Default per-topic history ring capacity.
const DEFAULT_HISTORY_CAP: usize = 256;

/// One published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
    pub timestamp_ms: u64,
}

/// Handle returned by `subscribe`; pass to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscriber {
    id: u64,
    handler: Handler,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    /// Exact-topic subscribers.
    exact: HashMap<String, Vec<Subscriber>>,
    /// Prefix subscribers, keyed by the pattern minus the trailing `*`
    /// (e.g. `job.` for `job.*`). The empty key is the catch-all `*`.
    prefix: BTreeMap<String, Vec<Subscriber>>,
    history: HashMap<String, VecDeque<Event>>,
    history_cap: usize,
}

/// The event fabric shared by the jobs engine, supervisor, workflow state
/// machine, and watchdog.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Inner>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_history_cap(DEFAULT_HISTORY_CAP)
    }

    pub fn with_history_cap(cap: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                history_cap: cap,
                ..Default::default()
            })),
        }
    }

    /// Subscribe to an exact topic (`a.b.c`) or a glob-prefix pattern
    /// (`a.b.*`, `a.*`, `*`).
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let sub = Subscriber { id, handler: Arc::new(handler) };

        if pattern == "*" {
            inner.prefix.entry(String::new()).or_default().push(sub);
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            inner.prefix.entry(prefix.to_string()).or_default().push(sub);
        } else {
            inner.exact.entry(pattern.to_string()).or_default().push(sub);
        }
        SubscriptionId(id)
    }

    /// Subscribe and receive events on an unbounded channel instead of a
    /// callback. Useful for async consumers and tests.
    pub fn subscribe_channel(
        &self,
        pattern: &str,
    ) -> (SubscriptionId, std::sync::mpsc::Receiver<Event>) {
        let (tx, rx) = std::sync::mpsc::channel();
        let id = self.subscribe(pattern, move |event| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock();
        for subs in inner.exact.values_mut() {
            subs.retain(|s| s.id != id.0);
        }
        for subs in inner.prefix.values_mut() {
            subs.retain(|s| s.id != id.0);
        }
    }

    /// Publish an event. Matching handlers run synchronously on the
    /// publisher's task, in subscription insertion order.
    pub fn publish(&self, topic: &str, payload: Value) {
        let event = Event {
            topic: topic.to_string(),
            payload,
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        };

        let handlers: Vec<(u64, Handler)> = {
            let mut inner = self.inner.lock();

            let cap = inner.history_cap;
            if cap > 0 {
                let ring = inner.history.entry(topic.to_string()).or_default();
                if ring.len() == cap {
                    ring.pop_front();
                }
                ring.push_back(event.clone());
            }

            let mut matched: Vec<(u64, Handler)> = Vec::new();
            if let Some(subs) = inner.exact.get(topic) {
                matched.extend(subs.iter().map(|s| (s.id, Arc::clone(&s.handler))));
            }
            for prefix in prefix_keys(topic) {
                if let Some(subs) = inner.prefix.get(prefix) {
                    matched.extend(subs.iter().map(|s| (s.id, Arc::clone(&s.handler))));
                }
            }
            // Insertion order across exact and prefix tables.
            matched.sort_by_key(|(id, _)| *id);
            matched
        };

        for (_, handler) in handlers {
            handler(&event);
        }
    }

    /// Last `n` events published on an exact topic, oldest first.
    pub fn history(&self, topic: &str, n: usize) -> Vec<Event> {
        let inner = self.inner.lock();
        match inner.history.get(topic) {
            Some(ring) => ring.iter().rev().take(n).rev().cloned().collect(),
            None => Vec::new(),
        }
    }
}

/// Candidate prefix-table keys for a topic: the catch-all plus every
/// dot-terminated prefix. For `a.b.c`: `""`, `"a."`, `"a.b."`.
fn prefix_keys(topic: &str) -> impl Iterator<Item = &str> {
    std::iter::once("").chain(
        topic
            .char_indices()
            .filter(|(_, c)| *c == '.')
            .map(move |(i, _)| &topic[..=i]),
    )
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
