//! Bounded worker-side buffers: the screenshot ring and the per-tab
//! console/network log rings.
//!
//! Log rings are bounded twice: 500 entries per tab and 5000 entries across
//! all tabs. When the global bound is hit, the entry evicted is the globally
//! oldest one, wherever it lives. Closed tabs purge their buffers outright.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;

/// Entries kept in the screenshot ring for `upload_image` by id.
pub const SCREENSHOT_RING_CAPACITY: usize = 10;

/// Per-tab log ring bound.
pub const PER_TAB_LOG_CAPACITY: usize = 500;

/// Global log bound across all tabs.
pub const GLOBAL_LOG_CAPACITY: usize = 5000;

/// `imageId → base64 data`, oldest evicted at capacity.
#[derive(Debug, Default)]
pub struct ScreenshotRing {
    entries: VecDeque<(String, String)>,
}

impl ScreenshotRing {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, image_id: String, base64_data: String) {
        self.entries.retain(|(id, _)| *id != image_id);
        if self.entries.len() == SCREENSHOT_RING_CAPACITY {
            let evicted = self.entries.pop_front();
            if let Some((id, _)) = evicted {
                tracing::debug!(image_id = %id, "screenshot ring full, evicting oldest capture");
            }
        }
        self.entries.push_back((image_id, base64_data));
    }

    #[must_use]
    pub fn get(&self, image_id: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(id, _)| id == image_id)
            .map(|(_, data)| data.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
struct LogEntry {
    seq: u64,
    value: Value,
}

/// Per-tab log rings with a shared global bound.
#[derive(Debug, Default)]
pub struct TabLogBuffers {
    tabs: HashMap<u32, VecDeque<LogEntry>>,
    total: usize,
    next_seq: u64,
}

impl TabLogBuffers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry for `tab_id`, evicting per the two bounds.
    pub fn push(&mut self, tab_id: u32, value: Value) {
        let seq = self.next_seq;
        self.next_seq += 1;

        let at_per_tab_cap = self
            .tabs
            .get(&tab_id)
            .is_some_and(|ring| ring.len() >= PER_TAB_LOG_CAPACITY);
        if at_per_tab_cap {
            if let Some(ring) = self.tabs.get_mut(&tab_id) {
                ring.pop_front();
                self.total -= 1;
            }
        } else if self.total >= GLOBAL_LOG_CAPACITY {
            self.evict_globally_oldest();
        }

        self.tabs
            .entry(tab_id)
            .or_default()
            .push_back(LogEntry { seq, value });
        self.total += 1;
    }

    fn evict_globally_oldest(&mut self) {
        let oldest_tab = self
            .tabs
            .iter()
            .filter_map(|(tab, ring)| ring.front().map(|entry| (*tab, entry.seq)))
            .min_by_key(|(_, seq)| *seq)
            .map(|(tab, _)| tab);
        if let Some(tab) = oldest_tab {
            if let Some(ring) = self.tabs.get_mut(&tab) {
                ring.pop_front();
                self.total -= 1;
                if ring.is_empty() {
                    self.tabs.remove(&tab);
                }
            }
        }
    }

    /// Most recent `limit` entries for `tab_id`, oldest first.
    #[must_use]
    pub fn tail(&self, tab_id: u32, limit: usize) -> Vec<Value> {
        let Some(ring) = self.tabs.get(&tab_id) else {
            return Vec::new();
        };
        let skip = ring.len().saturating_sub(limit);
        ring.iter().skip(skip).map(|entry| entry.value.clone()).collect()
    }

    /// Drop every entry for a closed tab.
    pub fn purge_tab(&mut self, tab_id: u32) {
        if let Some(ring) = self.tabs.remove(&tab_id) {
            self.total -= ring.len();
        }
    }

    #[must_use]
    pub fn tab_len(&self, tab_id: u32) -> usize {
        self.tabs.get(&tab_id).map_or(0, VecDeque::len)
    }

    #[must_use]
    pub fn total_len(&self) -> usize {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_screenshot_ring_evicts_oldest_at_capacity() {
        let mut ring = ScreenshotRing::new();
        for i in 0..SCREENSHOT_RING_CAPACITY + 2 {
            ring.insert(format!("img-{i}"), format!("data-{i}"));
        }

        assert_eq!(ring.len(), SCREENSHOT_RING_CAPACITY);
        assert!(ring.get("img-0").is_none(), "oldest capture must be evicted");
        assert!(ring.get("img-1").is_none());
        assert_eq!(ring.get("img-11"), Some("data-11"));
    }

    #[test]
    fn test_screenshot_ring_reinsert_same_id_replaces() {
        let mut ring = ScreenshotRing::new();
        ring.insert("img-a".to_string(), "v1".to_string());
        ring.insert("img-a".to_string(), "v2".to_string());
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.get("img-a"), Some("v2"));
    }

    #[test]
    fn test_log_buffer_per_tab_bound() {
        let mut logs = TabLogBuffers::new();
        for i in 0..PER_TAB_LOG_CAPACITY + 10 {
            logs.push(1, json!({"n": i}));
        }
        assert_eq!(logs.tab_len(1), PER_TAB_LOG_CAPACITY);

        let tail = logs.tail(1, 1);
        assert_eq!(tail[0]["n"], PER_TAB_LOG_CAPACITY + 9, "newest entry must survive");
    }

    #[test]
    fn test_log_buffer_global_bound_evicts_globally_oldest() {
        let mut logs = TabLogBuffers::new();
        // Tab 1 gets the oldest entries, spread under its per-tab cap.
        for i in 0..400 {
            logs.push(1, json!({"tab": 1, "n": i}));
        }
        let mut pushed = 400usize;
        let mut tab = 2u32;
        while pushed < GLOBAL_LOG_CAPACITY {
            for _ in 0..400.min(GLOBAL_LOG_CAPACITY - pushed) {
                logs.push(tab, json!({"tab": tab}));
                pushed += 1;
            }
            tab += 1;
        }
        assert_eq!(logs.total_len(), GLOBAL_LOG_CAPACITY);

        logs.push(99, json!({"tab": 99}));
        assert_eq!(logs.total_len(), GLOBAL_LOG_CAPACITY, "global bound must hold");
        assert_eq!(
            logs.tab_len(1),
            399,
            "eviction must come from the buffer holding the globally oldest entry"
        );
    }

    #[test]
    fn test_log_buffer_purge_tab_frees_global_capacity() {
        let mut logs = TabLogBuffers::new();
        for _ in 0..100 {
            logs.push(1, json!({}));
            logs.push(2, json!({}));
        }
        assert_eq!(logs.total_len(), 200);

        logs.purge_tab(1);
        assert_eq!(logs.tab_len(1), 0);
        assert_eq!(logs.total_len(), 100, "purged entries must leave the global count");
    }

    #[test]
    fn test_tail_limits_and_orders_oldest_first() {
        let mut logs = TabLogBuffers::new();
        for i in 0..10 {
            logs.push(7, json!({"n": i}));
        }
        let tail = logs.tail(7, 3);
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0]["n"], 7);
        assert_eq!(tail[2]["n"], 9);
    }
}
