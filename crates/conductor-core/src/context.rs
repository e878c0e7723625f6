//! Context Window Monitor: bounds the orchestrator's in-memory summary set
//! by token budget, triggering compress/archive before overflow.
//!
//! Adapted from the teacher's context-accounting shape (running totals plus
//! derived-ratio helpers) from aggregate percentile reporting to live
//! threshold evaluation against a configurable token ceiling.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// A token-accounted entry tracked by the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: String,
    pub item_type: String,
    pub token_count: u64,
    pub priority: u8,
    pub compressible: bool,
    pub archivable: bool,
    pub last_accessed_at: DateTime<Utc>,
    pub reference_id: Option<String>,
}

impl ContextItem {
    /// Creates an item, enforcing the invariant that `user_task` and
    /// `workflow_state` items are never compressible/archivable and always
    /// carry the highest priority.
    #[must_use]
    pub fn new(id: impl Into<String>, item_type: impl Into<String>, token_count: u64) -> Self {
        let item_type = item_type.into();
        let protected = matches!(item_type.as_str(), "user_task" | "workflow_state");
        Self {
            id: id.into(),
            item_type,
            token_count,
            priority: if protected { 100 } else { 50 },
            compressible: !protected,
            archivable: !protected,
            last_accessed_at: Utc::now(),
            reference_id: None,
        }
    }

    fn is_protected(&self) -> bool {
        !self.compressible && !self.archivable
    }
}

/// Usage level derived from `totalTokens / maxTokens`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsageLevel {
    Normal,
    Elevated,
    High,
    Critical,
}

/// Thresholds driving [`UsageLevel`] classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextMonitorConfig {
    pub max_tokens: u64,
    pub warning_threshold: f64,
    pub high_threshold: f64,
    pub critical_threshold: f64,
}

impl Default for ContextMonitorConfig {
    fn default() -> Self {
        Self {
            max_tokens: 100_000,
            warning_threshold: 0.60,
            high_threshold: 0.80,
            critical_threshold: 0.90,
        }
    }
}

/// Compression aggressiveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionStrategy {
    Light,
    Moderate,
    Aggressive,
}

impl CompressionStrategy {
    fn reduction_ratio(self) -> f64 {
        match self {
            Self::Light => 0.20,
            Self::Moderate => 0.45,
            Self::Aggressive => 0.70,
        }
    }
}

/// Recommended remedial action for the current usage level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecommendedAction {
    None,
    Compress(CompressionStrategy),
    Archive,
}

#[derive(Debug, Clone, Default)]
pub struct CompressOutcome {
    pub performed: bool,
    pub items_compressed: usize,
    pub items_removed: usize,
    pub tokens_saved: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ArchiveOptions {
    pub max_items: Option<usize>,
    pub older_than: Option<DateTime<Utc>>,
    pub keep_min_per_type: Option<usize>,
    pub below_priority: Option<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct ArchiveOutcome {
    pub performed: bool,
    pub items_archived: usize,
    pub tokens_saved: u64,
    pub artifact_ids: Vec<String>,
}

/// Events emitted by the monitor.
#[derive(Debug, Clone)]
pub enum ContextEvent {
    Warning { usage_ratio: f64 },
    Critical { usage_ratio: f64 },
    LimitExceeded { total_tokens: u64, max_tokens: u64 },
    CompressionPerformed(CompressOutcome),
    ArchivalPerformed(ArchiveOutcome),
}

struct Inner {
    items: HashMap<String, ContextItem>,
    last_level: UsageLevel,
}

/// Tracks context items and their token accounting for one session.
pub struct ContextMonitor {
    config: ContextMonitorConfig,
    inner: RwLock<Inner>,
    events: broadcast::Sender<ContextEvent>,
}

impl ContextMonitor {
    #[must_use]
    pub fn new(config: ContextMonitorConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            inner: RwLock::new(Inner { items: HashMap::new(), last_level: UsageLevel::Normal }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ContextEvent> {
        self.events.subscribe()
    }

    pub async fn add_item(&self, item: ContextItem) {
        let mut inner = self.inner.write().await;
        inner.items.insert(item.id.clone(), item);
        drop(inner);
        self.evaluate_usage().await;
    }

    pub async fn update_item_tokens(&self, id: &str, token_count: u64) {
        {
            let mut inner = self.inner.write().await;
            if let Some(item) = inner.items.get_mut(id) {
                item.token_count = token_count;
            }
        }
        self.evaluate_usage().await;
    }

    pub async fn touch_item(&self, id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(item) = inner.items.get_mut(id) {
            item.last_accessed_at = Utc::now();
        }
    }

    pub async fn remove_item(&self, id: &str) {
        self.inner.write().await.items.remove(id);
    }

    pub async fn get_items_by_type(&self, item_type: &str) -> Vec<ContextItem> {
        self.inner
            .read()
            .await
            .items
            .values()
            .filter(|i| i.item_type == item_type)
            .cloned()
            .collect()
    }

    pub async fn clear(&self) {
        self.inner.write().await.items.clear();
    }

    pub async fn total_tokens(&self) -> u64 {
        self.inner.read().await.items.values().map(|i| i.token_count).sum()
    }

    async fn usage_ratio(&self) -> f64 {
        self.total_tokens().await as f64 / self.config.max_tokens as f64
    }

    fn level_for_ratio(&self, ratio: f64) -> UsageLevel {
        if ratio >= self.config.critical_threshold {
            UsageLevel::Critical
        } else if ratio >= self.config.high_threshold {
            UsageLevel::High
        } else if ratio >= self.config.warning_threshold {
            UsageLevel::Elevated
        } else {
            UsageLevel::Normal
        }
    }

    pub async fn get_recommended_action(&self) -> RecommendedAction {
        match self.level_for_ratio(self.usage_ratio().await) {
            UsageLevel::Normal => RecommendedAction::None,
            UsageLevel::Elevated => RecommendedAction::Compress(CompressionStrategy::Light),
            UsageLevel::High => RecommendedAction::Compress(CompressionStrategy::Moderate),
            UsageLevel::Critical => RecommendedAction::Archive,
        }
    }

    async fn evaluate_usage(&self) {
        let ratio = self.usage_ratio().await;
        let level = self.level_for_ratio(ratio);
        let previous = {
            let mut inner = self.inner.write().await;
            std::mem::replace(&mut inner.last_level, level)
        };
        if level != previous {
            match level {
                UsageLevel::Elevated | UsageLevel::High => {
                    let _ = self.events.send(ContextEvent::Warning { usage_ratio: ratio });
                }
                UsageLevel::Critical => {
                    let _ = self.events.send(ContextEvent::Critical { usage_ratio: ratio });
                }
                UsageLevel::Normal => {}
            }
        }
        if ratio > 1.0 {
            let total = self.total_tokens().await;
            let _ = self.events.send(ContextEvent::LimitExceeded {
                total_tokens: total,
                max_tokens: self.config.max_tokens,
            });
        }
    }

    /// Reduces the token footprint of compressible items.
    pub async fn compress(&self, strategy: CompressionStrategy) -> CompressOutcome {
        let ratio = strategy.reduction_ratio();
        let mut outcome = CompressOutcome::default();
        {
            let mut inner = self.inner.write().await;
            for item in inner.items.values_mut() {
                if !item.compressible || item.is_protected() {
                    continue;
                }
                let reduced = (item.token_count as f64 * (1.0 - ratio)).round() as u64;
                let saved = item.token_count.saturating_sub(reduced);
                if saved > 0 {
                    item.token_count = reduced;
                    outcome.tokens_saved += saved;
                    outcome.items_compressed += 1;
                }
            }
        }
        outcome.performed = outcome.items_compressed > 0;
        debug!(tokens_saved = outcome.tokens_saved, "context compression performed");
        if outcome.performed {
            let _ = self.events.send(ContextEvent::CompressionPerformed(outcome.clone()));
        }
        outcome
    }

    /// Removes archivable items, lowest priority / oldest first.
    pub async fn archive(&self, options: ArchiveOptions) -> ArchiveOutcome {
        let mut outcome = ArchiveOutcome::default();
        let mut inner = self.inner.write().await;

        let mut candidates: Vec<ContextItem> = inner
            .items
            .values()
            .filter(|i| {
                i.archivable
                    && !i.is_protected()
                    && options.older_than.is_none_or(|cutoff| i.last_accessed_at < cutoff)
                    && options.below_priority.is_none_or(|p| i.priority < p)
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            a.priority.cmp(&b.priority).then(a.last_accessed_at.cmp(&b.last_accessed_at))
        });
        if let Some(max) = options.max_items {
            candidates.truncate(max);
        }

        let mut type_counts: HashMap<String, usize> =
            inner.items.values().fold(HashMap::new(), |mut acc, i| {
                *acc.entry(i.item_type.clone()).or_insert(0) += 1;
                acc
            });

        for item in candidates {
            if let Some(min) = options.keep_min_per_type {
                let remaining = type_counts.get(&item.item_type).copied().unwrap_or(0);
                if remaining <= min {
                    continue;
                }
            }
            inner.items.remove(&item.id);
            if let Some(count) = type_counts.get_mut(&item.item_type) {
                *count = count.saturating_sub(1);
            }
            outcome.items_archived += 1;
            outcome.tokens_saved += item.token_count;
            if let Some(reference) = item.reference_id.clone() {
                outcome.artifact_ids.push(reference);
            }
        }

        drop(inner);
        outcome.performed = outcome.items_archived > 0;
        debug!(items_archived = outcome.items_archived, "context archival performed");
        if outcome.performed {
            let _ = self.events.send(ContextEvent::ArchivalPerformed(outcome.clone()));
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, item_type: &str, tokens: u64) -> ContextItem {
        ContextItem::new(id, item_type, tokens)
    }

    #[tokio::test]
    async fn protected_items_are_never_compressible_or_archivable() {
        let task = item("t", "user_task", 500);
        assert!(!task.compressible);
        assert!(!task.archivable);
        assert_eq!(task.priority, 100);
    }

    #[tokio::test]
    async fn compress_and_archive_keep_total_within_bound_at_critical_level() {
        let monitor = ContextMonitor::new(ContextMonitorConfig { max_tokens: 1_000, ..Default::default() });
        monitor.add_item(item("task", "user_task", 100)).await;
        for i in 0..9 {
            monitor.add_item(item(&format!("artifact-{i}"), "artifact_summary", 100)).await;
        }
        assert_eq!(monitor.total_tokens().await, 1_000);
        assert_eq!(monitor.get_recommended_action().await, RecommendedAction::Archive);

        monitor.compress(CompressionStrategy::Aggressive).await;
        monitor.archive(ArchiveOptions::default()).await;

        assert!(monitor.total_tokens().await <= 1_000);
        let task_after = monitor.get_items_by_type("user_task").await;
        assert_eq!(task_after.len(), 1);
        assert_eq!(task_after[0].token_count, 100);
    }

    #[tokio::test]
    async fn usage_level_thresholds() {
        let monitor = ContextMonitor::new(ContextMonitorConfig { max_tokens: 100, ..Default::default() });
        monitor.add_item(item("a", "artifact_summary", 65)).await;
        assert_eq!(monitor.get_recommended_action().await, RecommendedAction::Compress(CompressionStrategy::Light));
        monitor.add_item(item("b", "artifact_summary", 20)).await;
        assert_eq!(monitor.get_recommended_action().await, RecommendedAction::Compress(CompressionStrategy::Moderate));
    }

    #[tokio::test]
    async fn warning_event_fires_on_crossing_threshold() {
        let monitor = ContextMonitor::new(ContextMonitorConfig { max_tokens: 100, ..Default::default() });
        let mut rx = monitor.subscribe();
        monitor.add_item(item("a", "artifact_summary", 65)).await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ContextEvent::Warning { .. }));
    }
}
