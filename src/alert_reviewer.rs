//! Auto-resolution of cleared external alerts (SPEC_FULL.md §4.9).
//!
//! Deliberately does not consult finding snooze/dismissal state — alerts are
//! an independent external system and reviewing them is purely a function of
//! current reachable state, not of what the findings store has chosen to
//! hide from the user.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::capabilities::{AlertResolver, ChatServiceProvider, ChatStreamChunk};
use crate::types::{AlertInfo, Snapshot};

const ALERT_MIN_AGE: Duration = Duration::from_secs(10 * 60);
const STORAGE_ABSENT_GRACE: Duration = Duration::from_secs(24 * 60 * 60);
const THRESHOLD_CLEAR_MARGIN: f64 = 0.95;

pub struct AlertReviewer {
    resolver: Arc<dyn AlertResolver>,
    chat: Option<Arc<dyn ChatServiceProvider>>,
}

impl AlertReviewer {
    #[must_use]
    pub fn new(resolver: Arc<dyn AlertResolver>, chat: Option<Arc<dyn ChatServiceProvider>>) -> Self {
        Self { resolver, chat }
    }

    /// Review every active alert older than 10 minutes and resolve the ones
    /// that have cleared (SPEC_FULL.md §4.9). Returns the number resolved.
    pub async fn review(&self, snapshot: &Snapshot, now: DateTime<Utc>) -> usize {
        let alerts = match self.resolver.get_active_alerts().await {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(error = %e, "[AlertReviewer] failed to list active alerts");
                return 0;
            }
        };

        let mut resolved = 0;
        for alert in alerts {
            if now - alert.created_at < chrono::Duration::from_std(ALERT_MIN_AGE).unwrap_or_default() {
                continue;
            }
            let decision = self.heuristic_decision(&alert, snapshot, now);
            let should_resolve = match decision {
                Some(true) => true,
                Some(false) => false,
                None => self.llm_decision(&alert).await,
            };
            if should_resolve {
                match self.resolver.resolve_alert(&alert.id).await {
                    Ok(true) => resolved += 1,
                    Ok(false) => {}
                    Err(e) => tracing::warn!(alert_id = %alert.id, error = %e, "[AlertReviewer] resolve failed"),
                }
            }
        }
        resolved
    }

    /// `Some(true)` resolve, `Some(false)` keep, `None` inconclusive (fall through to LLM).
    fn heuristic_decision(&self, alert: &AlertInfo, snapshot: &Snapshot, now: DateTime<Utc>) -> Option<bool> {
        if alert.alert_type.starts_with("usage/") {
            let (value, threshold) = (alert.value?, alert.threshold?);
            let current = current_metric_value(snapshot, &alert.resource_id, &alert.alert_type)?;
            return Some(current < threshold * THRESHOLD_CLEAR_MARGIN || value < threshold * THRESHOLD_CLEAR_MARGIN);
        }

        if alert.alert_type == "offline" || alert.alert_type == "stopped" {
            return Some(is_online(snapshot, &alert.resource_id));
        }

        if alert.resource_type == "storage" && !resource_present(snapshot, &alert.resource_id) {
            let age = now - alert.created_at;
            if age >= chrono::Duration::from_std(STORAGE_ABSENT_GRACE).unwrap_or_default() {
                return Some(true);
            }
        }

        None
    }

    async fn llm_decision(&self, alert: &AlertInfo) -> bool {
        let Some(chat) = &self.chat else { return false };
        let prompt = format!(
            "Alert {} on {} ({}): is this still active? Respond with exactly `RESOLVE: <reason>` or `KEEP: <reason>`.",
            alert.id, alert.resource_id, alert.alert_type
        );
        let content = std::sync::Mutex::new(String::new());
        let result = chat
            .execute_patrol_stream(&prompt, &|chunk| {
                if let ChatStreamChunk::Content(text) = chunk {
                    content.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push_str(&text);
                }
            })
            .await;
        match result {
            Ok(()) => {
                let reply = content.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                reply.trim_start().starts_with("RESOLVE:")
            }
            Err(e) => {
                tracing::warn!(alert_id = %alert.id, error = %e, "[AlertReviewer] LLM judgment call failed");
                false
            }
        }
    }
}

fn current_metric_value(snapshot: &Snapshot, resource_id: &str, alert_type: &str) -> Option<f64> {
    if let Some(node) = snapshot.nodes.iter().find(|n| n.id == resource_id) {
        return match alert_type {
            "usage/cpu" => Some(node.cpu_fraction),
            "usage/memory" => Some(node.mem_fraction),
            _ => None,
        };
    }
    if let Some(guest) = snapshot.guests.iter().find(|g| g.id == resource_id) {
        return match alert_type {
            "usage/cpu" => Some(guest.cpu_fraction),
            "usage/memory" => Some(guest.mem_fraction),
            "usage/disk" => Some(guest.disk_fraction),
            _ => None,
        };
    }
    None
}

fn is_online(snapshot: &Snapshot, resource_id: &str) -> bool {
    if let Some(node) = snapshot.nodes.iter().find(|n| n.id == resource_id) {
        return node.status == "online";
    }
    if let Some(guest) = snapshot.guests.iter().find(|g| g.id == resource_id) {
        return guest.is_running;
    }
    false
}

fn resource_present(snapshot: &Snapshot, resource_id: &str) -> bool {
    snapshot.storage_pools.iter().any(|s| s.id == resource_id)
}
