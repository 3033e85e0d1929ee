use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use tiller_tools::tier_for;
use tiller_types::{
    AgentSettings, ApprovalMode, ApprovalStatus, PendingApproval, ToolCall, ToolTier,
};

/// Pure policy check: does a call at this tier pause for the user?
pub fn requires_approval(tier: ToolTier, settings: &AgentSettings) -> bool {
    settings.approvals.mode_for(tier) == ApprovalMode::Ask
}

/// Builds the approval batch for one step: every call whose tier asks
/// for confirmation, in call order. Batched so the user reviews the
/// step as one unit instead of serially.
pub fn collect_pending(calls: &[ToolCall], settings: &AgentSettings) -> Vec<PendingApproval> {
    calls
        .iter()
        .filter_map(|call| {
            let tier = tier_for(&call.function.name, settings);
            if !requires_approval(tier, settings) {
                return None;
            }
            Some(PendingApproval {
                tool_call_id: call.id.clone(),
                tool_name: call.function.name.clone(),
                args: call.args(),
                tier,
                status: ApprovalStatus::Pending,
            })
        })
        .collect()
}

/// Holds the active approval batch and lets the loop suspend until the
/// user resolves every id. Resolution is idempotent: ids that are not
/// pending are ignored, so duplicate UI clicks and stale callbacks are
/// harmless.
#[derive(Clone)]
pub struct ApprovalGate {
    pending: Arc<RwLock<HashMap<String, PendingApproval>>>,
    resolved: Arc<RwLock<Vec<PendingApproval>>>,
    offer_order: Arc<RwLock<Vec<String>>>,
    pulse: watch::Sender<u64>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        let (pulse, _) = watch::channel(0);
        Self {
            pending: Arc::new(RwLock::new(HashMap::new())),
            resolved: Arc::new(RwLock::new(Vec::new())),
            offer_order: Arc::new(RwLock::new(Vec::new())),
            pulse,
        }
    }

    /// Installs a step's batch as the active pending set. The loop
    /// never advances past an unresolved batch, so a second offer
    /// while one is outstanding is a driver bug.
    pub async fn offer(&self, batch: Vec<PendingApproval>) {
        let mut pending = self.pending.write().await;
        debug_assert!(pending.is_empty(), "approval batch offered over an unresolved one");
        if !pending.is_empty() {
            tracing::error!(
                outstanding = pending.len(),
                "approval batch offered while another is unresolved; replacing"
            );
            pending.clear();
        }
        self.resolved.write().await.clear();
        let mut order = self.offer_order.write().await;
        order.clear();
        for approval in batch {
            order.push(approval.tool_call_id.clone());
            pending.insert(approval.tool_call_id.clone(), approval);
        }
    }

    pub async fn approve(&self, ids: &[String]) {
        self.resolve(ids, ApprovalStatus::Approved).await;
    }

    pub async fn reject(&self, ids: &[String]) {
        self.resolve(ids, ApprovalStatus::Rejected).await;
    }

    pub async fn pending(&self) -> Vec<PendingApproval> {
        let pending = self.pending.read().await;
        self.offer_order
            .read()
            .await
            .iter()
            .filter_map(|id| pending.get(id).cloned())
            .collect()
    }

    /// Drains resolutions in offer order. Called by the loop once
    /// `wait_resolved` returns true.
    pub async fn take_resolved(&self) -> Vec<PendingApproval> {
        let mut resolved = self.resolved.write().await;
        let mut by_id: HashMap<String, PendingApproval> = resolved
            .drain(..)
            .map(|a| (a.tool_call_id.clone(), a))
            .collect();
        self.offer_order
            .write()
            .await
            .drain(..)
            .filter_map(|id| by_id.remove(&id))
            .collect()
    }

    /// Suspends until the pending set is empty. Returns false when the
    /// run is cancelled first; the batch stays unresolved in that case.
    pub async fn wait_resolved(&self, cancel: CancellationToken) -> bool {
        let mut rx = self.pulse.subscribe();
        loop {
            if self.pending.read().await.is_empty() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    async fn resolve(&self, ids: &[String], status: ApprovalStatus) {
        let mut touched = false;
        {
            let mut pending = self.pending.write().await;
            let mut resolved = self.resolved.write().await;
            for id in ids {
                // Unknown or already-resolved id: no-op by contract.
                let Some(mut approval) = pending.remove(id) else {
                    continue;
                };
                approval.status = status;
                resolved.push(approval);
                touched = true;
            }
        }
        if touched {
            self.pulse.send_modify(|n| *n += 1);
        }
    }
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new()
    }
}
