//! Approval gate for side-effecting tool actions
//!
//! Tools with side effects ask the gate before executing. YOLO mode and
//! the per-session allow-list resolve synchronously; anything else is
//! parked for the host, which resolves it through a one-shot responder.

use std::collections::{BTreeMap, HashSet};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::events::SoulEvent;
use crate::wire::Wire;

/// Host decision for one approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalResponse {
    /// Allow this invocation only
    ApproveOnce,
    /// Allow this `(tool, action)` pair for the rest of the session
    ApproveForSession,
    /// Refuse the invocation
    Reject,
}

/// A request awaiting a host decision
pub struct PendingApproval {
    pub tool_name: String,
    pub action_key: String,
    pub description: String,
    responder: oneshot::Sender<ApprovalResponse>,
}

impl PendingApproval {
    /// Deliver the host's decision. Consumes the request.
    pub fn resolve(self, response: ApprovalResponse) {
        let _ = self.responder.send(response);
    }
}

/// The approval gate. One instance per session.
pub struct Approval {
    yolo: bool,
    allow_list: Mutex<HashSet<(String, String)>>,
    requests_tx: mpsc::UnboundedSender<PendingApproval>,
    requests_rx: Mutex<Option<mpsc::UnboundedReceiver<PendingApproval>>>,
    wire: Wire,
}

impl Approval {
    pub fn new(yolo: bool, wire: Wire) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        Self {
            yolo,
            allow_list: Mutex::new(HashSet::new()),
            requests_tx,
            requests_rx: Mutex::new(Some(requests_rx)),
            wire,
        }
    }

    /// Whether every request is auto-approved
    pub fn is_yolo(&self) -> bool {
        self.yolo
    }

    /// Take the host-facing request stream. Yields each request that
    /// needs an interactive decision. Can be taken once.
    pub fn take_requests(&self) -> Option<mpsc::UnboundedReceiver<PendingApproval>> {
        self.requests_rx.lock().take()
    }

    /// Number of `(tool, action)` pairs approved for the session so far
    pub fn session_approval_count(&self) -> usize {
        self.allow_list.lock().len()
    }

    /// Ask permission to run `action_key` of `tool_name`.
    ///
    /// Resolves synchronously for YOLO mode and allow-list hits; otherwise
    /// publishes an `approval_required` status and suspends until the host
    /// resolves the pending request. A host that drops the request without
    /// answering counts as a rejection.
    pub async fn request(
        &self,
        tool_name: &str,
        action_key: &str,
        description: &str,
    ) -> ApprovalResponse {
        if self.yolo {
            return ApprovalResponse::ApproveOnce;
        }

        let key = (tool_name.to_string(), action_key.to_string());
        if self.allow_list.lock().contains(&key) {
            return ApprovalResponse::ApproveForSession;
        }

        let (responder, decided) = oneshot::channel();
        let pending = PendingApproval {
            tool_name: tool_name.to_string(),
            action_key: action_key.to_string(),
            description: description.to_string(),
            responder,
        };

        self.wire.publish(SoulEvent::StatusUpdate {
            status: BTreeMap::from([
                ("approval_required".to_string(), description.to_string()),
                ("tool".to_string(), tool_name.to_string()),
                ("action".to_string(), action_key.to_string()),
            ]),
        });

        if self.requests_tx.send(pending).is_err() {
            tracing::warn!("approval host gone, rejecting {tool_name}/{action_key}");
            return ApprovalResponse::Reject;
        }

        match decided.await {
            Ok(ApprovalResponse::ApproveForSession) => {
                self.allow_list.lock().insert(key);
                ApprovalResponse::ApproveForSession
            }
            Ok(response) => response,
            Err(_) => ApprovalResponse::Reject,
        }
    }
}
