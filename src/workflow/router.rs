//! Edges of the triage graph.
//!
//! All routing is pure: given a node and the snapshot, pick the next node.

use crate::workflow::state::{Classification, NodeName, ResumeSignal, Snapshot};

/// After priority detection: draft a reply only when one is needed.
pub fn route_by_classification(classification: &Classification) -> NodeName {
    if classification.needs_response {
        NodeName::GenerateResponse
    } else {
        NodeName::Notify
    }
}

/// After the user decided.
pub fn route_after_approval(classification: &Classification, signal: &ResumeSignal) -> NodeName {
    match signal {
        ResumeSignal::Reject => NodeName::Confirm,
        ResumeSignal::Approve { .. } | ResumeSignal::Change { .. } => {
            if classification.needs_response {
                NodeName::SendResponse
            } else {
                NodeName::ExecuteAction
            }
        }
    }
}

/// The node that follows `current`.
///
/// `AwaitApproval` without a decision routes to itself; the engine suspends
/// there.
pub fn next_node(current: NodeName, snapshot: &Snapshot) -> NodeName {
    match current {
        NodeName::ExtractContext => NodeName::Classify,
        NodeName::Classify => NodeName::DetectPriority,
        NodeName::DetectPriority => match &snapshot.classification {
            Some(c) => route_by_classification(c),
            None => NodeName::Notify,
        },
        NodeName::GenerateResponse => NodeName::Notify,
        NodeName::Notify => NodeName::AwaitApproval,
        NodeName::AwaitApproval => match (&snapshot.classification, &snapshot.decision) {
            (Some(c), Some(signal)) => route_after_approval(c, signal),
            (None, Some(ResumeSignal::Reject)) => NodeName::Confirm,
            (None, Some(_)) => NodeName::ExecuteAction,
            (_, None) => NodeName::AwaitApproval,
        },
        NodeName::SendResponse => NodeName::ExecuteAction,
        NodeName::ExecuteAction => NodeName::Confirm,
        NodeName::Confirm => NodeName::End,
        NodeName::End => NodeName::End,
        NodeName::Failed => NodeName::Failed,
    }
}
