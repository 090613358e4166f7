//! Distribution to the downstream content gateway.
//!
//! A distribution run moves through [`PushState`]s: the diff against the
//! last accepted snapshot is computed, the run optionally waits for operator
//! approval, then a gateway session is opened and the working snapshot is
//! streamed in order. The authoritative snapshot only changes after the
//! gateway confirms completion.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod diff;
pub mod gateway;
pub mod groups;
pub mod http;
pub mod pusher;

pub use diff::{compute_diff, normalize, Diff, PublishedDocument};
pub use gateway::{
    CompletionStatus, DocumentAction, Gateway, GatewayResponse, Prolog, ResponseKind, SendDocument,
};
pub use groups::assign_groups;
pub use http::HttpGateway;
pub use pusher::{PushOutcome, Pusher};

/// Category of a distribution run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PushType {
    /// Full reload: the gateway's content is replaced by this job's
    FullLoad,
    /// Incremental export of changes since the last accepted push
    Export,
    /// Targeted export of specific documents; never prunes
    TargetedExport,
    /// Targeted removal of the job's documents from the gateway
    TargetedRemoval,
}

impl PushType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushType::FullLoad => "Full Load",
            PushType::Export => "Export",
            PushType::TargetedExport => "Hotfix (Export)",
            PushType::TargetedRemoval => "Hotfix (Remove)",
        }
    }

    /// Name the gateway knows this push type by. Both targeted kinds are
    /// hotfixes to the gateway.
    pub fn gateway_name(&self) -> &'static str {
        match self {
            PushType::TargetedExport | PushType::TargetedRemoval => "Hotfix",
            other => other.as_str(),
        }
    }

    /// Whether documents absent from this job may be pruned from the gateway.
    pub fn prunes(&self) -> bool {
        matches!(self, PushType::Export)
    }

    /// Whether a successful push replaces the whole snapshot.
    pub fn replaces_snapshot(&self) -> bool {
        matches!(self, PushType::FullLoad)
    }
}

impl std::fmt::Display for PushType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PushType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full load" | "full-load" | "fullload" => Ok(PushType::FullLoad),
            "export" => Ok(PushType::Export),
            "hotfix (export)" | "hotfix-export" | "targeted-export" => Ok(PushType::TargetedExport),
            "hotfix (remove)" | "hotfix-remove" | "targeted-removal" => {
                Ok(PushType::TargetedRemoval)
            }
            other => Err(format!("unknown push type {:?}", other)),
        }
    }
}

/// Where a distribution run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushState {
    ComputingDiff,
    AwaitingApproval,
    Handshaking,
    Streaming,
    Completing,
    Success,
    Failure,
}

impl PushState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushState::ComputingDiff => "computing diff",
            PushState::AwaitingApproval => "awaiting approval",
            PushState::Handshaking => "handshaking",
            PushState::Streaming => "streaming",
            PushState::Completing => "completing",
            PushState::Success => "success",
            PushState::Failure => "failure",
        }
    }
}

impl std::fmt::Display for PushState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
