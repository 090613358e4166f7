use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{PublishError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseKind {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "Not Ready")]
    NotReady,
    Error,
}

impl ResponseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseKind::Ok => "OK",
            ResponseKind::NotReady => "Not Ready",
            ResponseKind::Error => "Error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub kind: ResponseKind,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub fault: Option<String>,
    /// Last job the gateway accepted; only meaningful for `initiate`
    #[serde(default)]
    pub last_job_id: Option<i64>,
}

impl GatewayResponse {
    pub fn ok() -> Self {
        Self {
            kind: ResponseKind::Ok,
            message: "OK".to_string(),
            fault: None,
            last_job_id: None,
        }
    }

    pub fn error(message: &str) -> Self {
        Self {
            kind: ResponseKind::Error,
            message: message.to_string(),
            fault: None,
            last_job_id: None,
        }
    }

    pub fn with_last_job_id(mut self, id: Option<i64>) -> Self {
        self.last_job_id = id;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.kind == ResponseKind::Ok
    }

    /// Turn anything but OK into [`PublishError::GatewayRejected`].
    pub fn check(self) -> Result<Self> {
        if self.is_ok() {
            return Ok(self);
        }
        let message = match &self.fault {
            Some(fault) => format!("{} [{}]", self.message, fault),
            None => self.message.clone(),
        };
        Err(PublishError::GatewayRejected {
            kind: self.kind.as_str().to_string(),
            message,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prolog {
    pub job_id: i64,
    pub push_type: String,
    pub target: String,
    pub last_job_id: Option<i64>,
    pub doc_count: usize,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentAction {
    Export,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendDocument {
    pub job_id: i64,
    pub sequence: usize,
    pub action: DocumentAction,
    pub doctype: String,
    pub doc_id: i64,
    pub version: i64,
    pub group: i64,
    /// Present for exports only
    pub content: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionStatus {
    Complete,
    Abort,
}

/// Session-oriented push protocol of the downstream gateway. Every call
/// waits for the gateway's answer.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn initiate(&self, push_type: &str, target: &str) -> Result<GatewayResponse>;

    async fn send_prolog(&self, prolog: &Prolog) -> Result<GatewayResponse>;

    async fn send_document(&self, doc: &SendDocument) -> Result<GatewayResponse>;

    async fn send_complete(
        &self,
        job_id: i64,
        push_type: &str,
        count: usize,
        status: CompletionStatus,
    ) -> Result<GatewayResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_ok_responses_become_errors() {
        assert!(GatewayResponse::ok().check().is_ok());

        let mut response = GatewayResponse::error("queue full");
        response.fault = Some("GK-17".to_string());
        match response.check() {
            Err(PublishError::GatewayRejected { kind, message }) => {
                assert_eq!(kind, "Error");
                assert_eq!(message, "queue full [GK-17]");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn response_kind_uses_wire_names() {
        let response: GatewayResponse =
            serde_json::from_str(r#"{"kind": "Not Ready", "message": "busy"}"#).unwrap();
        assert_eq!(response.kind, ResponseKind::NotReady);
        assert!(response.last_job_id.is_none());
        assert_eq!(
            serde_json::to_value(CompletionStatus::Abort).unwrap(),
            serde_json::json!("abort")
        );
    }
}
