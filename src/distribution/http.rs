use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::distribution::gateway::{
    CompletionStatus, Gateway, GatewayResponse, Prolog, SendDocument,
};
use crate::error::Result;

#[derive(Debug, Serialize)]
struct InitiateRequest<'a> {
    push_type: &'a str,
    target: &'a str,
}

#[derive(Debug, Serialize)]
struct CompleteRequest<'a> {
    job_id: i64,
    push_type: &'a str,
    count: usize,
    status: CompletionStatus,
}

/// JSON-over-HTTP gateway transport.
///
/// Each protocol step is a `POST` to `<base>/<step>` answered with a
/// [`GatewayResponse`] body.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(&self, step: &str, body: &B) -> Result<R> {
        let url = format!("{}/{}", self.base_url, step);
        tracing::debug!(url = %url, "Gateway request");
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<R>().await?)
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn initiate(&self, push_type: &str, target: &str) -> Result<GatewayResponse> {
        self.post("initiate", &InitiateRequest { push_type, target })
            .await
    }

    async fn send_prolog(&self, prolog: &Prolog) -> Result<GatewayResponse> {
        self.post("prolog", prolog).await
    }

    async fn send_document(&self, doc: &SendDocument) -> Result<GatewayResponse> {
        self.post("document", doc).await
    }

    async fn send_complete(
        &self,
        job_id: i64,
        push_type: &str,
        count: usize,
        status: CompletionStatus,
    ) -> Result<GatewayResponse> {
        self.post(
            "complete",
            &CompleteRequest {
                job_id,
                push_type,
                count,
                status,
            },
        )
        .await
    }
}
