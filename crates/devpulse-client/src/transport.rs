//! Wire transport to the relay server.
//!
//! The [`SyncTransport`] trait is the seam between the reconciler and the
//! network; tests substitute an in-memory implementation.

use serde::de::DeserializeOwned;
use serde::Serialize;

use devpulse_shared::protocol::{
    ChangePasswordRequest, ChangePasswordResponse, ContentRequest, ContentResponse,
    DeleteProfileRequest, ErrorBody, RegisterProfileRequest, RegisterProfileResponse, StatusQuery,
    StatusResponse, SyncRequest, SyncResponse,
};

use crate::error::SyncError;

#[allow(async_fn_in_trait)]
pub trait SyncTransport {
    async fn register(
        &self,
        req: &RegisterProfileRequest,
    ) -> Result<RegisterProfileResponse, SyncError>;

    async fn status(&self, profile_id: &str, query: &StatusQuery)
        -> Result<StatusResponse, SyncError>;

    async fn fetch_content(
        &self,
        profile_id: &str,
        req: &ContentRequest,
    ) -> Result<ContentResponse, SyncError>;

    async fn sync(&self, profile_id: &str, req: &SyncRequest) -> Result<SyncResponse, SyncError>;

    async fn change_password(
        &self,
        profile_id: &str,
        req: &ChangePasswordRequest,
    ) -> Result<ChangePasswordResponse, SyncError>;

    async fn delete_profile(
        &self,
        profile_id: &str,
        req: &DeleteProfileRequest,
    ) -> Result<(), SyncError>;
}

/// reqwest-backed transport talking to a relay server instance.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, SyncError> {
        let response = self.client.post(self.url(path)).json(body).send().await?;
        decode_response(response).await
    }
}

/// Map non-2xx responses onto the client error taxonomy via the server's
/// JSON error envelope.
async fn decode_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let body: ErrorBody = response
        .json()
        .await
        .unwrap_or_else(|_| ErrorBody::new(format!("HTTP {status}")));

    Err(match status.as_u16() {
        401 => SyncError::Auth {
            attempts_remaining: body.attempts_remaining,
        },
        429 if body.locked == Some(true) => SyncError::Locked {
            retry_after_seconds: body.retry_after_seconds.unwrap_or(0),
        },
        429 => SyncError::RateLimited,
        404 => SyncError::NotFound,
        _ => SyncError::Server(body.error),
    })
}

impl SyncTransport for HttpTransport {
    async fn register(
        &self,
        req: &RegisterProfileRequest,
    ) -> Result<RegisterProfileResponse, SyncError> {
        self.post_json("/profiles/register", req).await
    }

    async fn status(
        &self,
        profile_id: &str,
        query: &StatusQuery,
    ) -> Result<StatusResponse, SyncError> {
        let response = self
            .client
            .get(self.url(&format!("/profiles/{profile_id}/status")))
            .query(query)
            .send()
            .await?;
        decode_response(response).await
    }

    async fn fetch_content(
        &self,
        profile_id: &str,
        req: &ContentRequest,
    ) -> Result<ContentResponse, SyncError> {
        self.post_json(&format!("/profiles/{profile_id}/content"), req)
            .await
    }

    async fn sync(&self, profile_id: &str, req: &SyncRequest) -> Result<SyncResponse, SyncError> {
        self.post_json(&format!("/profiles/{profile_id}/sync"), req)
            .await
    }

    async fn change_password(
        &self,
        profile_id: &str,
        req: &ChangePasswordRequest,
    ) -> Result<ChangePasswordResponse, SyncError> {
        self.post_json(&format!("/profiles/{profile_id}/password"), req)
            .await
    }

    async fn delete_profile(
        &self,
        profile_id: &str,
        req: &DeleteProfileRequest,
    ) -> Result<(), SyncError> {
        let response = self
            .client
            .delete(self.url(&format!("/profiles/{profile_id}")))
            .json(req)
            .send()
            .await?;
        decode_response::<serde_json::Value>(response).await?;
        Ok(())
    }
}
