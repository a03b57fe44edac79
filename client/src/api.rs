//! HTTP client for the remote services endpoint.
//!
//! [`RemoteServicesClient`] wraps `reqwest::Client` with one typed method
//! per endpoint. Every request carries `Authorization: token <token>`.
//!
//! ## Error handling
//!
//! Transport failures become `ServerUnreachable`. Non-2xx responses are
//! parsed as `{kind, error}`; a 401 becomes `AuthenticationFailed` and a
//! failed `POST /kernels` becomes `KernelStartFailed`. If the body does not
//! parse, the raw text is the message.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use spyder_remote_protocol::{KernelModel, SpawnRequest};
use tracing::debug;

use crate::ClientError;

pub struct RemoteServicesClient {
    http: reqwest::Client,
    base_url: String,
    spawn_timeout: Duration,
}

impl RemoteServicesClient {
    /// Client for the server at `base_url` (e.g. `http://127.0.0.1:40123`).
    pub fn new(
        base_url: &str,
        token: &str,
        request_timeout: Duration,
        spawn_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-spyder-client"),
            HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
        );
        let mut auth = HeaderValue::from_str(&format!("token {token}"))
            .map_err(|_| ClientError::Config("token contains invalid characters".into()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(request_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            spawn_timeout,
        })
    }

    /// The server's base URL (without trailing slash).
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// `GET /version`
    pub async fn version(&self) -> Result<String, ClientError> {
        let resp = self.http.get(self.url("/version")).send().await?;
        Self::handle_response(resp).await
    }

    /// `GET /kernels` — ids of known kernels.
    pub async fn list_kernels(&self) -> Result<Vec<String>, ClientError> {
        let resp = self.http.get(self.url("/kernels")).send().await?;
        Self::handle_response(resp).await
    }

    /// `POST /kernels` — spawn a kernel of spec `name` (server default when
    /// `None`) with extra environment variables.
    pub async fn spawn_kernel(
        &self,
        name: Option<&str>,
        env: &HashMap<String, String>,
    ) -> Result<KernelModel, ClientError> {
        let body = SpawnRequest {
            name: name.map(String::from),
            env: env.clone(),
        };
        debug!("POST /kernels name={}", name.unwrap_or("<default>"));
        let result = async {
            let resp = self
                .http
                .post(self.url("/kernels"))
                .timeout(self.spawn_timeout)
                .json(&body)
                .send()
                .await?;
            Self::handle_response::<KernelModel>(resp).await
        }
        .await;
        let model = result.map_err(ClientError::into_start_failure)?;
        model.connection.validate().map_err(|e| ClientError::KernelStartFailed {
            kind: e.kind(),
            message: e.to_string(),
        })?;
        Ok(model)
    }

    /// `GET /kernels/{id}`
    pub async fn get_kernel(&self, id: &str) -> Result<KernelModel, ClientError> {
        let resp = self.http.get(self.url(&format!("/kernels/{id}"))).send().await?;
        Self::handle_response(resp).await
    }

    /// `DELETE /kernels/{id}` — `now` skips the polite shutdown request.
    pub async fn delete_kernel(&self, id: &str, now: bool) -> Result<(), ClientError> {
        let resp = self
            .http
            .delete(self.url(&format!("/kernels/{id}")))
            .query(&[("now", now)])
            .send()
            .await?;
        Self::handle_response::<serde_json::Value>(resp).await.map(|_| ())
    }

    /// `POST /kernels/{id}/interrupt`
    pub async fn interrupt_kernel(&self, id: &str) -> Result<(), ClientError> {
        let resp = self
            .http
            .post(self.url(&format!("/kernels/{id}/interrupt")))
            .send()
            .await?;
        Self::handle_empty(resp).await
    }

    /// `POST /kernels/{id}/restart` — same id and ports, new process.
    pub async fn restart_kernel(&self, id: &str) -> Result<KernelModel, ClientError> {
        let resp = self
            .http
            .post(self.url(&format!("/kernels/{id}/restart")))
            .timeout(self.spawn_timeout)
            .send()
            .await?;
        Self::handle_response(resp).await
    }

    /// `POST /kernels/{id}/attach`
    pub async fn attach_kernel(&self, id: &str) -> Result<KernelModel, ClientError> {
        let resp = self
            .http
            .post(self.url(&format!("/kernels/{id}/attach")))
            .send()
            .await?;
        Self::handle_response(resp).await
    }

    /// `POST /kernels/{id}/detach`
    pub async fn detach_kernel(&self, id: &str) -> Result<KernelModel, ClientError> {
        let resp = self
            .http
            .post(self.url(&format!("/kernels/{id}/detach")))
            .send()
            .await?;
        Self::handle_response(resp).await
    }

    /// `GET /kernelspecs`
    pub async fn kernelspecs(&self) -> Result<serde_json::Value, ClientError> {
        let resp = self.http.get(self.url("/kernelspecs")).send().await?;
        Self::handle_response(resp).await
    }

    /// `GET /environ` — the server's environment overlay.
    pub async fn environ(&self) -> Result<BTreeMap<String, String>, ClientError> {
        let resp = self.http.get(self.url("/environ")).send().await?;
        Self::handle_response(resp).await
    }

    /// `GET /environ/{name}`; `None` when unset.
    pub async fn get_env(&self, name: &str) -> Result<Option<String>, ClientError> {
        let resp = self
            .http
            .get(self.url(&format!("/environ/{name}")))
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await?;
        if status.is_success() {
            return Ok(Some(body));
        }
        match ClientError::from_response(status.as_u16(), &body) {
            e if e.is_not_found() => Ok(None),
            e => Err(e),
        }
    }

    /// `POST /environ/{name}` — returns `true` when the variable was new.
    pub async fn set_env(&self, name: &str, value: &str) -> Result<bool, ClientError> {
        let resp = self
            .http
            .post(self.url(&format!("/environ/{name}")))
            .form(&[("value", value)])
            .send()
            .await?;
        let created = resp.status() == reqwest::StatusCode::CREATED;
        Self::handle_empty(resp).await.map(|()| created)
    }

    /// `DELETE /environ/{name}`
    pub async fn delete_env(&self, name: &str) -> Result<(), ClientError> {
        let resp = self
            .http
            .delete(self.url(&format!("/environ/{name}")))
            .send()
            .await?;
        Self::handle_empty(resp).await
    }

    /// `POST /shutdown`
    pub async fn shutdown_server(&self) -> Result<(), ClientError> {
        let resp = self.http.post(self.url("/shutdown")).send().await?;
        Self::handle_empty(resp).await
    }

    /// Parse an HTTP response: the JSON body on success, a [`ClientError`]
    /// built from the error body otherwise.
    async fn handle_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ClientError> {
        let status = resp.status();
        let body = resp.text().await?;
        if status.is_success() {
            serde_json::from_str(&body)
                .map_err(|e| ClientError::Protocol(format!("invalid JSON from server: {e}")))
        } else {
            Err(ClientError::from_response(status.as_u16(), &body))
        }
    }

    async fn handle_empty(resp: reqwest::Response) -> Result<(), ClientError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await?;
        Err(ClientError::from_response(status.as_u16(), &body))
    }
}
