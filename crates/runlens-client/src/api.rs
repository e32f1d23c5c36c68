//! REST client for the task service.

use std::future::Future;
use std::time::Duration;

use reqwest::header::{HeaderValue, AUTHORIZATION};
use reqwest::{Client, Url};
use runlens_types::{ResourceChangesResponse, TaskEnvelope, TaskSnapshot};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{ClientError, Result};

/// Which log section to fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogType {
    #[default]
    All,
    Plan,
    Apply,
}

impl LogType {
    pub fn as_str(self) -> &'static str {
        match self {
            LogType::All => "all",
            LogType::Plan => "plan",
            LogType::Apply => "apply",
        }
    }
}

/// The calls the poller and the monitor need. Implemented by [`ApiClient`]
/// and by in-memory fakes in tests.
pub trait RunApi: Send + Sync + 'static {
    fn fetch_task(
        &self,
        workspace_id: &str,
        task_id: u64,
    ) -> impl Future<Output = Result<TaskSnapshot>> + Send;

    fn fetch_resource_changes(
        &self,
        workspace_id: &str,
        task_id: u64,
    ) -> impl Future<Output = Result<ResourceChangesResponse>> + Send;
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: Url,
    token: Option<String>,
    request_timeout: Duration,
    http: Client,
}

impl ApiClient {
    /// The token is passed in explicitly and sent as a bearer header.
    pub fn new(
        base_url: &str,
        token: Option<String>,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))?;
        let http = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self {
            base_url,
            token,
            request_timeout,
            http,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    fn url(&self, path: &str) -> Result<Url> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Ok(Url::parse(&format!("{base}/{path}"))?)
    }

    fn auth_header(&self) -> Result<Option<HeaderValue>> {
        self.token
            .as_deref()
            .map(|token| {
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|e| ClientError::InvalidHeader(e.to_string()))
            })
            .transpose()
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response> {
        debug!(target: "runlens::api", %url, "GET");
        let mut request = self.http.get(url);
        if let Some(auth) = self.auth_header()? {
            request = request.header(AUTHORIZATION, auth);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ClientError::Timeout(self.request_timeout.as_millis() as u64)
            } else {
                ClientError::Http(e)
            }
        })?;
        check_response(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let response = self.get(url).await?;
        Ok(response.json::<T>().await?)
    }

    /// `GET /workspaces/{ws}/tasks/{id}`. Accepts both the wrapped and the
    /// bare task shape.
    pub async fn get_task(&self, workspace_id: &str, task_id: u64) -> Result<TaskSnapshot> {
        let url = self.url(&format!("workspaces/{workspace_id}/tasks/{task_id}"))?;
        let envelope: TaskEnvelope = self.get_json(url).await?;
        Ok(envelope.into_task())
    }

    /// `GET /workspaces/{ws}/tasks/{id}/resource-changes`.
    pub async fn get_resource_changes(
        &self,
        workspace_id: &str,
        task_id: u64,
    ) -> Result<ResourceChangesResponse> {
        let url = self.url(&format!(
            "workspaces/{workspace_id}/tasks/{task_id}/resource-changes"
        ))?;
        self.get_json(url).await
    }

    /// `GET /tasks/{id}/logs?type=...&format=text`, as flat text.
    pub async fn get_logs(&self, task_id: u64, log_type: LogType) -> Result<String> {
        let mut url = self.url(&format!("tasks/{task_id}/logs"))?;
        url.query_pairs_mut()
            .append_pair("type", log_type.as_str())
            .append_pair("format", "text");
        let response = self.get(url).await?;
        Ok(response.text().await?)
    }

    /// WebSocket endpoint for a task's live output.
    pub fn stream_url(&self, task_id: u64) -> Result<Url> {
        let mut url = self.url(&format!("tasks/{task_id}/output/stream"))?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::Closed(format!("cannot use scheme {scheme} for {url}")))?;
        Ok(url)
    }
}

impl RunApi for ApiClient {
    fn fetch_task(
        &self,
        workspace_id: &str,
        task_id: u64,
    ) -> impl Future<Output = Result<TaskSnapshot>> + Send {
        self.get_task(workspace_id, task_id)
    }

    fn fetch_resource_changes(
        &self,
        workspace_id: &str,
        task_id: u64,
    ) -> impl Future<Output = Result<ResourceChangesResponse>> + Send {
        self.get_resource_changes(workspace_id, task_id)
    }
}

async fn check_response(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base: &str) -> ApiClient {
        ApiClient::new(base, Some("tok".into()), Duration::from_secs(1), Duration::from_secs(1))
            .unwrap()
    }

    #[test]
    fn test_stream_url_switches_scheme() {
        let api = client("http://localhost:8080/api/v1/");
        assert_eq!(
            api.stream_url(42).unwrap().as_str(),
            "ws://localhost:8080/api/v1/tasks/42/output/stream"
        );

        let api = client("https://iac.example.com/api/v1");
        assert_eq!(
            api.stream_url(7).unwrap().as_str(),
            "wss://iac.example.com/api/v1/tasks/7/output/stream"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let result = ApiClient::new("not a url", None, Duration::from_secs(1), Duration::from_secs(1));
        assert!(matches!(result, Err(ClientError::Url(_))));
    }

    #[test]
    fn test_auth_header_rejects_control_chars() {
        let api = ApiClient::new(
            "http://localhost",
            Some("bad\ntoken".into()),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(matches!(api.auth_header(), Err(ClientError::InvalidHeader(_))));
    }
}
