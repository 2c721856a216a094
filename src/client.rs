use crate::config::PanelConfig;
use crate::poller::SnapshotSource;
use crate::resources::{
    ActionMessage, Container, DatabaseList, EmailAccount, LogTail, MailServerStatus,
    SystemResources, WebsiteList,
};
use crate::snapshot::{DashboardSnapshot, ServiceStatus, SnapshotError, SystemStatus, Validate};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const API_PREFIX: &str = "/api/v1";
const ERROR_BODY_LIMIT: usize = 256;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("не удалось создать HTTP-клиент: {0}")]
    Build(#[source] reqwest::Error),
    #[error("ошибка сети при запросе {url}: {source}")]
    Transport {
        url: String,
        source: reqwest::Error,
    },
    #[error("сервер вернул {status} для {url}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("некорректный JSON от {url}: {source}")]
    Decode {
        url: String,
        source: serde_json::Error,
    },
    #[error("ответ {url} нарушает инварианты: {source}")]
    Invalid {
        url: String,
        source: SnapshotError,
    },
    #[error("ошибка авторизации: {0}")]
    Auth(String),
    #[error("панель сообщила об ошибке для {url}: {message}")]
    Remote { url: String, message: String },
    #[error("некорректный адрес запроса: {0}")]
    BadUrl(String),
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Clone)]
pub struct PanelClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl PanelClient {
    pub fn new(cfg: &PanelConfig) -> Result<Self, ClientError> {
        let http = Client::builder()
            .user_agent(concat!("panelwatch/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(ClientError::Build)?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{API_PREFIX}{path}", self.base_url)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let base = self.url("");
        let mut url =
            Url::parse(&base).map_err(|e| ClientError::BadUrl(format!("{base}: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ClientError::BadUrl(base.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match self.token.as_deref() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
        url: String,
    ) -> Result<T, ClientError> {
        let resp = req.send().await.map_err(|source| ClientError::Transport {
            url: url.clone(),
            source,
        })?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(|source| ClientError::Transport {
            url: url.clone(),
            source,
        })?;

        if !status.is_success() {
            let mut body = String::from_utf8_lossy(&bytes).into_owned();
            if body.len() > ERROR_BODY_LIMIT {
                let mut cut = ERROR_BODY_LIMIT;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(ClientError::Status {
                url,
                status: status.as_u16(),
                body,
            });
        }

        debug!(url = %url, bytes = bytes.len(), "ответ получен");
        serde_json::from_slice(&bytes).map_err(|source| ClientError::Decode { url, source })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = self.url(path);
        let req = self.authorized(self.http.get(&url));
        self.execute(req, url).await
    }

    async fn get_url<T: DeserializeOwned>(&self, url: Url) -> Result<T, ClientError> {
        let req = self.authorized(self.http.get(url.clone()));
        self.execute(req, url.to_string()).await
    }

    // на часть ошибок панель отвечает 200 с телом {"error": "..."}
    async fn get_reported<T: DeserializeOwned>(&self, url: Url) -> Result<T, ClientError> {
        let value: serde_json::Value = self.get_url(url.clone()).await?;
        if let Some(message) = value.get("error").and_then(|e| e.as_str()) {
            return Err(ClientError::Remote {
                url: url.to_string(),
                message: message.to_string(),
            });
        }
        serde_json::from_value(value).map_err(|source| ClientError::Decode {
            url: url.to_string(),
            source,
        })
    }

    async fn get_validated<T: DeserializeOwned + Validate>(
        &self,
        path: &str,
    ) -> Result<T, ClientError> {
        let value: T = self.get_json(path).await?;
        value.validate().map_err(|source| ClientError::Invalid {
            url: self.url(path),
            source,
        })?;
        Ok(value)
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<String, ClientError> {
        let url = self.url("/auth/login");
        let req = self
            .http
            .post(&url)
            .form(&[("username", username), ("password", password)]);
        match self.execute::<TokenResponse>(req, url).await {
            Ok(token) if token.access_token.trim().is_empty() => {
                Err(ClientError::Auth("сервер вернул пустой токен".to_string()))
            }
            Ok(token) => Ok(token.access_token),
            Err(ClientError::Status { status: 401, .. }) => {
                Err(ClientError::Auth("неверный логин или пароль".to_string()))
            }
            Err(err) => Err(err),
        }
    }

    pub async fn dashboard_stats(&self) -> Result<DashboardSnapshot, ClientError> {
        self.get_validated("/dashboard/stats").await
    }

    pub async fn system_status(&self) -> Result<SystemStatus, ClientError> {
        self.get_validated("/system/status").await
    }

    pub async fn services(&self) -> Result<BTreeMap<String, ServiceStatus>, ClientError> {
        self.get_json("/system/services").await
    }

    pub async fn restart_service(&self, name: &str) -> Result<String, ClientError> {
        let name = name.trim();
        if matches!(name, "" | "." | "..") {
            return Err(ClientError::BadUrl(format!("имя сервиса '{name}'")));
        }
        let url = self.endpoint(&["system", "services", name, "restart"])?;
        let req = self.authorized(self.http.post(url.clone()));
        let reply: ActionMessage = self.execute(req, url.to_string()).await?;
        Ok(reply.message)
    }

    pub async fn system_logs(
        &self,
        service: Option<&str>,
        lines: u32,
    ) -> Result<LogTail, ClientError> {
        let mut url = self.endpoint(&["system", "logs"])?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = service.map(str::trim).filter(|s| !s.is_empty()) {
                query.append_pair("service", service);
            }
            query.append_pair("lines", &lines.to_string());
        }
        self.get_reported(url).await
    }

    pub async fn system_resources(&self) -> Result<SystemResources, ClientError> {
        self.get_url(self.endpoint(&["system", "resources"])?).await
    }

    pub async fn mail_server_status(&self) -> Result<MailServerStatus, ClientError> {
        self.get_reported(self.endpoint(&["email", "status"])?).await
    }

    pub async fn websites(&self, skip: u32, limit: u32) -> Result<WebsiteList, ClientError> {
        self.get_json(&format!("/websites/?skip={skip}&limit={limit}"))
            .await
    }

    pub async fn databases(&self, skip: u32, limit: u32) -> Result<DatabaseList, ClientError> {
        self.get_json(&format!("/databases/?skip={skip}&limit={limit}"))
            .await
    }

    pub async fn containers(&self) -> Result<Vec<Container>, ClientError> {
        self.get_json("/docker/containers").await
    }

    pub async fn email_accounts(&self) -> Result<Vec<EmailAccount>, ClientError> {
        self.get_json("/email/accounts").await
    }
}

pub struct DashboardStatsSource {
    client: PanelClient,
}

impl DashboardStatsSource {
    pub fn new(client: PanelClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SnapshotSource for DashboardStatsSource {
    type Snapshot = DashboardSnapshot;

    fn resource(&self) -> &'static str {
        "dashboard"
    }

    async fn fetch(&self) -> Result<DashboardSnapshot, ClientError> {
        self.client.dashboard_stats().await
    }
}

pub struct SystemStatusSource {
    client: PanelClient,
}

impl SystemStatusSource {
    pub fn new(client: PanelClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SnapshotSource for SystemStatusSource {
    type Snapshot = SystemStatus;

    fn resource(&self) -> &'static str {
        "system"
    }

    async fn fetch(&self) -> Result<SystemStatus, ClientError> {
        self.client.system_status().await
    }
}
