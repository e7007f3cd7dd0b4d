//! Typed Rust client for the Proxmox VE REST API.
//!
//! Covers the subset needed for provisioning VPS guests:
//! nodes, QEMU guests (create, clone, configure, power, status, delete),
//! vzdump backups, storage content and task status.

mod types;

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::Method;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

pub use types::*;

/// Tickets are valid for two hours; renew well before that.
const TICKET_MAX_AGE: Duration = Duration::from_secs(90 * 60);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("proxmox api request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("proxmox api {endpoint} returned {status}: {body}")]
    Api {
        endpoint: &'static str,
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("proxmox authentication failed: {0}")]
    Auth(String),
}

impl Error {
    /// Whether the remote resource does not exist.
    ///
    /// Proxmox answers 500 with "... does not exist" for unknown guests,
    /// so the body is inspected as well as the status.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Api { status, body, .. } => {
                status.as_u16() == 404 || body.to_ascii_lowercase().contains("does not exist")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// How the client authenticates against the cluster.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Stateless API token (`user@realm!token_name`).
    ApiToken {
        user: String,
        token_name: String,
        token_value: String,
    },
    /// Username/password; exchanged for a ticket session.
    Password { user: String, password: String },
}

#[derive(Debug, Clone)]
struct Session {
    ticket: String,
    csrf_token: String,
    acquired: Instant,
}

/// Client for the Proxmox VE REST API.
#[derive(Clone)]
pub struct PveClient {
    base_url: String,
    credentials: Arc<Credentials>,
    session: Arc<RwLock<Option<Session>>>,
    http: reqwest::Client,
}

impl PveClient {
    /// `base_url` is the cluster endpoint without the API prefix,
    /// e.g. `https://pve.example.com:8006`.
    pub fn new(base_url: impl Into<String>, credentials: Credentials, verify_tls: bool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials: Arc::new(credentials),
            session: Arc::new(RwLock::new(None)),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api2/json{path}", self.base_url)
    }

    async fn check(resp: reqwest::Response, endpoint: &'static str) -> Result<reqwest::Response> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Api { endpoint, status, body });
        }
        Ok(resp)
    }

    // ── Session ──────────────────────────────────────────────────────

    /// Exchange username/password for a fresh ticket.
    pub async fn login(&self, user: &str, password: &str) -> Result<Ticket> {
        let resp = self
            .http
            .post(self.url("/access/ticket"))
            .form(&[("username", user), ("password", password)])
            .send()
            .await?;

        let resp = match Self::check(resp, "login").await {
            Ok(resp) => resp,
            Err(Error::Api { status, body, .. }) if status.as_u16() == 401 => {
                return Err(Error::Auth(format!("{user}: {body}")));
            }
            Err(e) => return Err(e),
        };

        let envelope: Envelope<Ticket> = resp.json().await?;
        Ok(envelope.data)
    }

    async fn session(&self, user: &str, password: &str) -> Result<Session> {
        if let Some(session) = self.session.read().await.as_ref()
            && session.acquired.elapsed() < TICKET_MAX_AGE
        {
            return Ok(session.clone());
        }

        let mut guard = self.session.write().await;
        if let Some(session) = guard.as_ref()
            && session.acquired.elapsed() < TICKET_MAX_AGE
        {
            return Ok(session.clone());
        }

        let ticket = self.login(user, password).await?;
        tracing::debug!(user = %ticket.username, "proxmox: acquired ticket");
        let session = Session {
            ticket: ticket.ticket,
            csrf_token: ticket.csrf_token,
            acquired: Instant::now(),
        };
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn invalidate_session(&self) {
        *self.session.write().await = None;
    }

    async fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
        method: &Method,
    ) -> Result<reqwest::RequestBuilder> {
        match &*self.credentials {
            Credentials::ApiToken {
                user,
                token_name,
                token_value,
            } => Ok(builder.header(
                "Authorization",
                format!("PVEAPIToken={user}!{token_name}={token_value}"),
            )),
            Credentials::Password { user, password } => {
                let session = self.session(user, password).await?;
                let builder = builder.header("Cookie", format!("PVEAuthCookie={}", session.ticket));
                if *method == Method::GET {
                    Ok(builder)
                } else {
                    Ok(builder.header("CSRFPreventionToken", session.csrf_token))
                }
            }
        }
    }

    /// Send an authorized request, re-acquiring the ticket once on 401.
    async fn send(
        &self,
        method: Method,
        path: &str,
        endpoint: &'static str,
        form: Option<&Params>,
        query: &[(&str, String)],
    ) -> Result<reqwest::Response> {
        let mut retried = false;
        loop {
            let mut builder = self.http.request(method.clone(), self.url(path)).query(query);
            if let Some(form) = form {
                builder = builder.form(form);
            }
            let builder = self.authorize(builder, &method).await?;
            let resp = builder.send().await?;

            let session_auth = matches!(*self.credentials, Credentials::Password { .. });
            if resp.status().as_u16() == 401 && session_auth && !retried {
                tracing::debug!(endpoint, "proxmox: ticket rejected, re-authenticating");
                self.invalidate_session().await;
                retried = true;
                continue;
            }

            return Self::check(resp, endpoint).await;
        }
    }

    async fn data<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let envelope: Envelope<T> = resp.json().await?;
        Ok(envelope.data)
    }

    // ── Nodes ────────────────────────────────────────────────────────

    pub async fn nodes(&self) -> Result<Vec<NodeSummary>> {
        let resp = self.send(Method::GET, "/nodes", "list nodes", None, &[]).await?;
        Self::data(resp).await
    }

    // ── QEMU ─────────────────────────────────────────────────────────

    pub async fn qemu_list(&self, node: &str) -> Result<Vec<QemuSummary>> {
        let resp = self
            .send(Method::GET, &format!("/nodes/{node}/qemu"), "list qemu", None, &[])
            .await?;
        Self::data(resp).await
    }

    pub async fn qemu_create(&self, node: &str, params: &Params) -> Result<Upid> {
        let resp = self
            .send(
                Method::POST,
                &format!("/nodes/{node}/qemu"),
                "create qemu",
                Some(params),
                &[],
            )
            .await?;
        Self::data(resp).await
    }

    pub async fn qemu_clone(&self, node: &str, source_vmid: u32, params: &Params) -> Result<Upid> {
        let resp = self
            .send(
                Method::POST,
                &format!("/nodes/{node}/qemu/{source_vmid}/clone"),
                "clone qemu",
                Some(params),
                &[],
            )
            .await?;
        Self::data(resp).await
    }

    /// Synchronous config update (`PUT`); returns once the config is written.
    pub async fn qemu_update_config(&self, node: &str, vmid: u32, params: &Params) -> Result<()> {
        self.send(
            Method::PUT,
            &format!("/nodes/{node}/qemu/{vmid}/config"),
            "update qemu config",
            Some(params),
            &[],
        )
        .await?;
        Ok(())
    }

    pub async fn qemu_status_action(&self, node: &str, vmid: u32, action: StatusAction) -> Result<Upid> {
        let endpoint = match action {
            StatusAction::Start => "start qemu",
            StatusAction::Stop => "stop qemu",
            StatusAction::Reset => "reset qemu",
            StatusAction::Shutdown => "shutdown qemu",
        };
        let resp = self
            .send(
                Method::POST,
                &format!("/nodes/{node}/qemu/{vmid}/status/{}", action.as_str()),
                endpoint,
                Some(&Params::new()),
                &[],
            )
            .await?;
        Self::data(resp).await
    }

    pub async fn qemu_current_status(&self, node: &str, vmid: u32) -> Result<QemuStatus> {
        let resp = self
            .send(
                Method::GET,
                &format!("/nodes/{node}/qemu/{vmid}/status/current"),
                "get qemu status",
                None,
                &[],
            )
            .await?;
        Self::data(resp).await
    }

    /// Destroy a guest together with its disks.
    pub async fn qemu_delete(&self, node: &str, vmid: u32) -> Result<Upid> {
        let resp = self
            .send(
                Method::DELETE,
                &format!("/nodes/{node}/qemu/{vmid}"),
                "delete qemu",
                None,
                &[
                    ("purge", "1".to_string()),
                    ("destroy-unreferenced-disks", "1".to_string()),
                ],
            )
            .await?;
        Self::data(resp).await
    }

    // ── Backups ──────────────────────────────────────────────────────

    pub async fn vzdump(&self, node: &str, params: &Params) -> Result<Upid> {
        let resp = self
            .send(
                Method::POST,
                &format!("/nodes/{node}/vzdump"),
                "vzdump",
                Some(params),
                &[],
            )
            .await?;
        Self::data(resp).await
    }

    pub async fn storage_content(
        &self,
        node: &str,
        storage: &str,
        content: Option<&str>,
    ) -> Result<Vec<StorageVolume>> {
        let query: Vec<(&str, String)> = content
            .map(|c| vec![("content", c.to_string())])
            .unwrap_or_default();
        let resp = self
            .send(
                Method::GET,
                &format!("/nodes/{node}/storage/{storage}/content"),
                "list storage content",
                None,
                &query,
            )
            .await?;
        Self::data(resp).await
    }

    // ── Tasks ────────────────────────────────────────────────────────

    pub async fn task_status(&self, node: &str, upid: &Upid) -> Result<TaskStatus> {
        let resp = self
            .send(
                Method::GET,
                &format!("/nodes/{node}/tasks/{}/status", upid.0),
                "get task status",
                None,
                &[],
            )
            .await?;
        Self::data(resp).await
    }
}
