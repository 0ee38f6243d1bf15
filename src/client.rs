//! Client side of the control protocol.
//!
//! A [`DaemonClient`] owns its [`Provisioner`]: `start` brings the machine
//! up and waits for the daemon to answer, `close` always tears the machine
//! down, even when the daemon is no longer reachable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::protocol::{
    ActionResponse, CommandAction, ErrorBody, HealthResponse, HotkeyAction, KeyDownAction,
    KeyPressAction, KeyUpAction, KeyboardKey, KeyboardStateObservation, MouseButton,
    MouseButtonAction, MouseMoveAction, MouseScrollAction, MouseStateObservation, Observation,
    ScreenshotObservation, TypeAction,
};
use crate::provisioner::{Endpoint, ProvisionError, Provisioner, RetryPolicy};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("daemon at {endpoint} rejected the session token")]
    Authentication { endpoint: Endpoint },

    #[error("daemon at {endpoint} never became reachable: {source}")]
    Unreachable {
        endpoint: Endpoint,
        #[source]
        source: ProvisionError,
    },

    #[error("request to {path} failed: {source}")]
    Http {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("daemon returned {status} for {path}: {message}")]
    Api {
        path: String,
        status: u16,
        message: String,
    },

    #[error("no daemon session; call start() first")]
    NotStarted,

    #[error(transparent)]
    Provision(#[from] ProvisionError),
}

/// Where the live daemon is and how to authenticate to it.
#[derive(Debug, Clone)]
pub struct DaemonSession {
    pub endpoint: Endpoint,
    base_url: String,
    token: String,
}

impl DaemonSession {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

pub struct DaemonClient {
    provisioner: Provisioner,
    http: reqwest::Client,
    session: Option<DaemonSession>,
    /// Retry for observation requests that failed to connect.
    read_retry: RetryPolicy,
}

impl DaemonClient {
    pub fn new(provisioner: Provisioner) -> Self {
        Self::with_http(provisioner, reqwest::Client::new())
    }

    pub fn with_http(provisioner: Provisioner, http: reqwest::Client) -> Self {
        Self {
            provisioner,
            http,
            session: None,
            read_retry: RetryPolicy::new(3, Duration::from_millis(200), Duration::from_secs(10)),
        }
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    pub fn session(&self) -> Option<&DaemonSession> {
        self.session.as_ref()
    }

    /// Provision the machine and wait until its daemon answers `/health`.
    ///
    /// On failure the backend resource is torn down before returning.
    pub async fn start(&mut self) -> Result<&DaemonSession, ClientError> {
        let provisioned = self.provisioner.setup().await?;
        let session = DaemonSession {
            base_url: provisioned.endpoint.base_url(),
            endpoint: provisioned.endpoint,
            token: self.provisioner.token().to_string(),
        };

        if let Err(err) = self.wait_for_daemon(&session).await {
            tracing::warn!(endpoint = %session.endpoint, error = %err, "daemon never became ready, tearing down");
            if let Err(teardown) = self.provisioner.teardown().await {
                tracing::error!(error = %teardown, "teardown after failed start failed");
            }
            return Err(err);
        }

        tracing::info!(endpoint = %session.endpoint, "daemon session ready");
        let session = self.session.insert(session);
        Ok(&*session)
    }

    async fn wait_for_daemon(&self, session: &DaemonSession) -> Result<(), ClientError> {
        let url = session.url("/health");
        let rejected = AtomicBool::new(false);
        let policy = self.provisioner.readiness_policy();

        let result = policy
            .run("daemon health check", || {
                let request = self
                    .http
                    .get(&url)
                    .bearer_auth(&session.token)
                    .timeout(HEALTH_TIMEOUT);
                let endpoint = session.endpoint.clone();
                let rejected = &rejected;
                async move {
                    let response = request.send().await.map_err(|e| ProvisionError::Unreachable {
                        endpoint: endpoint.clone(),
                        message: e.to_string(),
                    })?;
                    match response.status() {
                        status if status.is_success() => Ok(()),
                        StatusCode::UNAUTHORIZED => {
                            rejected.store(true, Ordering::SeqCst);
                            Err(ProvisionError::Config("daemon rejected the session token".into()))
                        }
                        status => Err(ProvisionError::Unreachable {
                            endpoint,
                            message: format!("health check returned {status}"),
                        }),
                    }
                }
            })
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(_) if rejected.load(Ordering::SeqCst) => Err(ClientError::Authentication {
                endpoint: session.endpoint.clone(),
            }),
            Err(err) => Err(ClientError::Unreachable {
                endpoint: session.endpoint.clone(),
                source: err.into(),
            }),
        }
    }

    /// Drop the session and tear the backend down.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        self.session = None;
        self.provisioner.teardown().await?;
        Ok(())
    }

    fn active(&self) -> Result<&DaemonSession, ClientError> {
        self.session.as_ref().ok_or(ClientError::NotStarted)
    }

    async fn decode<T: DeserializeOwned>(
        &self,
        path: &str,
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Authentication {
                endpoint: self.active()?.endpoint.clone(),
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map(|b| b.error)
                .unwrap_or(text);
            return Err(ClientError::Api {
                path: path.to_string(),
                status: status.as_u16(),
                message,
            });
        }
        response.json().await.map_err(|source| ClientError::Http {
            path: path.to_string(),
            source,
        })
    }

    /// Actions change machine state, so they are sent exactly once.
    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<ActionResponse, ClientError> {
        let session = self.active()?;
        let mut request = self.http.post(session.url(path)).bearer_auth(&session.token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|source| ClientError::Http {
            path: path.to_string(),
            source,
        })?;
        self.decode(path, response).await
    }

    async fn action<B: Serialize>(&self, path: &str, body: &B) -> Result<ActionResponse, ClientError> {
        self.post(path, Some(body)).await
    }

    async fn trigger(&self, path: &str) -> Result<ActionResponse, ClientError> {
        self.post::<()>(path, None).await
    }

    /// Reads are retried under `read_retry` when the connection itself
    /// failed; any other transport error is returned at once.
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let session = self.active()?;
        let url = session.url(path);
        let sent = self
            .read_retry
            .run(path, || {
                let request = self.http.get(&url).bearer_auth(&session.token);
                let endpoint = session.endpoint.clone();
                async move {
                    match request.send().await {
                        Err(err) if err.is_connect() => Err(ProvisionError::Unreachable {
                            endpoint,
                            message: err.to_string(),
                        }),
                        other => Ok(other),
                    }
                }
            })
            .await;

        match sent {
            Ok(Ok(response)) => self.decode(path, response).await,
            Ok(Err(source)) => Err(ClientError::Http {
                path: path.to_string(),
                source,
            }),
            Err(err) => Err(ClientError::Unreachable {
                endpoint: session.endpoint.clone(),
                source: err.into(),
            }),
        }
    }

    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        self.get("/health").await
    }

    pub async fn reset(&self) -> Result<ActionResponse, ClientError> {
        self.trigger("/reset").await
    }

    pub async fn screenshot(&self) -> Result<ScreenshotObservation, ClientError> {
        self.get("/observation/screenshot").await
    }

    pub async fn mouse_state(&self) -> Result<MouseStateObservation, ClientError> {
        self.get("/observation/mouse_state").await
    }

    pub async fn keyboard_state(&self) -> Result<KeyboardStateObservation, ClientError> {
        self.get("/observation/keyboard_state").await
    }

    pub async fn observation(&self) -> Result<Observation, ClientError> {
        self.get("/observation").await
    }

    pub async fn command(
        &self,
        command: impl Into<String>,
        timeout: Option<f64>,
    ) -> Result<ActionResponse, ClientError> {
        let body = CommandAction {
            command: command.into(),
            timeout,
        };
        self.action("/execute/command", &body).await
    }

    pub async fn key_down(&self, key: KeyboardKey) -> Result<ActionResponse, ClientError> {
        self.action("/execute/keyboard/key_down", &KeyDownAction { key })
            .await
    }

    pub async fn key_up(&self, key: KeyboardKey) -> Result<ActionResponse, ClientError> {
        self.action("/execute/keyboard/key_up", &KeyUpAction { key })
            .await
    }

    pub async fn key_press(&self, key: KeyboardKey, duration: f64) -> Result<ActionResponse, ClientError> {
        self.action("/execute/keyboard/key_press", &KeyPressAction { key, duration })
            .await
    }

    pub async fn hotkey(&self, keys: Vec<KeyboardKey>) -> Result<ActionResponse, ClientError> {
        self.action("/execute/keyboard/hotkey", &HotkeyAction { keys })
            .await
    }

    pub async fn type_text(&self, text: impl Into<String>) -> Result<ActionResponse, ClientError> {
        let body = TypeAction { text: text.into() };
        self.action("/execute/type", &body).await
    }

    pub async fn mouse_move(&self, x: i32, y: i32, move_duration: f64) -> Result<ActionResponse, ClientError> {
        let body = MouseMoveAction { x, y, move_duration };
        self.action("/execute/mouse/move", &body).await
    }

    pub async fn mouse_scroll(&self, amount: f64) -> Result<ActionResponse, ClientError> {
        self.action("/execute/mouse/scroll", &MouseScrollAction { amount })
            .await
    }

    pub async fn mouse_down(&self, button: MouseButton) -> Result<ActionResponse, ClientError> {
        self.action("/execute/mouse/button_down", &MouseButtonAction { button })
            .await
    }

    pub async fn mouse_up(&self, button: MouseButton) -> Result<ActionResponse, ClientError> {
        self.action("/execute/mouse/button_up", &MouseButtonAction { button })
            .await
    }

    pub async fn start_vnc(&self) -> Result<ActionResponse, ClientError> {
        self.trigger("/vnc/start").await
    }

    pub async fn stop_vnc(&self) -> Result<ActionResponse, ClientError> {
        self.trigger("/vnc/stop").await
    }

    pub async fn start_rdp(&self) -> Result<ActionResponse, ClientError> {
        self.trigger("/rdp/start").await
    }

    pub async fn stop_rdp(&self) -> Result<ActionResponse, ClientError> {
        self.trigger("/rdp/stop").await
    }
}
