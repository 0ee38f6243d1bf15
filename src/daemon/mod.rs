//! The control-plane server that runs inside a provisioned machine.

pub mod auth;
pub mod computer;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod side_channel;

use std::sync::Arc;

use axum::Router;

use auth::AuthConfig;
use computer::Computer;
use side_channel::{DaemonSettings, ExecutableLocator, PathLocator, SideChannel, ViewerKind};

#[derive(Clone)]
pub struct DaemonState {
    pub computer: Arc<dyn Computer>,
    pub vnc: Arc<SideChannel>,
    pub rdp: Arc<SideChannel>,
    pub auth: AuthConfig,
}

impl DaemonState {
    pub fn new(computer: Arc<dyn Computer>, settings: DaemonSettings, token: impl Into<String>) -> Self {
        Self::with_locator(computer, settings, token, Arc::new(PathLocator))
    }

    pub fn with_locator(
        computer: Arc<dyn Computer>,
        settings: DaemonSettings,
        token: impl Into<String>,
        locator: Arc<dyn ExecutableLocator>,
    ) -> Self {
        Self {
            computer,
            vnc: Arc::new(SideChannel::new(ViewerKind::Vnc, settings.vnc, locator.clone())),
            rdp: Arc::new(SideChannel::new(ViewerKind::Rdp, settings.rdp, locator)),
            auth: AuthConfig::new(token),
        }
    }
}

pub fn create_app(state: DaemonState) -> Router {
    routes::build_router(state)
}
