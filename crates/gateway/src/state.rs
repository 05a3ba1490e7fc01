//! Shared application state passed to all API handlers.

use std::sync::Arc;

use arbor_domain::secrets::SecretBox;

use crate::cli::GatewayConfig;
use crate::manager::UserManager;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub users: Arc<UserManager>,
    pub secrets: SecretBox,
}

impl AppState {
    pub fn new(config: GatewayConfig, secrets: SecretBox) -> Self {
        let users = Arc::new(UserManager::new(
            config.user_timeout,
            config.data_dir.clone(),
            secrets.clone(),
        ));
        Self {
            config: Arc::new(config),
            users,
            secrets,
        }
    }
}
