use crate::auth::Authenticator;
use crate::services::RelayService;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub relay: RelayService,
    pub authenticator: Arc<dyn Authenticator>,
}
