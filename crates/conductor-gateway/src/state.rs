use std::sync::Arc;

use conductor_core::Coordinator;

#[derive(Clone)]
pub struct GatewayState {
    pub coordinator: Arc<Coordinator>,
    pub keepalive_secs: u64,
}
