use crate::{
    config::Config,
    websocket::{Gateway, RealtimeHub},
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<RealtimeHub>,
    pub gateway: Arc<Gateway>,
    pub config: Arc<Config>,
}
