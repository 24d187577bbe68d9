use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::notification::NotificationService;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub service: NotificationService,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(settings: Settings, service: NotificationService) -> Self {
        Self {
            settings: Arc::new(settings),
            service,
            start_time: Instant::now(),
        }
    }
}
