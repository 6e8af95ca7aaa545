use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::HardwareAdapter;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub adapter: Arc<dyn HardwareAdapter>,
}

impl AppContext {
    pub fn new(config: AppConfig, adapter: Arc<dyn HardwareAdapter>) -> Self {
        Self {
            config: Arc::new(config),
            adapter,
        }
    }
}
