pub mod apps;
pub mod jobs;
pub mod layout;
pub mod results;
pub mod settings;

use std::sync::Arc;

use crate::cache::progress::ProgressStore;

/// Store handles shared by the controllers
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn jobs::JobStore>,
    pub results: Arc<dyn results::ResultStore>,
    pub apps: Arc<dyn apps::AppRegistry>,
    pub progress: Arc<dyn ProgressStore>,
}
