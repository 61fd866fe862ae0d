//! Application configuration options

use std::time::Duration;

use crate::progress::watcher;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::workers::{queue, sweeper};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage configuration
    pub storage: StorageOptions,

    /// Enable the HTTP server
    pub enable_server: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Task queue worker options
    pub queue_worker: queue::Options,

    /// Progress sweeper options
    pub sweeper: sweeper::Options,

    /// Progress watcher options
    pub watcher: watcher::Options,

    /// Adapter, module and timing configuration
    pub settings: Settings,
}

impl AppOptions {
    pub fn from_settings(settings: Settings) -> Self {
        Self {
            storage: StorageOptions {
                layout: StorageLayout::new(&settings.data_dir),
                ..Default::default()
            },
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            watcher: watcher::Options::from_timing(&settings.timing),
            settings,
            ..Default::default()
        }
    }
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            storage: StorageOptions::default(),
            enable_server: true,
            server: ServerOptions::default(),
            queue_worker: queue::Options::default(),
            sweeper: sweeper::Options::default(),
            watcher: watcher::Options::default(),
            settings: Settings::default(),
        }
    }
}

/// Lifecycle options for the engine
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Storage configuration options
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Storage layout paths
    pub layout: StorageLayout,

    /// Maximum live progress entries
    pub progress_capacity: usize,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            layout: StorageLayout::default(),
            progress_capacity: 10_000,
        }
    }
}

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8700,
        }
    }
}
