//! Application state: stores, adapters and controllers wired together

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::adapters::build_server::JenkinsClient;
use crate::adapters::cluster::SettingsConnector;
use crate::adapters::remote::AnsibleRunner;
use crate::app::options::AppOptions;
use crate::build::controller::{BuildController, BuildOptions};
use crate::cache::progress::InMemoryProgressStore;
use crate::deploy::descriptor::TemplateDescriptorProducer;
use crate::deploy::kubernetes::{KubernetesOptions, KubernetesOrchestrator};
use crate::deploy::remote_host::RemoteHostOrchestrator;
use crate::deploy::verify::VerifyOptions;
use crate::deploy::DeployController;
use crate::errors::ReleaseError;
use crate::notify::{LogNotifier, Notifier, NotifyHub, WebhookNotifier};
use crate::service::ReleaseService;
use crate::storage::apps::InMemoryAppRegistry;
use crate::storage::jobs::FileJobStore;
use crate::storage::results::FileResultStore;
use crate::storage::Stores;
use crate::workers::queue::{TaskQueue, TaskReceiver};

/// Main application state
pub struct AppState {
    /// Store handles
    pub stores: Stores,

    /// Background task queue
    pub queue: TaskQueue,

    /// Build and deploy surface
    pub service: Arc<ReleaseService>,
}

impl AppState {
    /// Build the state; the queue receiver goes to the queue worker
    pub async fn init(options: &AppOptions) -> Result<(AppState, TaskReceiver), ReleaseError> {
        let settings = &options.settings;
        let layout = &options.storage.layout;
        layout.setup().await?;

        let apps = Arc::new(InMemoryAppRegistry::load(settings.apps.clone(), layout.apps_file()).await?);
        let stores = Stores {
            jobs: Arc::new(FileJobStore::load(layout.clone()).await?),
            results: Arc::new(FileResultStore::new(layout.clone())),
            apps: apps.clone(),
            progress: Arc::new(InMemoryProgressStore::new(options.storage.progress_capacity)),
        };
        info!("Loaded {} application module(s)", settings.apps.len());

        let (queue, receiver) = TaskQueue::new();

        let sink: Arc<dyn Notifier> = match &settings.notify.webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url)?),
            None => Arc::new(LogNotifier),
        };
        let notify = Arc::new(NotifyHub::new(
            sink,
            queue.clone(),
            Duration::from_secs(settings.notify.merge_delay_secs),
        ));

        let descriptors = Arc::new(TemplateDescriptorProducer::new(settings.descriptor_dir.clone()));
        let kubernetes = Arc::new(KubernetesOrchestrator::new(
            Arc::new(SettingsConnector::new(
                settings.clusters.clone(),
                settings.registry.clone(),
            )),
            descriptors.clone(),
            apps.clone(),
            KubernetesOptions {
                force_replace: settings.force_replace,
                verify: VerifyOptions::from_timing(&settings.timing),
            },
        ));
        let remote_host = Arc::new(RemoteHostOrchestrator::new(
            Arc::new(AnsibleRunner::new(
                settings.remote.program.clone(),
                settings.remote.playbook_dir.clone(),
            )),
            descriptors,
            apps,
        ));

        let deploys = DeployController::new(
            stores.clone(),
            queue.clone(),
            notify.clone(),
            kubernetes,
            remote_host,
            settings.timing.progress_ttl(),
        );

        let build_server = Arc::new(JenkinsClient::new(
            &settings.build_server.base_url,
            &settings.build_server.user,
            &settings.build_server.token,
        )?);
        let builds = Arc::new(
            BuildController::new(
                build_server,
                stores.clone(),
                queue.clone(),
                notify,
                BuildOptions::from_settings(settings),
            )
            .with_handoff(Arc::new(deploys.clone())),
        );
        let resumed = builds.resume().await?;
        if resumed > 0 {
            info!("Following {} build(s) left in progress", resumed);
        }

        let service = Arc::new(ReleaseService::new(
            builds,
            deploys,
            stores.clone(),
            options.watcher.clone(),
        ));

        Ok((
            AppState {
                stores,
                queue,
                service,
            },
            receiver,
        ))
    }
}
