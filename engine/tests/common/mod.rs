//! In-process fakes of the external systems and a wired-up engine for integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use release_engine::adapters::build_server::{BuildServer, FlowStage, FlowStatus, QueueItem, StageFlow};
use release_engine::adapters::cluster::{ClusterApi, ClusterConnector, ClusterHandle, Resource};
use release_engine::adapters::registry::ImageRegistry;
use release_engine::adapters::remote::{ExecEvent, PlaybookRun, RemoteExecutor, TaskEvent, TaskOutcome};
use release_engine::build::controller::{BuildController, BuildOptions};
use release_engine::build::flow::FlowTimeouts;
use release_engine::cache::progress::InMemoryProgressStore;
use release_engine::deploy::descriptor::TemplateDescriptorProducer;
use release_engine::deploy::kubernetes::{KubernetesOptions, KubernetesOrchestrator};
use release_engine::deploy::remote_host::RemoteHostOrchestrator;
use release_engine::deploy::verify::{VerifyOptions, REVISION_ANNOTATION};
use release_engine::deploy::DeployController;
use release_engine::errors::ReleaseError;
use release_engine::models::app::AppModule;
use release_engine::models::build::{CommitDescriptor, RefKind};
use release_engine::notify::{Notice, Notifier, NotifyHub};
use release_engine::poll::PollPolicy;
use release_engine::storage::apps::InMemoryAppRegistry;
use release_engine::storage::jobs::InMemoryJobStore;
use release_engine::storage::results::InMemoryResultStore;
use release_engine::storage::Stores;
use release_engine::workers::queue::{self, TaskQueue, TaskReceiver};

// =============================== BUILD SERVER ================================== //

#[derive(Default)]
struct BuildServerState {
    configs: HashMap<String, String>,
    creates: u32,
    reconfigs: u32,
    busy: bool,
    submissions: Vec<(String, Vec<(String, String)>)>,
    next_queue: u64,
    build_number: Option<u64>,
    bind_after: u32,
    queue_polls: u32,
    flows: VecDeque<StageFlow>,
    stops: Vec<(String, u64)>,
}

/// Build server that binds queue items and replays a scripted flow sequence
pub struct FakeBuildServer {
    state: Mutex<BuildServerState>,
}

impl FakeBuildServer {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BuildServerState {
                next_queue: 100,
                build_number: Some(7),
                ..Default::default()
            }),
        }
    }

    /// Flows returned one per read; the last one repeats
    pub fn set_flows(&self, flows: Vec<StageFlow>) {
        self.state.lock().unwrap().flows = flows.into();
    }

    pub fn set_busy(&self, busy: bool) {
        self.state.lock().unwrap().busy = busy;
    }

    /// Queue reads answered without a build number before binding
    pub fn set_bind_after(&self, polls: u32) {
        self.state.lock().unwrap().bind_after = polls;
    }

    pub fn set_build_number(&self, number: Option<u64>) {
        self.state.lock().unwrap().build_number = number;
    }

    pub fn submissions(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn creates(&self) -> u32 {
        self.state.lock().unwrap().creates
    }

    pub fn reconfigs(&self) -> u32 {
        self.state.lock().unwrap().reconfigs
    }

    pub fn queue_polls(&self) -> u32 {
        self.state.lock().unwrap().queue_polls
    }

    pub fn stops(&self) -> Vec<(String, u64)> {
        self.state.lock().unwrap().stops.clone()
    }

    pub fn set_config(&self, name: &str, config: &str) {
        self.state
            .lock()
            .unwrap()
            .configs
            .insert(name.to_string(), config.to_string());
    }
}

#[async_trait]
impl BuildServer for FakeBuildServer {
    async fn job_config(&self, name: &str) -> Result<Option<String>, ReleaseError> {
        Ok(self.state.lock().unwrap().configs.get(name).cloned())
    }

    async fn create_job(&self, name: &str, config: &str) -> Result<(), ReleaseError> {
        let mut state = self.state.lock().unwrap();
        state.creates += 1;
        state.configs.insert(name.to_string(), config.to_string());
        Ok(())
    }

    async fn reconfig_job(&self, name: &str, config: &str) -> Result<(), ReleaseError> {
        let mut state = self.state.lock().unwrap();
        state.reconfigs += 1;
        state.configs.insert(name.to_string(), config.to_string());
        Ok(())
    }

    async fn is_busy(&self, name: &str) -> Result<bool, ReleaseError> {
        let state = self.state.lock().unwrap();
        if state.busy {
            return Ok(true);
        }
        if !state.configs.contains_key(name) {
            return Err(ReleaseError::NotFound(name.to_string()));
        }
        Ok(false)
    }

    async fn build_job(&self, name: &str, params: &[(String, String)]) -> Result<u64, ReleaseError> {
        let mut state = self.state.lock().unwrap();
        state.submissions.push((name.to_string(), params.to_vec()));
        state.next_queue += 1;
        Ok(state.next_queue)
    }

    async fn queue_item(&self, _queue: u64) -> Result<QueueItem, ReleaseError> {
        let mut state = self.state.lock().unwrap();
        state.queue_polls += 1;
        if state.queue_polls <= state.bind_after {
            return Ok(QueueItem {
                why: Some("Waiting for next available executor".to_string()),
                ..Default::default()
            });
        }
        Ok(QueueItem {
            build_number: state.build_number,
            ..Default::default()
        })
    }

    async fn stage_flow(&self, _name: &str, _number: u64) -> Result<StageFlow, ReleaseError> {
        let mut state = self.state.lock().unwrap();
        if state.flows.len() > 1 {
            if let Some(flow) = state.flows.pop_front() {
                return Ok(flow);
            }
        }
        Ok(state
            .flows
            .front()
            .cloned()
            .unwrap_or_else(StageFlow::not_executed))
    }

    async fn console_text(&self, name: &str, number: u64) -> Result<String, ReleaseError> {
        Ok(format!("Started {}#{}\nFinished", name, number))
    }

    async fn stop(&self, name: &str, number: u64) -> Result<(), ReleaseError> {
        self.state.lock().unwrap().stops.push((name.to_string(), number));
        Ok(())
    }
}

pub fn flow(status: FlowStatus, stages: &[(&str, FlowStatus)]) -> StageFlow {
    StageFlow {
        status,
        stages: stages
            .iter()
            .map(|(name, status)| FlowStage {
                name: name.to_string(),
                status: status.clone(),
                duration_millis: 250,
            })
            .collect(),
    }
}

pub fn success_flow() -> StageFlow {
    flow(
        FlowStatus::Success,
        &[
            ("checkout", FlowStatus::Success),
            ("build", FlowStatus::Success),
            ("push", FlowStatus::Success),
        ],
    )
}

// ================================= CLUSTER ===================================== //

/// Cluster that rolls every applied deployment out at once
pub struct FakeCluster {
    objects: Mutex<HashMap<String, Value>>,
    revision: AtomicU64,
    running_tag: Mutex<Option<String>>,
    fail_apply: AtomicBool,
    creates: AtomicU32,
}

fn object_key(resource: Resource, namespace: &str, name: &str) -> String {
    format!("{:?}/{}/{}", resource, namespace, name)
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            objects: Mutex::new(HashMap::new()),
            revision: AtomicU64::new(0),
            running_tag: Mutex::new(None),
            fail_apply: AtomicBool::new(false),
            creates: AtomicU32::new(0),
        })
    }

    /// Reject every deployment write
    pub fn failing_apply() -> Arc<Self> {
        let cluster = Self::new();
        cluster.fail_apply.store(true, Ordering::SeqCst);
        cluster
    }

    /// Replica sets report `tag` whatever was applied
    pub fn running(tag: &str) -> Arc<Self> {
        let cluster = Self::new();
        *cluster.running_tag.lock().unwrap() = Some(tag.to_string());
        cluster
    }

    pub fn creates(&self) -> u32 {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn object(&self, resource: Resource, namespace: &str, name: &str) -> Option<Value> {
        self.objects
            .lock()
            .unwrap()
            .get(&object_key(resource, namespace, name))
            .cloned()
    }

    fn write(&self, resource: Resource, namespace: &str, name: &str, body: &Value) -> Result<(), ReleaseError> {
        let mut body = body.clone();
        if resource == Resource::Deployment {
            if self.fail_apply.load(Ordering::SeqCst) {
                return Err(ReleaseError::Cluster("admission webhook denied the request".to_string()));
            }
            let rev = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
            body["metadata"]["annotations"][REVISION_ANNOTATION] = json!(rev.to_string());
            body["metadata"]["resourceVersion"] = json!(format!("rv{}", rev));
        }
        self.objects
            .lock()
            .unwrap()
            .insert(object_key(resource, namespace, name), body);
        Ok(())
    }

    fn deployments(&self, namespace: &str) -> Vec<Value> {
        let prefix = format!("{:?}/{}/", Resource::Deployment, namespace);
        self.objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, value)| value.clone())
            .collect()
    }

    fn replica_set(&self, deployment: &Value) -> Value {
        let mut image = deployment["spec"]["template"]["spec"]["containers"][0]["image"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        if let Some(tag) = self.running_tag.lock().unwrap().clone() {
            let repo = image.rsplit_once(':').map(|(repo, _)| repo.to_string()).unwrap_or(image);
            image = format!("{}:{}", repo, tag);
        }
        json!({
            "metadata": {
                "name": format!("{}-rs", deployment["metadata"]["name"].as_str().unwrap_or_default()),
                "annotations": {
                    REVISION_ANNOTATION: deployment["metadata"]["annotations"][REVISION_ANNOTATION],
                },
            },
            "spec": {
                "selector": { "matchLabels": deployment["spec"]["selector"]["matchLabels"] },
                "template": { "spec": { "containers": [{ "image": image }] } },
            },
            "status": {
                "availableReplicas": 1,
                "fullyLabeledReplicas": 1,
                "readyReplicas": 1,
            },
        })
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get(&self, resource: Resource, namespace: &str, name: &str) -> Result<Option<Value>, ReleaseError> {
        Ok(self.object(resource, namespace, name))
    }

    async fn create(&self, resource: Resource, namespace: &str, body: &Value) -> Result<(), ReleaseError> {
        let name = body["metadata"]["name"].as_str().unwrap_or_default().to_string();
        self.write(resource, namespace, &name, body)?;
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn replace(
        &self,
        resource: Resource,
        namespace: &str,
        name: &str,
        body: &Value,
    ) -> Result<(), ReleaseError> {
        self.write(resource, namespace, name, body)
    }

    async fn patch(
        &self,
        resource: Resource,
        namespace: &str,
        name: &str,
        body: &Value,
    ) -> Result<(), ReleaseError> {
        self.write(resource, namespace, name, body)
    }

    async fn list(&self, resource: Resource, namespace: &str, _label_selector: &str) -> Result<Vec<Value>, ReleaseError> {
        let deployments = self.deployments(namespace);
        Ok(match resource {
            Resource::ReplicaSet => deployments.iter().map(|d| self.replica_set(d)).collect(),
            Resource::Pod => deployments
                .iter()
                .map(|d| {
                    json!({
                        "metadata": {
                            "name": format!("{}-pod", d["metadata"]["name"].as_str().unwrap_or_default()),
                        },
                        "status": {
                            "phase": "Running",
                            "containerStatuses": [{ "ready": true, "state": { "running": {} } }],
                        },
                    })
                })
                .collect(),
            _ => Vec::new(),
        })
    }
}

/// Registry that knows a fixed set of `project/repository:tag` references
pub struct FakeRegistry {
    tags: Mutex<HashSet<String>>,
    copies: Mutex<Vec<String>>,
}

impl FakeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tags: Mutex::new(HashSet::new()),
            copies: Mutex::new(Vec::new()),
        })
    }

    pub fn copies(&self) -> Vec<String> {
        self.copies.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageRegistry for FakeRegistry {
    fn host(&self) -> String {
        "harbor.prod.local".to_string()
    }

    async fn tag_exists(&self, project: &str, repository: &str, tag: &str) -> Result<bool, ReleaseError> {
        Ok(self
            .tags
            .lock()
            .unwrap()
            .contains(&format!("{}/{}:{}", project, repository, tag)))
    }

    async fn copy_tag(
        &self,
        from_project: &str,
        to_project: &str,
        repository: &str,
        tag: &str,
    ) -> Result<(), ReleaseError> {
        let copied = format!("{}/{}:{}", to_project, repository, tag);
        self.copies
            .lock()
            .unwrap()
            .push(format!("{}/{}:{} -> {}", from_project, repository, tag, copied));
        self.tags.lock().unwrap().insert(copied);
        Ok(())
    }

    fn docker_config(&self) -> Value {
        json!({ "auths": { "harbor.prod.local": { "auth": "cm9ib3Q6c2VjcmV0" } } })
    }
}

/// Resolves cluster ids to fakes; anything else is a configuration error
pub struct FakeConnector {
    clusters: HashMap<String, Arc<FakeCluster>>,
    registry: Arc<FakeRegistry>,
    registry_project: Option<String>,
}

impl FakeConnector {
    pub fn new(clusters: &[(&str, Arc<FakeCluster>)], registry: Arc<FakeRegistry>) -> Self {
        Self {
            clusters: clusters
                .iter()
                .map(|(id, cluster)| (id.to_string(), cluster.clone()))
                .collect(),
            registry,
            registry_project: Some("prod".to_string()),
        }
    }
}

#[async_trait]
impl ClusterConnector for FakeConnector {
    async fn connect(&self, cluster_id: &str) -> Result<ClusterHandle, ReleaseError> {
        let cluster = self
            .clusters
            .get(cluster_id)
            .ok_or_else(|| ReleaseError::ConfigInvalid(format!("unknown cluster {}", cluster_id)))?;
        Ok(ClusterHandle {
            id: cluster_id.to_string(),
            api: cluster.clone(),
            registry: self.registry.clone(),
            registry_project: self.registry_project.clone(),
        })
    }
}

// ============================== REMOTE EXECUTION =============================== //

/// Runs playbooks host by host, failing the configured hosts
pub struct FakeExecutor {
    failures: Mutex<HashMap<String, TaskOutcome>>,
    runs: Mutex<Vec<PlaybookRun>>,
}

impl FakeExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            failures: Mutex::new(HashMap::new()),
            runs: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_host(&self, host: &str, outcome: TaskOutcome) {
        self.failures.lock().unwrap().insert(host.to_string(), outcome);
    }

    pub fn heal(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn runs(&self) -> Vec<PlaybookRun> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn run(&self, run: PlaybookRun, events: mpsc::Sender<ExecEvent>) -> Result<(), ReleaseError> {
        self.runs.lock().unwrap().push(run.clone());
        let failures = self.failures.lock().unwrap().clone();

        for host in &run.hosts {
            let task = |outcome: TaskOutcome, msg: &str| {
                ExecEvent::Task(TaskEvent {
                    host: host.clone(),
                    task: "copy artifact".to_string(),
                    outcome,
                    msg: msg.to_string(),
                    output: Value::Null,
                })
            };
            if let Some(outcome) = failures.get(host) {
                let _ = events.send(task(*outcome, "non-zero return code")).await;
                return Ok(());
            }
            if events.send(task(TaskOutcome::Changed, "")).await.is_err() {
                return Ok(());
            }
            let _ = events.send(ExecEvent::HostDone(host.clone())).await;
        }
        Ok(())
    }
}

// ================================ NOTIFICATIONS ================================ //

#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notices: &[Notice]) -> Result<(), ReleaseError> {
        self.notices.lock().unwrap().extend_from_slice(notices);
        Ok(())
    }
}

// =================================== HARNESS =================================== //

pub fn commit(short_id: &str) -> CommitDescriptor {
    CommitDescriptor {
        kind: RefKind::Heads,
        name: "main".to_string(),
        short_id: short_id.to_string(),
    }
}

/// Timings short enough for real-time tests
pub fn fast_build_options() -> BuildOptions {
    BuildOptions {
        queue_bind: PollPolicy::fixed(5, Duration::from_millis(1)),
        flow: FlowTimeouts {
            interval: Duration::from_millis(1),
            queueing: Duration::from_millis(50),
            execution: Duration::from_millis(200),
        },
        progress_ttl: Duration::from_secs(60),
        timeout_cleanup: Duration::from_secs(60),
        artifact_retention: 3,
        callback_url: Some("http://engine.local/callbacks/build".to_string()),
        registry_host: "harbor.local".to_string(),
        pipeline_repo: "https://git.local/ci/pipelines.git".to_string(),
        credentials_id: "git-ci".to_string(),
        script_path: "Jenkinsfile".to_string(),
    }
}

pub fn fast_verify_options() -> VerifyOptions {
    VerifyOptions {
        attempts: 3,
        interval: Duration::from_millis(1),
        revision_attempts: 2,
        revision_interval: Duration::from_millis(1),
    }
}

/// Engine wired to fakes. The queue is not drained unless a test calls
/// `drain_queue`; most tests drive `BuildController::follow` and
/// `DeployController::run` themselves.
pub struct Harness {
    pub stores: Stores,
    pub queue: TaskQueue,
    receiver: Option<TaskReceiver>,
    pub build_server: Arc<FakeBuildServer>,
    pub executor: Arc<FakeExecutor>,
    pub registry: Arc<FakeRegistry>,
    pub notifier: Arc<RecordingNotifier>,
    pub builds: Arc<BuildController>,
    pub deploys: DeployController,
}

impl Harness {
    pub fn new(apps: Vec<AppModule>, clusters: &[(&str, Arc<FakeCluster>)]) -> Self {
        Self::with_options(apps, clusters, fast_build_options())
    }

    pub fn with_options(
        apps: Vec<AppModule>,
        clusters: &[(&str, Arc<FakeCluster>)],
        build_options: BuildOptions,
    ) -> Self {
        let apps = Arc::new(InMemoryAppRegistry::new(apps));
        let stores = Stores {
            jobs: Arc::new(InMemoryJobStore::new()),
            results: Arc::new(InMemoryResultStore::new()),
            apps: apps.clone(),
            progress: Arc::new(InMemoryProgressStore::new(1_000)),
        };
        let (queue, receiver) = TaskQueue::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let notify = Arc::new(NotifyHub::new(notifier.clone(), queue.clone(), Duration::from_millis(10)));

        let registry = FakeRegistry::new();
        let executor = FakeExecutor::new();
        let descriptors = Arc::new(TemplateDescriptorProducer::new(None));
        let kubernetes = Arc::new(KubernetesOrchestrator::new(
            Arc::new(FakeConnector::new(clusters, registry.clone())),
            descriptors.clone(),
            apps.clone(),
            KubernetesOptions {
                force_replace: true,
                verify: fast_verify_options(),
            },
        ));
        let remote_host = Arc::new(RemoteHostOrchestrator::new(executor.clone(), descriptors, apps));
        let deploys = DeployController::new(
            stores.clone(),
            queue.clone(),
            notify.clone(),
            kubernetes,
            remote_host,
            Duration::from_secs(60),
        );

        let build_server = Arc::new(FakeBuildServer::new());
        let builds = Arc::new(
            BuildController::new(build_server.clone(), stores.clone(), queue.clone(), notify, build_options)
                .with_handoff(Arc::new(deploys.clone())),
        );

        Self {
            stores,
            queue,
            receiver: Some(receiver),
            build_server,
            executor,
            registry,
            notifier,
            builds,
            deploys,
        }
    }

    /// Run queued and scheduled tasks in the background
    pub fn drain_queue(&mut self) {
        if let Some(receiver) = self.receiver.take() {
            tokio::spawn(async move {
                queue::run(&queue::Options::default(), receiver, Box::pin(std::future::pending::<()>())).await
            });
        }
    }
}
