// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Service Runtime Lifecycle
//!
//! The orchestrator-facing state machine for one service instance. Each
//! operation locks the runtime, checks the transition, does its work against
//! an [`ExecutionEnvironment`] and publishes a [`LifecycleEvent`].
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Load / Init / Start / Stop / Reset / Destroy / Test over a
//!   native or container execution environment
//! - **Concurrency:** one async mutex per runtime; hot-reload restarts take
//!   the same lock, so they queue behind an in-flight Start or Stop
//!
//! # Filesystem layout
//!
//! ```text
//! <root>/service.yaml            endpoints (read at every Load)
//! <root>/src/pyproject.toml      installer manifest
//! <root>/openapi/                generated schema artifacts
//! <root>/.cache/local/           fingerprints for the native scope
//! <root>/.cache/container/       fingerprints and venv for the container scope
//! ```

use crate::application::reload::{spawn_reload_loop, RestartHandler};
use crate::application::supervisor::{ProcessSupervisor, StartOutcome};
use crate::domain::agent_config::AgentConfigSpec;
use crate::domain::env::{filter_configurations, Configuration, EnvironmentVariables, PREFIX, RUNNING_KEY};
use crate::domain::events::{InstallVerb, LifecycleEvent};
use crate::domain::lifecycle::{AgentError, LifecycleState, Phase};
use crate::domain::network::{find_instance, NetworkInstance, NetworkMapping, NetworkScope};
use crate::domain::requests::{
    InitRequest, InitResponse, Information, LoadRequest, LoadResponse, StartRequest, TestResult,
};
use crate::domain::runtime::{
    ExecutionEnvironment, ExecutionScope, Mount, OutputSink, PortBinding, ProcessOutput, ProcessSpec,
    RuntimeError, TracingOutputSink,
};
use crate::domain::service::{find_rest_endpoint, Endpoint, ServiceIdentity, ServiceManifest, Visibility};
use crate::domain::watch::{ChangeEvent, ChangeFilter};
use crate::infrastructure::environment_factory::EnvironmentFactory;
use crate::infrastructure::event_bus::{EventBus, EventReceiver};
use crate::infrastructure::fingerprint::{DependencySet, FingerprintCache, FingerprintStatus};
use crate::infrastructure::watcher::{self, WatchSubscription};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

/// Fingerprint set guarding the package installer
pub const DEPENDENCIES_SET: &str = "dependencies";
/// Fingerprint set guarding schema generation
pub const API_SET: &str = "api";
/// Writable schema output directory inside the container
pub const SCHEMA_OUTPUT_TARGET: &str = "/schema-out";

const CHANGE_CHANNEL_CAPACITY: usize = 16;

/// State bound at Load
#[derive(Clone)]
struct LoadedService {
    identity: ServiceIdentity,
    endpoints: Vec<Endpoint>,
    rest: Endpoint,
    environment: String,
    sink: Arc<dyn OutputSink>,
}

/// State bound at Init, kept so Start can rebuild the environment after Stop
#[derive(Debug, Clone)]
struct Binding {
    scope: ExecutionScope,
    instance: NetworkInstance,
    vars: EnvironmentVariables,
    own_mappings: Vec<NetworkMapping>,
}

struct ServicePaths {
    source: PathBuf,
    cache_base: PathBuf,
    schema: PathBuf,
    manifest: PathBuf,
}

impl ServicePaths {
    fn new(identity: &ServiceIdentity, config: &AgentConfigSpec) -> Self {
        Self {
            source: identity.local(&config.runtime.source_dir),
            cache_base: identity.local(&config.runtime.cache_dir),
            schema: identity.local(&config.schema.artifact_dir),
            manifest: identity.local(&config.runtime.service_manifest),
        }
    }

    /// Native and container installs never share a cache root
    fn cache(&self, scope: ExecutionScope) -> PathBuf {
        self.cache_base.join(scope.cache_dir_name())
    }

    fn venv(&self) -> PathBuf {
        self.cache(ExecutionScope::Container).join("venv")
    }
}

struct RuntimeState {
    lifecycle: LifecycleState,
    service: Option<LoadedService>,
    binding: Option<Binding>,
    environment: Option<Box<dyn ExecutionEnvironment>>,
    supervisor: ProcessSupervisor,
    server_spec: Option<ProcessSpec>,
    dependency_mappings: Vec<NetworkMapping>,
    watch: Option<WatchSubscription>,
    reload: Option<DropGuard>,
    /// Bumped at every teardown; restart requests from an older watch are dropped
    watch_generation: u64,
}

struct RuntimeInner {
    config: AgentConfigSpec,
    factory: Arc<dyn EnvironmentFactory>,
    event_bus: Arc<EventBus>,
    output: Option<Arc<dyn OutputSink>>,
    state: Mutex<RuntimeState>,
}

/// Lifecycle orchestrator for one service. Cheap to clone.
#[derive(Clone)]
pub struct ServiceRuntime {
    inner: Arc<RuntimeInner>,
}

impl ServiceRuntime {
    pub fn new(config: AgentConfigSpec, factory: Arc<dyn EnvironmentFactory>, event_bus: Arc<EventBus>) -> Self {
        Self::build(config, factory, event_bus, None)
    }

    /// Send process output to `sink` instead of `tracing`
    pub fn with_output_sink(
        config: AgentConfigSpec,
        factory: Arc<dyn EnvironmentFactory>,
        event_bus: Arc<EventBus>,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        Self::build(config, factory, event_bus, Some(sink))
    }

    fn build(
        config: AgentConfigSpec,
        factory: Arc<dyn EnvironmentFactory>,
        event_bus: Arc<EventBus>,
        output: Option<Arc<dyn OutputSink>>,
    ) -> Self {
        let supervisor = ProcessSupervisor::new(config.hot_reload.enabled, config.server.stop_grace());
        let state = RuntimeState {
            lifecycle: LifecycleState::Unloaded,
            service: None,
            binding: None,
            environment: None,
            supervisor,
            server_spec: None,
            dependency_mappings: Vec::new(),
            watch: None,
            reload: None,
            watch_generation: 0,
        };
        Self {
            inner: Arc::new(RuntimeInner { config, factory, event_bus, output, state: Mutex::new(state) }),
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.inner.event_bus.subscribe()
    }

    pub async fn state(&self) -> LifecycleState {
        self.inner.state.lock().await.lifecycle
    }

    pub async fn load(&self, request: LoadRequest) -> Result<LoadResponse, AgentError> {
        let mut state = self.inner.state.lock().await;
        let result = self.inner.load(&mut state, request);
        self.inner.report(&state, result)
    }

    pub async fn init(&self, request: InitRequest) -> Result<InitResponse, AgentError> {
        self.init_cancellable(request, &CancellationToken::new()).await
    }

    /// Init that kills the installer or schema generator when `cancel` fires
    pub async fn init_cancellable(
        &self,
        request: InitRequest,
        cancel: &CancellationToken,
    ) -> Result<InitResponse, AgentError> {
        let mut state = self.inner.state.lock().await;
        let result = self.inner.init(&mut state, request, cancel).await;
        self.inner.report(&state, result)
    }

    pub async fn start(&self, request: StartRequest) -> Result<(), AgentError> {
        self.start_cancellable(request, &CancellationToken::new()).await
    }

    pub async fn start_cancellable(&self, request: StartRequest, cancel: &CancellationToken) -> Result<(), AgentError> {
        let mut state = self.inner.state.lock().await;
        let result = self.inner.start(&mut state, request, cancel).await;
        self.inner.report(&state, result)
    }

    pub async fn stop(&self) -> Result<(), AgentError> {
        let mut state = self.inner.state.lock().await;
        let result = self.inner.stop(&mut state).await;
        self.inner.report(&state, result)
    }

    /// Stop, then drop the scope's caches and any persistent container.
    /// The service stays loaded.
    pub async fn reset(&self) -> Result<(), AgentError> {
        let mut state = self.inner.state.lock().await;
        let result = self.inner.reset(&mut state).await;
        self.inner.report(&state, result)
    }

    /// Reset, then forget the service entirely
    pub async fn destroy(&self) -> Result<(), AgentError> {
        let mut state = self.inner.state.lock().await;
        let result = self.inner.destroy(&mut state).await;
        self.inner.report(&state, result)
    }

    pub async fn test(&self) -> Result<TestResult, AgentError> {
        self.test_cancellable(&CancellationToken::new()).await
    }

    pub async fn test_cancellable(&self, cancel: &CancellationToken) -> Result<TestResult, AgentError> {
        let mut state = self.inner.state.lock().await;
        let result = self.inner.test(&mut state, cancel).await;
        self.inner.report(&state, result)
    }

    /// Hot-reload restart. Ignored unless the service is running.
    pub async fn restart(&self, changes: Vec<ChangeEvent>) {
        self.inner.restart(None, changes).await;
    }

    pub async fn information(&self) -> Information {
        let state = self.inner.state.lock().await;
        Information {
            identity: state.service.as_ref().map(|s| s.identity.clone()),
            state: state.lifecycle,
            scope: state.binding.as_ref().map(|b| b.scope),
            address: state.binding.as_ref().map(|b| b.instance.address()),
            process_id: state.supervisor.process_id(),
            running: state.supervisor.is_running().await,
            hot_reload: self.inner.config.hot_reload.enabled,
        }
    }
}

/// Forwards debounced change bursts to the runtime without keeping it alive
struct RuntimeRestartHandler {
    runtime: Weak<RuntimeInner>,
    generation: u64,
}

#[async_trait]
impl RestartHandler for RuntimeRestartHandler {
    async fn restart(&self, changes: Vec<ChangeEvent>) {
        match self.runtime.upgrade() {
            Some(runtime) => runtime.restart(Some(self.generation), changes).await,
            None => debug!("Runtime dropped, ignoring {} change(s)", changes.len()),
        }
    }
}

fn setup_failed(phase: Phase, path: &Path, error: std::io::Error) -> AgentError {
    AgentError::environment(phase, RuntimeError::SetupFailed(format!("{:?}: {}", path, error)))
}

impl RuntimeInner {
    fn publish(&self, event: LifecycleEvent) {
        self.event_bus.publish(event);
    }

    /// Log and publish a failed operation, passing the result through
    fn report<T>(&self, state: &RuntimeState, result: Result<T, AgentError>) -> Result<T, AgentError> {
        if let Err(error) = &result {
            let service = state.service.as_ref().map(|s| s.identity.unique()).unwrap_or_default();
            error!(service = %service, phase = %error.phase(), "{}", error);
            metrics::counter!("svcagent_operation_failures_total", "phase" => error.phase().to_string()).increment(1);
            self.publish(LifecycleEvent::OperationFailed {
                service,
                phase: error.phase(),
                error: error.to_string(),
                failed_at: Utc::now(),
            });
        }
        result
    }

    fn loaded(state: &RuntimeState, phase: Phase) -> Result<LoadedService, AgentError> {
        state
            .service
            .clone()
            .ok_or_else(|| AgentError::configuration(phase, "no service loaded"))
    }

    fn bound(state: &RuntimeState, phase: Phase) -> Result<Binding, AgentError> {
        state
            .binding
            .clone()
            .ok_or_else(|| AgentError::configuration(phase, "no network binding, Init has not completed"))
    }

    fn load(&self, state: &mut RuntimeState, request: LoadRequest) -> Result<LoadResponse, AgentError> {
        let phase = Phase::Load;
        state.lifecycle.ensure(phase)?;

        let identity = request.identity;
        if !identity.location.is_dir() {
            return Err(AgentError::configuration(
                phase,
                format!("service root {:?} does not exist", identity.location),
            ));
        }

        let mut endpoints = ServiceManifest::load_endpoints(&identity, &self.config.runtime.service_manifest)
            .map_err(|e| AgentError::service(phase, e))?;
        if request.make_public {
            for endpoint in &mut endpoints {
                endpoint.visibility = Visibility::Public;
            }
        }
        let rest = find_rest_endpoint(&identity.name, &endpoints).map_err(|e| AgentError::service(phase, e))?;

        let sink: Arc<dyn OutputSink> = match &self.output {
            Some(sink) => sink.clone(),
            None => Arc::new(TracingOutputSink::new(identity.unique())),
        };

        info!(service = %identity.unique(), endpoints = endpoints.len(), "Service loaded");
        self.publish(LifecycleEvent::Loaded {
            service: identity.unique(),
            endpoints: endpoints.len(),
            loaded_at: Utc::now(),
        });

        state.service = Some(LoadedService {
            identity,
            endpoints: endpoints.clone(),
            rest,
            environment: request.environment,
            sink,
        });
        state.binding = None;
        state.lifecycle = LifecycleState::Loaded;
        Ok(LoadResponse { endpoints })
    }

    async fn init(
        &self,
        state: &mut RuntimeState,
        request: InitRequest,
        cancel: &CancellationToken,
    ) -> Result<InitResponse, AgentError> {
        let phase = Phase::Init;
        state.lifecycle.ensure(phase)?;
        let service = Self::loaded(state, phase)?;

        // The previous environment holds the port this Init is about to bind
        if let Some(mut previous) = state.environment.take() {
            if let Err(e) = previous.shutdown().await {
                warn!(service = %service.identity.unique(), "Failed to release previous environment: {}", e);
            }
        }

        let scope = request
            .scope
            .or(self.config.runtime.default_scope)
            .unwrap_or_else(|| self.factory.probe_scope());

        // The host port is the one both scopes bind
        let instance = find_instance(&request.proposed_network_mappings, &service.rest, NetworkScope::Native)
            .map_err(|source| AgentError::Resolution { phase, source })?;

        let paths = ServicePaths::new(&service.identity, &self.config);
        let manifest = paths.source.join(&self.config.installer.manifest);
        if !manifest.is_file() {
            return Err(AgentError::configuration(
                phase,
                format!("installer manifest {:?} not found", manifest),
            ));
        }

        let own_mappings: Vec<NetworkMapping> = request
            .proposed_network_mappings
            .iter()
            .filter(|m| service.endpoints.iter().any(|e| e.same_identity(&m.endpoint)))
            .cloned()
            .collect();

        let mut vars = EnvironmentVariables::new();
        vars.extend(&self.config.runtime.env);
        if scope == ExecutionScope::Container {
            vars.extend(&self.config.container.env);
        }
        vars.add_identity(&service.identity);
        vars.add_environment(&service.environment);
        let mut configurations: Vec<Configuration> = request.configuration.into_iter().collect();
        configurations.extend(filter_configurations(&request.dependencies_configurations, scope));
        vars.add_configurations(&configurations);
        vars.add_endpoints(&own_mappings, scope);

        let binding = Binding { scope, instance, vars, own_mappings };
        info!(
            service = %service.identity.unique(),
            scope = %scope,
            address = %binding.instance.address(),
            "Initializing service"
        );

        let environment = self.build_environment(phase, &service, &binding).await?;
        if let Err(e) = self.prepare(phase, environment.as_ref(), &service, scope, cancel).await {
            Self::release(environment).await;
            return Err(e);
        }

        self.publish(LifecycleEvent::Initialized {
            service: service.identity.unique(),
            scope,
            address: binding.instance.address(),
            initialized_at: Utc::now(),
        });

        let response = InitResponse { scope, network_mappings: binding.own_mappings.clone() };
        state.environment = Some(environment);
        state.binding = Some(binding);
        state.lifecycle = LifecycleState::Initialized;
        Ok(response)
    }

    /// Create and initialize an environment. Nothing partially built is returned.
    async fn build_environment(
        &self,
        phase: Phase,
        service: &LoadedService,
        binding: &Binding,
    ) -> Result<Box<dyn ExecutionEnvironment>, AgentError> {
        let paths = ServicePaths::new(&service.identity, &self.config);
        let mut environment = self
            .factory
            .create(binding.scope, &service.identity)
            .map_err(|e| AgentError::environment(phase, e))?;
        environment.with_environment_variables(binding.vars.all());

        if environment.scope() == ExecutionScope::Container {
            let container = &self.config.container;
            let venv = paths.venv();
            for dir in [&venv, &paths.schema] {
                std::fs::create_dir_all(dir).map_err(|e| setup_failed(phase, dir, e))?;
            }
            let mounts = [
                Mount::new(paths.source.clone(), container.source_target.clone()),
                Mount::new(venv, container.venv_target.clone()),
                Mount::read_only(paths.schema.clone(), container.schema_target.clone()),
                Mount::new(paths.schema.clone(), SCHEMA_OUTPUT_TARGET),
                Mount::read_only(
                    paths.manifest.clone(),
                    format!("/svcagent/{}", self.config.runtime.service_manifest),
                ),
            ];
            for mount in mounts {
                environment.with_mount(mount).map_err(|e| AgentError::environment(phase, e))?;
            }
            let port = binding.instance.port;
            environment
                .with_port(PortBinding { container_port: port, host_port: port })
                .map_err(|e| AgentError::environment(phase, e))?;
        }

        if let Err(e) = environment.init().await {
            Self::release(environment).await;
            return Err(AgentError::environment(phase, e));
        }
        Ok(environment)
    }

    async fn release(mut environment: Box<dyn ExecutionEnvironment>) {
        if let Err(e) = environment.shutdown().await {
            warn!("Failed to release execution environment: {}", e);
        }
    }

    /// Run a command to completion, failing on a non-zero exit
    #[allow(clippy::too_many_arguments)]
    async fn run_command(
        &self,
        phase: Phase,
        environment: &dyn ExecutionEnvironment,
        binary: &str,
        args: &[String],
        extra_env: BTreeMap<String, String>,
        sink: &Arc<dyn OutputSink>,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, AgentError> {
        let spec = environment
            .new_process(binary, args)
            .map_err(|e| AgentError::environment(phase, e))?
            .with_envs(extra_env);
        info!(phase = %phase, "Running {}", spec.command_line());
        let output = environment
            .run(&spec, sink.clone(), cancel)
            .await
            .map_err(|e| AgentError::environment(phase, e))?;
        if !output.success() {
            return Err(AgentError::Command {
                phase,
                command: spec.command_line(),
                exit_code: output.exit_code,
                output: output.joined(),
            });
        }
        Ok(output)
    }

    fn persist(cache: &FingerprintCache, set: &DependencySet) {
        if let Err(e) = cache.update_cache(set) {
            warn!(set = %set.name, "Failed to persist fingerprint, next Init will redo the work: {}", e);
        }
    }

    /// Install dependencies and regenerate the schema when their inputs changed
    async fn prepare(
        &self,
        phase: Phase,
        environment: &dyn ExecutionEnvironment,
        service: &LoadedService,
        scope: ExecutionScope,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let paths = ServicePaths::new(&service.identity, &self.config);
        let cache = FingerprintCache::new(paths.cache(scope));
        let installer = &self.config.installer;

        let dependencies = DependencySet::new(DEPENDENCIES_SET, &paths.source)
            .with_pattern(installer.manifest.clone())
            .with_patterns(installer.include.clone());
        let status = cache.status(&dependencies);
        if status.is_stale() {
            let (verb, args) = match status {
                FingerprintStatus::Missing => (InstallVerb::Install, &installer.install_args),
                _ => (InstallVerb::Update, &installer.update_args),
            };
            let started = Instant::now();
            self.run_command(phase, environment, &installer.binary, args, BTreeMap::new(), &service.sink, cancel)
                .await?;
            Self::persist(&cache, &dependencies);

            let label = match verb {
                InstallVerb::Install => "install",
                InstallVerb::Update => "update",
            };
            metrics::counter!("svcagent_dependency_installs_total", "scope" => scope.to_string(), "verb" => label)
                .increment(1);
            self.publish(LifecycleEvent::DependenciesInstalled {
                service: service.identity.unique(),
                scope,
                verb,
                duration_ms: started.elapsed().as_millis() as u64,
                installed_at: Utc::now(),
            });
        } else {
            debug!(service = %service.identity.unique(), "Dependencies up to date");
        }

        let schema = &self.config.schema;
        if !schema.enabled {
            return Ok(());
        }
        let api = DependencySet::new(API_SET, &paths.source).with_patterns(schema.inputs.clone());
        if !cache.updated(&api) {
            debug!(service = %service.identity.unique(), "Schema up to date");
            return Ok(());
        }

        std::fs::create_dir_all(&paths.schema).map_err(|e| setup_failed(phase, &paths.schema, e))?;
        let output_dir = match environment.scope() {
            ExecutionScope::Native => paths.schema.to_string_lossy().to_string(),
            ExecutionScope::Container => SCHEMA_OUTPUT_TARGET.to_string(),
        };
        let extra = BTreeMap::from([(format!("{PREFIX}__SCHEMA_DIR"), output_dir)]);
        self.run_command(phase, environment, &schema.binary, &schema.args, extra, &service.sink, cancel)
            .await?;
        Self::persist(&cache, &api);

        metrics::counter!("svcagent_schema_generations_total", "scope" => scope.to_string()).increment(1);
        self.publish(LifecycleEvent::SchemaGenerated {
            service: service.identity.unique(),
            scope,
            generated_at: Utc::now(),
        });
        Ok(())
    }

    async fn start(
        self: &Arc<Self>,
        state: &mut RuntimeState,
        request: StartRequest,
        cancel: &CancellationToken,
    ) -> Result<(), AgentError> {
        let phase = Phase::Start;
        state.lifecycle.ensure(phase)?;
        let service = Self::loaded(state, phase)?;
        let binding = Self::bound(state, phase)?;
        let hot_reload = self.config.hot_reload.enabled;

        if state.lifecycle == LifecycleState::Running && state.supervisor.is_running().await {
            if hot_reload {
                debug!(service = %service.identity.unique(), "Already running with hot reload");
                return Ok(());
            }
            let id = state.supervisor.process_id().unwrap_or_default();
            return Err(AgentError::environment(phase, RuntimeError::AlreadyRunning(id)));
        }

        if state.environment.is_none() {
            debug!(service = %service.identity.unique(), "Rebuilding environment released by Stop");
            let environment = self.build_environment(phase, &service, &binding).await?;
            if let Err(e) = self.prepare(phase, environment.as_ref(), &service, binding.scope, cancel).await {
                Self::release(environment).await;
                return Err(e);
            }
            state.environment = Some(environment);
        }
        let Some(environment) = state.environment.as_deref() else {
            return Err(AgentError::environment(phase, RuntimeError::NotInitialized));
        };

        let mut vars = binding.vars.clone();
        vars.add_endpoints(&request.dependencies_network_mappings, binding.scope);
        vars.set(RUNNING_KEY, "true");

        let server = &self.config.server;
        let spec = environment
            .new_process(&server.binary, &server.render_args(binding.instance.port))
            .map_err(|e| AgentError::environment(phase, e))?
            .with_envs(vars.all());
        let outcome = state
            .supervisor
            .start(environment, &spec, service.sink.clone())
            .await
            .map_err(|e| AgentError::environment(phase, e))?;
        let process_id = match outcome {
            StartOutcome::Started(id) | StartOutcome::AlreadyRunning(id) => id,
        };

        state.server_spec = Some(spec);
        state.dependency_mappings = request.dependencies_network_mappings;
        if hot_reload && state.watch.is_none() {
            self.register_watcher(state, &service);
        }
        state.lifecycle = LifecycleState::Running;

        info!(
            service = %service.identity.unique(),
            scope = %binding.scope,
            process = %process_id,
            "Service started on {}",
            binding.instance.address()
        );
        metrics::counter!("svcagent_process_starts_total", "scope" => binding.scope.to_string()).increment(1);
        self.publish(LifecycleEvent::Started {
            service: service.identity.unique(),
            scope: binding.scope,
            process_id,
            started_at: Utc::now(),
        });
        Ok(())
    }

    fn register_watcher(self: &Arc<Self>, state: &mut RuntimeState, service: &LoadedService) {
        let filter = ChangeFilter::from_config(&self.config.hot_reload, &self.config.schema);
        let (tx, rx) = mpsc::channel(CHANGE_CHANNEL_CAPACITY);
        match watcher::watch(&service.identity.location, filter, tx) {
            Ok(subscription) => {
                let cancel = CancellationToken::new();
                let handler = Arc::new(RuntimeRestartHandler {
                    runtime: Arc::downgrade(self),
                    generation: state.watch_generation,
                });
                spawn_reload_loop(rx, self.config.hot_reload.debounce(), handler, cancel.clone());
                state.watch = Some(subscription);
                state.reload = Some(cancel.drop_guard());
            }
            Err(e) => warn!(service = %service.identity.unique(), "Hot reload unavailable for this run: {}", e),
        }
    }

    /// `generation` is set for watcher-driven restarts. A burst queued on the
    /// lock across a Stop must not restart the process of a later Start.
    async fn restart(&self, generation: Option<u64>, changes: Vec<ChangeEvent>) {
        let mut state = self.state.lock().await;
        if generation.is_some_and(|g| g != state.watch_generation) {
            debug!("Dropping {} change(s) from a previous run", changes.len());
            return;
        }
        if state.lifecycle != LifecycleState::Running {
            debug!("Ignoring {} change(s) while {:?}", changes.len(), state.lifecycle);
            return;
        }
        let result = self.restart_locked(&mut state, changes).await;
        // Already logged and published
        let _ = self.report(&state, result);
    }

    async fn restart_locked(&self, state: &mut RuntimeState, changes: Vec<ChangeEvent>) -> Result<(), AgentError> {
        let phase = Phase::Reload;
        state.lifecycle.ensure(phase)?;
        let service = Self::loaded(state, phase)?;
        let binding = Self::bound(state, phase)?;
        let spec = state
            .server_spec
            .clone()
            .ok_or_else(|| AgentError::environment(phase, RuntimeError::NotInitialized))?;

        self.publish(LifecycleEvent::RestartRequested {
            service: service.identity.unique(),
            changed_paths: changes.iter().map(|c| c.path.display().to_string()).collect(),
            requested_at: Utc::now(),
        });

        let Some(environment) = state.environment.as_deref() else {
            return Err(AgentError::environment(phase, RuntimeError::NotInitialized));
        };
        self.prepare(phase, environment, &service, binding.scope, &CancellationToken::new())
            .await?;
        state.supervisor.stop().await.map_err(|e| AgentError::environment(phase, e))?;
        let outcome = state
            .supervisor
            .start(environment, &spec, service.sink.clone())
            .await
            .map_err(|e| AgentError::environment(phase, e))?;
        let process_id = match outcome {
            StartOutcome::Started(id) | StartOutcome::AlreadyRunning(id) => id,
        };

        info!(service = %service.identity.unique(), process = %process_id, "Service restarted");
        metrics::counter!("svcagent_hot_reload_restarts_total").increment(1);
        self.publish(LifecycleEvent::Restarted {
            service: service.identity.unique(),
            process_id,
            restarted_at: Utc::now(),
        });
        Ok(())
    }

    /// Release the watcher, the process and the environment. Every step runs
    /// even when an earlier one failed.
    async fn teardown(&self, state: &mut RuntimeState) -> Vec<String> {
        let mut errors = Vec::new();

        // Never awaited: a restart in flight may be waiting on this lock
        state.reload.take();
        state.watch_generation = state.watch_generation.wrapping_add(1);
        if let Some(subscription) = state.watch.take() {
            subscription.cancel().await;
        }
        if let Err(e) = state.supervisor.stop().await {
            errors.push(format!("process: {}", e));
        }
        if let Some(mut environment) = state.environment.take() {
            if let Err(e) = environment.shutdown().await {
                errors.push(format!("environment: {}", e));
            }
        }
        state.server_spec = None;
        errors
    }

    async fn stop(&self, state: &mut RuntimeState) -> Result<(), AgentError> {
        let phase = Phase::Stop;
        state.lifecycle.ensure(phase)?;
        match state.lifecycle {
            LifecycleState::Initialized | LifecycleState::Running => {}
            other => {
                debug!("Nothing to stop while {:?}", other);
                return Ok(());
            }
        }

        let errors = self.teardown(state).await;
        state.lifecycle = LifecycleState::Stopped;
        let service = state.service.as_ref().map(|s| s.identity.unique()).unwrap_or_default();
        info!(service = %service, "Service stopped");
        self.publish(LifecycleEvent::Stopped { service, stopped_at: Utc::now() });

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AgentError::Teardown { phase, errors })
        }
    }

    /// Teardown plus cache and container removal, shared by Reset and Destroy
    async fn purge(&self, state: &mut RuntimeState, phase: Phase) -> Result<Vec<String>, AgentError> {
        let service = Self::loaded(state, phase)?;
        let mut errors = self.teardown(state).await;
        let paths = ServicePaths::new(&service.identity, &self.config);

        // Without a binding the scope is unknown, so both caches go
        let scopes = match state.binding.as_ref() {
            Some(binding) => vec![binding.scope],
            None => vec![ExecutionScope::Native, ExecutionScope::Container],
        };
        for scope in &scopes {
            let cache = FingerprintCache::new(paths.cache(*scope));
            if let Err(e) = cache.clear() {
                errors.push(format!("cache {}: {}", scope, e));
            } else {
                debug!(scope = %scope, "Cleared cache {:?}", cache.root());
            }
        }
        if scopes.contains(&ExecutionScope::Container) {
            if let Err(e) = self.factory.remove_persistent(&service.identity).await {
                errors.push(format!("container: {}", e));
            }
        }

        state.binding = None;
        state.dependency_mappings.clear();
        Ok(errors)
    }

    async fn reset(&self, state: &mut RuntimeState) -> Result<(), AgentError> {
        let phase = Phase::Reset;
        state.lifecycle.ensure(phase)?;
        let errors = self.purge(state, phase).await?;
        state.lifecycle = LifecycleState::Loaded;

        let service = state.service.as_ref().map(|s| s.identity.unique()).unwrap_or_default();
        info!(service = %service, "Service reset");
        self.publish(LifecycleEvent::Reset { service, reset_at: Utc::now() });

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AgentError::Teardown { phase, errors })
        }
    }

    async fn destroy(&self, state: &mut RuntimeState) -> Result<(), AgentError> {
        let phase = Phase::Destroy;
        state.lifecycle.ensure(phase)?;
        let errors = self.purge(state, phase).await?;

        let service = state.service.take().map(|s| s.identity.unique()).unwrap_or_default();
        state.lifecycle = LifecycleState::Unloaded;
        info!(service = %service, "Service destroyed");
        self.publish(LifecycleEvent::Destroyed { service, destroyed_at: Utc::now() });

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AgentError::Teardown { phase, errors })
        }
    }

    async fn test(&self, state: &mut RuntimeState, cancel: &CancellationToken) -> Result<TestResult, AgentError> {
        let phase = Phase::Test;
        state.lifecycle.ensure(phase)?;
        let service = Self::loaded(state, phase)?;
        let binding = Self::bound(state, phase)?;

        // Stop released the environment; tests get a short-lived one
        let mut temporary = None;
        if state.environment.is_none() {
            let environment = self.build_environment(phase, &service, &binding).await?;
            if let Err(e) = self.prepare(phase, environment.as_ref(), &service, binding.scope, cancel).await {
                Self::release(environment).await;
                return Err(e);
            }
            temporary = Some(environment);
        }

        let result = match state.environment.as_deref().or(temporary.as_deref()) {
            Some(environment) => {
                let tests = &self.config.tests;
                match environment.new_process(&tests.binary, &tests.args) {
                    Ok(spec) => state.supervisor.test(environment, &spec, service.sink.clone(), cancel).await,
                    Err(e) => Err(e),
                }
            }
            None => Err(RuntimeError::NotInitialized),
        };

        if let Some(environment) = temporary {
            Self::release(environment).await;
        }

        let result = result.map_err(|e| AgentError::environment(phase, e))?;
        let outcome = if result.passed { "passed" } else { "failed" };
        metrics::counter!("svcagent_test_runs_total", "outcome" => outcome).increment(1);
        Ok(result)
    }
}
