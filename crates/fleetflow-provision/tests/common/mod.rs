use async_trait::async_trait;
use fleetflow_provision::{
    FlowContext, InstanceInfo, InstanceRequest, InstanceStatus, Job, Mediator, ProvisionError,
    ProvisioningService, RegistryCredentials, ResourceScope, ScopeFactory, ServiceOptions, State,
    StateFactory, StateFlow, StateProgress,
};
use fleetflow_remote::{
    CommandOutput, ExecutorOptions, RemoteTransport, SshTarget, TransportFactory,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared, ordered record of what states were asked to do
#[derive(Clone, Default, Debug)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }

    pub fn contains(&self, event: &str) -> bool {
        self.count(event) > 0
    }

    /// Events of the state named `state`
    pub fn for_state(&self, state: &str) -> Vec<String> {
        let prefix = format!("{}:", state);
        self.events()
            .into_iter()
            .filter(|e| e.starts_with(&prefix))
            .collect()
    }
}

/// Gate a state waits on before it succeeds
#[derive(Clone, Default, Debug)]
pub struct Gate(Arc<AtomicBool>);

impl Gate {
    pub fn open(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What the next `update` of a [`ScriptedState`] does
#[derive(Clone, Debug)]
#[allow(dead_code)]
pub enum Step {
    InProgress,
    Succeed,
    /// Domain error raised by the state
    DomainError(&'static str),
    /// Any other error
    RemoteError,
    Panic,
    /// `InProgress` until the gate opens, then `Succeeded`
    WaitFor(Gate),
}

#[derive(Debug)]
pub struct ScriptedState {
    name: String,
    steps: Vec<Step>,
    position: usize,
    fail_initialize: bool,
    panic_on_dispose: bool,
    log: EventLog,
}

#[async_trait]
impl State for ScriptedState {
    fn description(&self) -> String {
        format!("{} (step {})", self.name, self.position)
    }

    async fn initialize(&mut self) -> fleetflow_provision::Result<()> {
        self.log.push(format!("{}:initialize", self.name));
        if self.fail_initialize {
            return Err(ProvisionError::state_update(self.name.clone(), "initialize failed"));
        }
        Ok(())
    }

    async fn update(&mut self) -> fleetflow_provision::Result<StateProgress> {
        self.log.push(format!("{}:update", self.name));
        let step = self.steps.get(self.position).cloned().unwrap_or(Step::Succeed);

        match step {
            Step::InProgress => {
                self.position += 1;
                Ok(StateProgress::InProgress)
            }
            Step::Succeed => {
                self.position += 1;
                Ok(StateProgress::Succeeded)
            }
            Step::DomainError(message) => {
                Err(ProvisionError::state_update(self.name.clone(), message))
            }
            Step::RemoteError => Err(ProvisionError::Remote(
                fleetflow_remote::RemoteError::Execution {
                    exit_code: 2,
                    command: Some("false".to_string()),
                },
            )),
            Step::Panic => panic!("state {} exploded", self.name),
            Step::WaitFor(gate) => {
                if gate.is_open() {
                    self.position += 1;
                    Ok(StateProgress::Succeeded)
                } else {
                    Ok(StateProgress::InProgress)
                }
            }
        }
    }

    async fn dispose(&mut self) {
        self.log.push(format!("{}:dispose", self.name));
        if self.panic_on_dispose {
            panic!("state {} failed to clean up", self.name);
        }
    }
}

/// Flow that runs a fixed list of scripted states in order
pub struct ScriptedFlow {
    name: String,
    states: Vec<(String, Vec<Step>)>,
    current: usize,
    fail_initial: bool,
    fail_initialize: Vec<String>,
    panic_on_dispose: Vec<String>,
    log: EventLog,
}

#[allow(dead_code)]
impl ScriptedFlow {
    pub fn new(name: &str, log: &EventLog) -> Self {
        Self {
            name: name.to_string(),
            states: Vec::new(),
            current: 0,
            fail_initial: false,
            fail_initialize: Vec::new(),
            panic_on_dispose: Vec::new(),
            log: log.clone(),
        }
    }

    /// Append a state named `name` that plays `steps`
    pub fn state(mut self, name: &str, steps: Vec<Step>) -> Self {
        self.states.push((name.to_string(), steps));
        self
    }

    /// Single-state flow that succeeds on its first update
    pub fn single(name: &str, log: &EventLog) -> Self {
        Self::new(name, log).state(name, vec![Step::Succeed])
    }

    pub fn failing_initial_state(mut self) -> Self {
        self.fail_initial = true;
        self
    }

    pub fn failing_initialize(mut self, state: &str) -> Self {
        self.fail_initialize.push(state.to_string());
        self
    }

    pub fn panicking_dispose(mut self, state: &str) -> Self {
        self.panic_on_dispose.push(state.to_string());
        self
    }

    fn build(&self, index: usize) -> Option<ScriptedState> {
        self.states.get(index).map(|(name, steps)| ScriptedState {
            name: name.clone(),
            steps: steps.clone(),
            position: 0,
            fail_initialize: self.fail_initialize.contains(name),
            panic_on_dispose: self.panic_on_dispose.contains(name),
            log: self.log.clone(),
        })
    }
}

#[async_trait]
impl StateFlow for ScriptedFlow {
    type State = ScriptedState;

    fn name(&self) -> &str {
        &self.name
    }

    async fn initial_state(&self, _ctx: &FlowContext) -> fleetflow_provision::Result<ScriptedState> {
        if self.fail_initial {
            return Err(ProvisionError::state_update(self.name.clone(), "no initial state"));
        }
        self.build(0)
            .ok_or_else(|| ProvisionError::EmptyFlow(self.name.clone()))
    }

    async fn next_state(
        &mut self,
        _ctx: &FlowContext,
        current: &ScriptedState,
    ) -> fleetflow_provision::Result<Option<ScriptedState>> {
        let expected = self.states.get(self.current).map(|(name, _)| name.as_str());
        if expected != Some(current.name.as_str()) {
            return Err(ProvisionError::unknown_state(
                self.name.clone(),
                current.name.clone(),
            ));
        }
        self.current += 1;
        Ok(self.build(self.current))
    }
}

/// Scope factory counting creations and releases
#[derive(Clone, Default)]
pub struct CountingScopes {
    pub created: Arc<AtomicUsize>,
    pub released: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl CountingScopes {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

struct CountingScope {
    released: Arc<AtomicUsize>,
}

#[async_trait]
impl ResourceScope for CountingScope {
    async fn release(&mut self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

impl ScopeFactory for CountingScopes {
    fn create_scope(&self) -> Box<dyn ResourceScope> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Box::new(CountingScope {
            released: self.released.clone(),
        })
    }
}

#[derive(Default)]
pub struct Cloud {
    pub instances: HashMap<String, InstanceInfo>,
    pub created: Vec<String>,
    pub ready: Vec<String>,
    pub credentials: Option<RegistryCredentials>,
    /// `describe_instance` calls before a new instance reports running
    pub boot_polls: usize,
}

/// In-memory cloud: instances boot after a few polls and get an address
#[derive(Clone, Default)]
pub struct FakeMediator {
    pub cloud: Arc<Mutex<Cloud>>,
}

#[allow(dead_code)]
impl FakeMediator {
    pub fn with_instance(self, name: &str, address: &str) -> Self {
        self.cloud.lock().unwrap().instances.insert(
            name.to_string(),
            InstanceInfo {
                id: format!("id-{}", name),
                name: name.to_string(),
                status: InstanceStatus::Running,
                address: Some(address.to_string()),
            },
        );
        self
    }

    pub fn with_credentials(self, credentials: RegistryCredentials) -> Self {
        self.cloud.lock().unwrap().credentials = Some(credentials);
        self
    }

    pub fn with_boot_polls(self, polls: usize) -> Self {
        self.cloud.lock().unwrap().boot_polls = polls;
        self
    }

    pub fn created(&self) -> Vec<String> {
        self.cloud.lock().unwrap().created.clone()
    }

    pub fn ready(&self) -> Vec<String> {
        self.cloud.lock().unwrap().ready.clone()
    }
}

#[async_trait]
impl Mediator for FakeMediator {
    async fn find_instance(&self, name: &str) -> anyhow::Result<Option<InstanceInfo>> {
        Ok(self.cloud.lock().unwrap().instances.get(name).cloned())
    }

    async fn create_instance(&self, request: &InstanceRequest) -> anyhow::Result<InstanceInfo> {
        let mut cloud = self.cloud.lock().unwrap();
        let info = InstanceInfo {
            id: format!("id-{}", request.name),
            name: request.name.clone(),
            status: InstanceStatus::Pending,
            address: None,
        };
        cloud.instances.insert(request.name.clone(), info.clone());
        cloud.created.push(request.name.clone());
        Ok(info)
    }

    async fn describe_instance(&self, id: &str) -> anyhow::Result<InstanceInfo> {
        let mut cloud = self.cloud.lock().unwrap();
        let booting = cloud.boot_polls > 0;
        if booting {
            cloud.boot_polls -= 1;
        }
        let instance = cloud
            .instances
            .values_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| anyhow::anyhow!("no instance {}", id))?;
        if !booting {
            instance.status = InstanceStatus::Running;
            instance.address.get_or_insert_with(|| "203.0.113.10".to_string());
        }
        Ok(instance.clone())
    }

    async fn mark_instance_ready(&self, instance: &InstanceInfo) -> anyhow::Result<()> {
        self.cloud.lock().unwrap().ready.push(instance.name.clone());
        Ok(())
    }

    async fn registry_credentials(&self) -> anyhow::Result<Option<RegistryCredentials>> {
        Ok(self.cloud.lock().unwrap().credentials.clone())
    }
}

#[derive(Default)]
pub struct Wire {
    /// `(host, command)` in execution order
    pub commands: Vec<(String, String)>,
    pub connects: usize,
    pub disconnects: usize,
    /// Commands containing the key exit with the value
    pub failures: Vec<(String, i32)>,
}

/// Transport factory whose connections record commands instead of running them
#[derive(Clone, Default)]
pub struct RecordingTransports {
    pub wire: Arc<Mutex<Wire>>,
}

#[allow(dead_code)]
impl RecordingTransports {
    pub fn fail_when(&self, needle: &str, exit_code: i32) {
        self.wire
            .lock()
            .unwrap()
            .failures
            .push((needle.to_string(), exit_code));
    }

    pub fn commands(&self) -> Vec<String> {
        self.wire
            .lock()
            .unwrap()
            .commands
            .iter()
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn hosts(&self) -> Vec<String> {
        self.wire
            .lock()
            .unwrap()
            .commands
            .iter()
            .map(|(h, _)| h.clone())
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.wire.lock().unwrap().connects
    }

    pub fn disconnects(&self) -> usize {
        self.wire.lock().unwrap().disconnects
    }
}

struct RecordingTransport {
    host: String,
    wire: Arc<Mutex<Wire>>,
}

#[async_trait]
impl RemoteTransport for RecordingTransport {
    fn target(&self) -> String {
        self.host.clone()
    }

    async fn connect(&mut self) -> fleetflow_remote::Result<()> {
        self.wire.lock().unwrap().connects += 1;
        Ok(())
    }

    async fn execute(&mut self, command: &str) -> fleetflow_remote::Result<CommandOutput> {
        let mut wire = self.wire.lock().unwrap();
        wire.commands.push((self.host.clone(), command.to_string()));
        let exit_code = wire
            .failures
            .iter()
            .find(|(needle, _)| command.contains(needle.as_str()))
            .map(|(_, code)| *code)
            .unwrap_or(0);
        Ok(CommandOutput::new(exit_code, ""))
    }

    async fn disconnect(&mut self) -> fleetflow_remote::Result<()> {
        self.wire.lock().unwrap().disconnects += 1;
        Ok(())
    }
}

impl TransportFactory for RecordingTransports {
    fn open(&self, target: &SshTarget) -> Box<dyn RemoteTransport> {
        Box::new(RecordingTransport {
            host: target.host.clone(),
            wire: self.wire.clone(),
        })
    }
}

pub fn fast_executor_options() -> ExecutorOptions {
    ExecutorOptions {
        connect_retry_delay: Duration::from_millis(1),
        command_retry_delay: Duration::from_millis(1),
        max_command_attempts: Some(2),
    }
}

pub fn fast_service_options() -> ServiceOptions {
    ServiceOptions {
        poll_interval: Duration::from_millis(5),
        state_poll_interval: Duration::from_millis(2),
        job_retention: Duration::from_secs(3600),
    }
}

pub fn context(mediator: &FakeMediator, transports: &RecordingTransports) -> FlowContext {
    let states = StateFactory::new(Arc::new(transports.clone()), fast_executor_options());
    FlowContext::new(Arc::new(mediator.clone()), states)
}

#[allow(dead_code)]
pub fn service(scopes: &CountingScopes) -> Arc<ProvisioningService> {
    let ctx = context(&FakeMediator::default(), &RecordingTransports::default());
    Arc::new(
        ProvisioningService::new(fast_service_options(), ctx)
            .with_scope_factory(Arc::new(scopes.clone())),
    )
}

/// Poll until `condition` holds, panicking after a few seconds
pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

pub async fn wait_until_ended(job: &Arc<Job>) {
    let id = job.id();
    wait_for(&format!("job {} to end", id), || job.is_ended()).await;
}
