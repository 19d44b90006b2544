//! Client lifecycle: one worker thread per live provider.
//!
//! A [`ClientRegistry`] owns at most one live [`ClientHandle`] per provider.
//! Each handle fronts a worker thread with its own current-thread tokio
//! runtime that pulls commands from a queue and runs them through an
//! [`Agent`]. Workers never die on a failed command; only `stop` ends them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use crate::agent::{
    Agent, AgentEvent, CancelFlags, ChatTransport, ProviderError, ProviderKind, ProviderRegistry,
    ProviderSpec,
};
use crate::config::Config;
use crate::tools::ToolCatalog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClientState {
    Idle = 0,
    Running = 1,
    StopRequested = 2,
    Stopped = 3,
}

impl ClientState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ClientState::Idle,
            1 => ClientState::Running,
            2 => ClientState::StopRequested,
            _ => ClientState::Stopped,
        }
    }
}

/// Progress reported by workers, for whatever UI drives them.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Agent {
        provider: ProviderKind,
        event: AgentEvent,
    },
    CommandFailed {
        provider: ProviderKind,
        message: String,
        tools_unsupported: bool,
    },
    Stopped(ProviderKind),
}

/// State shared between a handle and its worker thread.
struct Shared {
    state: AtomicU8,
    cancel: CancelFlags,
    clear: AtomicBool,
}

impl Shared {
    fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ClientState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

/// Command intake for one provider's worker.
pub struct ClientHandle {
    kind: ProviderKind,
    shared: Arc<Shared>,
    commands: Sender<String>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ClientHandle {
    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn state(&self) -> ClientState {
        self.shared.state()
    }

    /// Neither stopping nor stopped.
    pub fn is_live(&self) -> bool {
        matches!(self.state(), ClientState::Idle | ClientState::Running)
    }

    /// Queue a command for the worker.
    pub fn submit(&self, command: &str) -> Result<()> {
        if !self.is_live() {
            anyhow::bail!("{} client is stopped", self.kind);
        }
        self.commands
            .send(command.to_string())
            .map_err(|_| anyhow::anyhow!("{} worker has exited", self.kind))
    }

    /// Ask the worker to exit at its next poll or round boundary.
    pub fn stop(&self) {
        let _ = self
            .shared
            .state
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| {
                (s != ClientState::Stopped as u8).then_some(ClientState::StopRequested as u8)
            });
        self.shared.cancel.request_stop();
    }

    /// Abort the command in flight; later commands still run.
    pub fn skip_current(&self) {
        self.shared.cancel.request_skip();
    }

    /// Empty the conversation before the next command.
    pub fn clear_history(&self) {
        self.shared.clear.store(true, Ordering::SeqCst);
    }

    /// Wait for the worker thread to finish.
    pub fn join(&self) {
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(thread) = thread
            && thread.join().is_err()
        {
            error!("{} worker panicked", self.kind);
        }
    }
}

/// Registry of live clients, owned by the application context.
pub struct ClientRegistry {
    live: Mutex<HashMap<ProviderKind, Arc<ClientHandle>>>,
    config: Arc<RwLock<Config>>,
    providers: ProviderRegistry,
    catalog: Arc<dyn ToolCatalog>,
    transport: Arc<dyn ChatTransport>,
    events: Option<Sender<WorkerEvent>>,
}

impl ClientRegistry {
    pub fn new(
        config: Config,
        catalog: Arc<dyn ToolCatalog>,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
            config: Arc::new(RwLock::new(config)),
            providers: ProviderRegistry::builtin(),
            catalog,
            transport,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Sender<WorkerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> Config {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Edit the shared configuration. Workers pick it up before their next
    /// command.
    pub fn update_config(&self, f: impl FnOnce(&mut Config)) {
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        f(&mut config);
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<ClientHandle>> {
        self.live_map().get(&kind).cloned()
    }

    pub fn live_kinds(&self) -> Vec<ProviderKind> {
        let live = self.live_map();
        ProviderKind::ALL
            .into_iter()
            .filter(|k| live.get(k).is_some_and(|h| h.is_live()))
            .collect()
    }

    /// Return the live client for `kind`, starting a fresh worker if there
    /// is none or the registered one has stopped.
    pub fn start(&self, kind: ProviderKind) -> Result<Arc<ClientHandle>> {
        let mut live = self.live_map();
        if let Some(handle) = live.get(&kind) {
            if handle.is_live() {
                return Ok(handle.clone());
            }
            handle.stop();
        }

        let spec = self
            .providers
            .get(kind)
            .with_context(|| format!("No provider registered for {}", kind))?;
        let handle = self.spawn(spec)?;
        live.insert(kind, handle.clone());
        Ok(handle)
    }

    /// Unregister and stop the live client for `kind`, if any.
    pub fn stop(&self, kind: ProviderKind) -> Option<Arc<ClientHandle>> {
        let handle = self.live_map().remove(&kind)?;
        info!("Stopping {} client", kind);
        handle.stop();
        Some(handle)
    }

    pub fn stop_all(&self) -> Vec<Arc<ClientHandle>> {
        let handles: Vec<_> = self.live_map().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.stop();
        }
        handles
    }

    /// Stop every other provider's client, then start `kind`.
    pub fn switch(&self, kind: ProviderKind) -> Result<Arc<ClientHandle>> {
        let others: Vec<ProviderKind> = self
            .live_map()
            .keys()
            .copied()
            .filter(|k| *k != kind)
            .collect();
        for other in others {
            self.stop(other);
        }
        self.start(kind)
    }

    /// Switch to the provider named in the configuration.
    pub fn current(&self) -> Result<Arc<ClientHandle>> {
        let kind = self.config().provider_kind()?;
        self.switch(kind)
    }

    fn live_map(&self) -> std::sync::MutexGuard<'_, HashMap<ProviderKind, Arc<ClientHandle>>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn spawn(&self, spec: Arc<dyn ProviderSpec>) -> Result<Arc<ClientHandle>> {
        let kind = spec.kind();
        let (tx, rx) = mpsc::channel::<String>();
        let shared = Arc::new(Shared {
            state: AtomicU8::new(ClientState::Idle as u8),
            cancel: CancelFlags::new(),
            clear: AtomicBool::new(false),
        });

        let worker = Worker {
            spec,
            shared: shared.clone(),
            config: self.config.clone(),
            catalog: self.catalog.clone(),
            transport: self.transport.clone(),
            events: self.events.clone(),
        };

        let thread = thread::Builder::new()
            .name(format!("genesis-{}", kind))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("Failed to create runtime for {} worker: {}", kind, e);
                        worker.shared.set_state(ClientState::Stopped);
                        return;
                    }
                };
                rt.block_on(worker.run(rx));
            })
            .with_context(|| format!("Failed to spawn {} worker", kind))?;

        debug!("Spawned {} worker", kind);
        Ok(Arc::new(ClientHandle {
            kind,
            shared,
            commands: tx,
            thread: Mutex::new(Some(thread)),
        }))
    }
}

struct Worker {
    spec: Arc<dyn ProviderSpec>,
    shared: Arc<Shared>,
    config: Arc<RwLock<Config>>,
    catalog: Arc<dyn ToolCatalog>,
    transport: Arc<dyn ChatTransport>,
    events: Option<Sender<WorkerEvent>>,
}

impl Worker {
    fn snapshot(&self) -> Config {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn emit(&self, event: WorkerEvent) {
        if let Some(ref tx) = self.events {
            let _ = tx.send(event);
        }
    }

    async fn run(self, commands: Receiver<String>) {
        let kind = self.spec.kind();
        let config = self.snapshot();

        let mut agent = Agent::new(
            config.agent_config(),
            self.spec.clone(),
            config.provider_config(self.spec.as_ref()),
            self.catalog.clone(),
            self.transport.clone(),
        )
        .with_cancel(self.shared.cancel.clone());
        if let Some(tx) = self.events.clone() {
            agent = agent.with_events(Arc::new(move |event: AgentEvent| {
                let _ = tx.send(WorkerEvent::Agent {
                    provider: kind,
                    event,
                });
            }));
        }

        let _ = self.shared.state.compare_exchange(
            ClientState::Idle as u8,
            ClientState::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        info!("{} client started (model {})", kind, agent.model());

        let mut idle_poll = config.idle_poll();
        loop {
            if self.shared.cancel.is_stopped() {
                break;
            }

            let command = match commands.try_recv() {
                Ok(command) => command,
                Err(TryRecvError::Empty) => {
                    tokio::time::sleep(idle_poll).await;
                    continue;
                }
                Err(TryRecvError::Disconnected) => break,
            };
            if self.shared.cancel.is_stopped() {
                debug!("{} dropping command after stop: {}", kind, command);
                break;
            }

            // Refresh config between commands
            let config = self.snapshot();
            idle_poll = config.idle_poll();
            agent.reconfigure(config.agent_config(), config.provider_config(self.spec.as_ref()));
            if self.shared.clear.swap(false, Ordering::SeqCst) {
                agent.clear_history();
            }
            self.shared.cancel.reset_skip();

            info!("{} running command: {}", kind, command);
            match agent.run(&command).await {
                Ok(text) => debug!("{} command finished ({} chars)", kind, text.len()),
                Err(e) => {
                    let tools_unsupported = e
                        .downcast_ref::<ProviderError>()
                        .is_some_and(ProviderError::is_tools_unsupported);
                    if tools_unsupported {
                        error!(
                            "Model {} does not support tool calling; pick another model for {}",
                            agent.model(),
                            kind
                        );
                    } else {
                        warn!("{} command failed: {:#}", kind, e);
                    }
                    self.emit(WorkerEvent::CommandFailed {
                        provider: kind,
                        message: format!("{:#}", e),
                        tools_unsupported,
                    });
                }
            }
        }

        // Cleanup
        self.shared.set_state(ClientState::Stopped);
        info!("{} client stopped", kind);
        self.emit(WorkerEvent::Stopped(kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{
        RecordingCatalog, Reply, ScriptedTransport, Step, call_args, call_open, done, text_chunk,
    };
    use crate::tools::ToolContent;
    use std::time::{Duration, Instant};

    fn quick_config() -> Config {
        let mut config = Config::default();
        config.client.idle_poll_ms = 5;
        config
    }

    fn registry(
        transport: &Arc<ScriptedTransport>,
        catalog: Arc<RecordingCatalog>,
    ) -> (ClientRegistry, Receiver<WorkerEvent>) {
        let (tx, rx) = mpsc::channel();
        let registry =
            ClientRegistry::new(quick_config(), catalog, transport.clone()).with_events(tx);
        (registry, rx)
    }

    /// Collect events until `stop_at` matches one.
    fn wait_for(rx: &Receiver<WorkerEvent>, stop_at: impl Fn(&WorkerEvent) -> bool) -> Vec<WorkerEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = rx.recv_timeout(remaining).expect("timed out waiting for worker event");
            let matched = stop_at(&event);
            seen.push(event);
            if matched {
                return seen;
            }
        }
    }

    fn is_done(event: &WorkerEvent) -> bool {
        matches!(event, WorkerEvent::Agent { event: AgentEvent::Done(_), .. })
    }

    fn last_user_message(request: &crate::agent::ProviderRequest) -> String {
        let messages = request.body.as_ref().unwrap()["messages"].as_array().unwrap().clone();
        messages
            .iter()
            .rev()
            .find(|m| m["role"] == "user")
            .and_then(|m| m["content"].as_str())
            .unwrap_or_default()
            .to_string()
    }

    #[test]
    fn test_commands_run_in_queue_order() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .push_lines(vec![text_chunk("one"), done()])
            .push_lines(vec![text_chunk("two"), done()]);
        let (registry, rx) = registry(&transport, Arc::new(RecordingCatalog::new()));

        let client = registry.start(ProviderKind::OpenAi).unwrap();
        client.submit("first").unwrap();
        client.submit("second").unwrap();

        wait_for(&rx, is_done);
        let events = wait_for(&rx, is_done);
        assert_eq!(
            events.last().unwrap(),
            &WorkerEvent::Agent {
                provider: ProviderKind::OpenAi,
                event: AgentEvent::Done("two".into()),
            }
        );

        let requests = transport.requests();
        assert_eq!(last_user_message(&requests[0]), "first");
        assert_eq!(last_user_message(&requests[1]), "second");

        registry.stop(ProviderKind::OpenAi).unwrap().join();
        assert_eq!(client.state(), ClientState::Stopped);
    }

    #[test]
    fn test_start_reuses_live_client() {
        let transport = Arc::new(ScriptedTransport::new());
        let (registry, _rx) = registry(&transport, Arc::new(RecordingCatalog::new()));

        let a = registry.start(ProviderKind::OpenAi).unwrap();
        let b = registry.start(ProviderKind::OpenAi).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // Once stopped, start builds a fresh instance
        registry.stop(ProviderKind::OpenAi).unwrap().join();
        assert!(!a.is_live());
        assert!(a.submit("late").is_err());

        let c = registry.start(ProviderKind::OpenAi).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(c.is_live());

        for handle in registry.stop_all() {
            handle.join();
        }
    }

    #[test]
    fn test_switch_stops_other_providers() {
        let transport = Arc::new(ScriptedTransport::new());
        let (registry, rx) = registry(&transport, Arc::new(RecordingCatalog::new()));

        let openai = registry.start(ProviderKind::OpenAi).unwrap();
        let deepseek = registry.switch(ProviderKind::DeepSeek).unwrap();

        wait_for(&rx, |e| *e == WorkerEvent::Stopped(ProviderKind::OpenAi));
        openai.join();
        assert_eq!(openai.state(), ClientState::Stopped);
        assert!(deepseek.is_live());
        assert_eq!(registry.live_kinds(), vec![ProviderKind::DeepSeek]);
        assert!(registry.get(ProviderKind::OpenAi).is_none());

        registry.stop(ProviderKind::DeepSeek).unwrap().join();
        assert!(registry.live_kinds().is_empty());
    }

    #[test]
    fn test_failed_command_does_not_stop_worker() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .push(Reply::Status(
                400,
                r#"{"error": {"message": "tools is not supported"}}"#.into(),
            ))
            .push_lines(vec![text_chunk("still here"), done()]);
        let (registry, rx) = registry(&transport, Arc::new(RecordingCatalog::new()));

        let client = registry.start(ProviderKind::OpenAi).unwrap();
        client.submit("make a cube").unwrap();
        client.submit("hello").unwrap();

        let events = wait_for(&rx, is_done);
        assert!(events.iter().any(|e| matches!(
            e,
            WorkerEvent::CommandFailed { tools_unsupported: true, .. }
        )));
        assert!(client.is_live());

        registry.stop_all();
        client.join();
    }

    #[test]
    fn test_skip_current_aborts_only_that_command() {
        let transport = Arc::new(ScriptedTransport::new());
        let catalog = Arc::new(
            RecordingCatalog::new().with_tool("delete_object", vec![ToolContent::text("ok")]),
        );

        let (reached_tx, reached_rx) = mpsc::channel::<()>();
        let (resume_tx, resume_rx) = mpsc::channel::<()>();
        transport
            .push(Reply::Lines(vec![
                Step::Line(call_open(0, "call_1", "delete_object")),
                Step::Line(call_args(0, r#"{"object_name":"#)),
                Step::Call(Box::new(move || {
                    reached_tx.send(()).unwrap();
                    resume_rx.recv().unwrap();
                })),
                Step::Line(call_args(0, r#""Cube"}"#)),
                Step::Line(done()),
            ]))
            .push_lines(vec![text_chunk("after skip"), done()]);
        let (registry, rx) = registry(&transport, catalog.clone());

        let client = registry.start(ProviderKind::OpenAi).unwrap();
        client.submit("delete the cube").unwrap();
        client.submit("next").unwrap();

        reached_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        client.skip_current();
        resume_tx.send(()).unwrap();

        let first = wait_for(&rx, is_done);
        assert!(first.iter().any(|e| matches!(
            e,
            WorkerEvent::Agent { event: AgentEvent::Done(text), .. } if text.is_empty()
        )));
        let second = wait_for(&rx, is_done);
        assert!(matches!(
            second.last(),
            Some(WorkerEvent::Agent { event: AgentEvent::Done(text), .. }) if text == "after skip"
        ));
        assert!(catalog.calls().is_empty());
        assert!(client.is_live());

        registry.stop_all();
        client.join();
    }

    #[test]
    fn test_clear_history_between_commands() {
        let transport = Arc::new(ScriptedTransport::new());
        transport
            .push_lines(vec![text_chunk("one"), done()])
            .push_lines(vec![text_chunk("two"), done()]);
        let (registry, rx) = registry(&transport, Arc::new(RecordingCatalog::new()));
        registry.update_config(|c| c.agent.system_prompt = Some(String::new()));

        let client = registry.start(ProviderKind::OpenAi).unwrap();
        client.submit("first").unwrap();
        wait_for(&rx, is_done);

        client.clear_history();
        client.submit("second").unwrap();
        wait_for(&rx, is_done);

        let requests = transport.requests();
        let messages = requests[1].body.as_ref().unwrap()["messages"].as_array().unwrap().len();
        assert_eq!(messages, 1);

        registry.stop_all();
        client.join();
    }

    #[test]
    fn test_current_follows_config_provider() {
        let transport = Arc::new(ScriptedTransport::new());
        let (registry, _rx) = registry(&transport, Arc::new(RecordingCatalog::new()));

        assert_eq!(registry.current().unwrap().kind(), ProviderKind::OpenAi);
        registry.update_config(|c| c.agent.provider = "ollama".into());
        let ollama = registry.current().unwrap();
        assert_eq!(ollama.kind(), ProviderKind::Ollama);
        assert_eq!(registry.live_kinds(), vec![ProviderKind::Ollama]);

        for handle in registry.stop_all() {
            handle.join();
        }
    }
}
