//! Async runtime around the reducer.
//!
//! The coordinator owns the state, the inbound event channel and the
//! outbound notification fan-out. Every mutation goes through `reduce`;
//! the coordinator's own job is interpreting the returned effects:
//! engine calls, persistence, session sync, and spawning summarizations
//! whose results come back through the same event channel.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::compact::{CompactionPlan, SUMMARY_MAX_TOKENS, SUMMARY_TEMPERATURE};
use crate::config::AgentConfig;
use crate::effect::{Effect, Notification};
use crate::engine::{
    ExecutionEngine, NullEngine, NullSummarizer, NullSync, SessionSync, Summarizer, TaskContext,
};
use crate::error::Result;
use crate::event::{EngineEvent, QueueSnapshot};
use crate::reduce::{self, reduce};
use crate::session::TaskInput;
use crate::state::CoordinatorState;
use crate::store::{InMemorySessionStore, SessionStore};
use crate::types::SessionId;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const NOTIFY_CHANNEL_CAPACITY: usize = 64;

pub struct Coordinator {
    state: CoordinatorState,
    engine: Arc<dyn ExecutionEngine>,
    summarizer: Arc<dyn Summarizer>,
    sync: Arc<dyn SessionSync>,
    store: Arc<dyn SessionStore>,
    event_tx: mpsc::Sender<EngineEvent>,
    event_rx: mpsc::Receiver<EngineEvent>,
    notify_tx: broadcast::Sender<Notification>,
}

impl Coordinator {
    /// Loads persisted sessions (if any) and stands up the channels.
    pub async fn new(
        config: AgentConfig,
        engine: Arc<dyn ExecutionEngine>,
        summarizer: Arc<dyn Summarizer>,
        sync: Arc<dyn SessionSync>,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self> {
        let state = match store.load().await? {
            Some(record) => CoordinatorState::hydrate(config, record),
            None => CoordinatorState::new(config),
        };
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (notify_tx, _) = broadcast::channel(NOTIFY_CHANNEL_CAPACITY);
        Ok(Self {
            state,
            engine,
            summarizer,
            sync,
            store,
            event_tx,
            event_rx,
            notify_tx,
        })
    }

    /// Coordinator with no engine, summarizer, sync or disk behind it.
    pub async fn detached(config: AgentConfig) -> Result<Self> {
        Self::new(
            config,
            Arc::new(NullEngine),
            Arc::new(NullSummarizer),
            Arc::new(NullSync),
            Arc::new(InMemorySessionStore::default()),
        )
        .await
    }

    /// Sender for the engine transport to push events into.
    pub fn event_sender(&self) -> mpsc::Sender<EngineEvent> {
        self.event_tx.clone()
    }

    /// Notification stream for UI layers. Lagging subscribers lose
    /// notifications, never state; `state` is always the source of truth.
    pub fn subscribe(&self) -> BroadcastStream<Notification> {
        BroadcastStream::new(self.notify_tx.subscribe())
    }

    pub fn state(&self) -> CoordinatorState {
        self.state.clone()
    }

    pub fn current_session_id(&self) -> SessionId {
        self.state.current_session_id()
    }

    /// Applies one event and everything it cascades into.
    pub async fn dispatch(&mut self, event: EngineEvent) {
        let effects = reduce(&mut self.state, event);
        self.apply(effects).await;
    }

    /// Drains events already sitting in the channel, then returns.
    pub async fn pump(&mut self) {
        while let Ok(event) = self.event_rx.try_recv() {
            self.dispatch(event).await;
        }
    }

    /// Event loop: consumes the inbound channel until cancelled, then
    /// persists a final snapshot.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                maybe = self.event_rx.recv() => match maybe {
                    Some(event) => self.dispatch(event).await,
                    None => break,
                },
            }
        }
        self.store.save(&self.state.to_durable()).await
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            if let Some(event) = self.interpret(effect).await {
                queue.extend(reduce(&mut self.state, event));
            }
        }
    }

    /// Performs one effect. A returned event feeds straight back into the
    /// reducer (e.g. task delivery failure becoming a run failure).
    async fn interpret(&mut self, effect: Effect) -> Option<EngineEvent> {
        match effect {
            Effect::SendTask { task, context } => {
                if let Err(e) = self
                    .engine
                    .start_task(&self.state.config, &task, &context)
                    .await
                {
                    tracing::error!(error = %e, "failed to deliver task to engine");
                    return Some(EngineEvent::RunFailed {
                        error: e.to_string(),
                    });
                }
                None
            }
            Effect::AbortRun => {
                if let Err(e) = self.engine.abort().await {
                    tracing::warn!(error = %e, "engine abort failed");
                }
                None
            }
            Effect::ReplyPermission {
                request_id,
                approved,
            } => {
                if let Err(e) = self
                    .engine
                    .approve_or_reject_tool(&request_id, approved)
                    .await
                {
                    tracing::warn!(error = %e, %request_id, "permission reply failed");
                }
                None
            }
            Effect::RequestCompaction { plan } => {
                self.spawn_compaction(plan);
                None
            }
            Effect::PersistSessions => {
                if let Err(e) = self.store.save(&self.state.to_durable()).await {
                    tracing::warn!(error = %e, "failed to persist sessions");
                }
                None
            }
            Effect::SyncSessions => {
                let sync = Arc::clone(&self.sync);
                let record = self.state.to_durable();
                tokio::spawn(async move {
                    if let Err(e) = sync.sync(&record).await {
                        tracing::debug!(error = %e, "session sync failed");
                    }
                });
                None
            }
            Effect::Notify(notification) => {
                // Send fails only when nobody is subscribed.
                let _ = self.notify_tx.send(notification);
                None
            }
        }
    }

    /// Fire-and-forget summarization. The outcome re-enters the event
    /// channel as a synthetic event, so the commit (and its race check
    /// against concurrent edits) happens inside the reducer like any other
    /// transition.
    fn spawn_compaction(&self, plan: CompactionPlan) {
        let summarizer = Arc::clone(&self.summarizer);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let CompactionPlan {
                session_id,
                base_len,
                tail,
                prompt,
            } = plan;
            let event = match summarizer
                .summarize(&prompt, SUMMARY_TEMPERATURE, SUMMARY_MAX_TOKENS)
                .await
            {
                Ok(summary) => EngineEvent::CompactionReady {
                    session_id,
                    base_len,
                    summary,
                    tail,
                },
                Err(e) => EngineEvent::CompactionFailed {
                    session_id,
                    error: e.to_string(),
                },
            };
            if event_tx.send(event).await.is_err() {
                tracing::debug!(%session_id, "coordinator gone; compaction result dropped");
            }
        });
    }

    // -- caller operations --------------------------------------------------

    pub async fn start_task(&mut self, input: TaskInput, context: TaskContext) {
        let effects = reduce::start_task(&mut self.state, input, context);
        self.apply(effects).await;
    }

    pub async fn abort(&mut self) {
        let effects = reduce::abort(&mut self.state);
        self.apply(effects).await;
    }

    pub async fn approve_tool(&mut self) {
        let effects = reduce::resolve_pending_approval(&mut self.state, true);
        self.apply(effects).await;
    }

    pub async fn reject_tool(&mut self) {
        let effects = reduce::resolve_pending_approval(&mut self.state, false);
        self.apply(effects).await;
    }

    pub async fn retry_timeout(&mut self) {
        let effects = reduce::retry_timeout(&mut self.state);
        self.apply(effects).await;
    }

    pub async fn create_session(&mut self) -> SessionId {
        let effects = reduce::create_session(&mut self.state);
        self.apply(effects).await;
        self.state.current_session_id()
    }

    pub async fn switch_session(&mut self, id: SessionId) -> Result<()> {
        let effects = reduce::switch_session(&mut self.state, id)?;
        self.apply(effects).await;
        Ok(())
    }

    pub async fn delete_session(&mut self, id: SessionId) -> Result<()> {
        let effects = reduce::delete_session(&mut self.state, id)?;
        self.apply(effects).await;
        Ok(())
    }

    pub async fn rename_session(&mut self, id: SessionId, title: impl Into<String>) -> Result<()> {
        let effects = reduce::rename_session(&mut self.state, id, title)?;
        self.apply(effects).await;
        Ok(())
    }

    // -- engine passthroughs ------------------------------------------------

    pub async fn queue_status(&self) -> Result<QueueSnapshot> {
        self.engine.queue_status().await
    }

    pub async fn enable_debug(&self, workspace_path: &str) -> Result<String> {
        self.engine.enable_debug(workspace_path).await
    }

    pub async fn disable_debug(&self) -> Result<()> {
        self.engine.disable_debug().await
    }
}
