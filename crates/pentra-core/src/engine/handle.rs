use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use pentra_tools::Verdict;

use super::{CancelHandle, DecisionEngine, EngineError, EngineEvent, EngineState, PendingCommand, TurnOutcome};
use crate::session::Session;

const REQUEST_QUEUE: usize = 32;

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

enum Request {
    Submit { command: String, slot: TurnSlot, reply: Reply<TurnOutcome> },
    Approve { slot: TurnSlot, reply: Reply<TurnOutcome> },
    Reject { reply: Reply<TurnOutcome> },
    SetBackend { id: String, reply: Reply<()> },
    SetTarget { target: String, reply: Reply<()> },
    DiscardPending { reply: Reply<bool> },
    Save { path: PathBuf, reply: Reply<()> },
}

/// Marks an operator turn as accepted. Released when dropped, including when
/// the request never reaches the engine task.
struct TurnSlot(Arc<AtomicBool>);

impl TurnSlot {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for TurnSlot {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// What the engine task last published, readable without queueing.
struct View {
    session: Session,
    pending: Option<PendingCommand>,
}

impl View {
    fn of(engine: &DecisionEngine) -> Self {
        Self {
            session: engine.session().clone(),
            pending: engine.pending().cloned(),
        }
    }
}

/// Front-end access to an engine running on its own task.
///
/// Every session mutation happens on the engine task; callers only send
/// requests, read snapshots, and subscribe to events. One operator turn is
/// accepted at a time: a second submit or approve while a turn is in flight
/// fails with `Busy` instead of queueing.
#[derive(Clone)]
pub struct EngineHandle {
    requests: mpsc::Sender<Request>,
    cancel: CancelHandle,
    cancel_requested: Arc<AtomicBool>,
    turn: Arc<AtomicBool>,
    events: broadcast::Sender<EngineEvent>,
    state: watch::Receiver<EngineState>,
    view: watch::Receiver<View>,
    backends: Arc<[String]>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("state", &*self.state.borrow())
            .field("turn_in_flight", &self.turn.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl EngineHandle {
    /// Move `engine` onto a task. Pending commands whose verdict is `allow`
    /// are approved automatically, at most `max_auto_steps` in a row per
    /// operator action.
    ///
    /// The task ends, returning the engine, once every handle is dropped.
    #[must_use]
    pub fn spawn(engine: DecisionEngine, max_auto_steps: u32) -> (Self, JoinHandle<DecisionEngine>) {
        let (requests, rx) = mpsc::channel(REQUEST_QUEUE);
        let (view_tx, view) = watch::channel(View::of(&engine));
        let cancel_requested = Arc::new(AtomicBool::new(false));
        let handle = Self {
            requests,
            cancel: engine.cancel_handle(),
            cancel_requested: Arc::clone(&cancel_requested),
            turn: Arc::new(AtomicBool::new(false)),
            events: engine.events.clone(),
            state: engine.watch_state(),
            view,
            backends: engine.backend_ids().into(),
        };
        let actor = Actor {
            max_auto_steps,
            cancel_requested,
            view: view_tx,
        };
        let task = tokio::spawn(actor.run(engine, rx));
        (handle, task)
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.state.clone()
    }

    /// # Errors
    ///
    /// Returns `Busy` while another turn is in flight, the engine's own
    /// error, or `Closed` if the engine task is gone.
    pub async fn submit_command(&self, command: impl Into<String>) -> Result<TurnOutcome, EngineError> {
        let slot = self.acquire_turn()?;
        let command = command.into();
        self.request(|reply| Request::Submit { command, slot, reply }).await
    }

    /// # Errors
    ///
    /// Returns `Busy` while another turn is in flight, `NothingPending`, or
    /// `Closed` if the engine task is gone.
    pub async fn approve_pending(&self) -> Result<TurnOutcome, EngineError> {
        let slot = self.acquire_turn()?;
        self.request(|reply| Request::Approve { slot, reply }).await
    }

    /// # Errors
    ///
    /// Returns `NothingPending`, or `Closed` if the engine task is gone.
    pub async fn reject_pending(&self) -> Result<TurnOutcome, EngineError> {
        self.request(|reply| Request::Reject { reply }).await
    }

    /// # Errors
    ///
    /// Returns `UnknownBackend`, or `Closed` if the engine task is gone.
    pub async fn set_backend(&self, id: impl Into<String>) -> Result<(), EngineError> {
        let id = id.into();
        self.request(|reply| Request::SetBackend { id, reply }).await
    }

    /// # Errors
    ///
    /// Returns `EmptyCommand` for a blank target, or `Closed`.
    pub async fn set_target(&self, target: impl Into<String>) -> Result<(), EngineError> {
        let target = target.into();
        self.request(|reply| Request::SetTarget { target, reply }).await
    }

    /// Kill the running command or abort the backend call, stop any
    /// auto-execute chain, then discard a command waiting for approval.
    /// Returns whether a pending command was dropped.
    ///
    /// # Errors
    ///
    /// Returns `Closed` if the engine task is gone.
    pub async fn cancel_current(&self) -> Result<bool, EngineError> {
        self.cancel_requested.store(true, Ordering::Release);
        self.cancel.cancel();
        self.request(|reply| Request::DiscardPending { reply }).await
    }

    /// Copy of the session as of the last finished request. Never waits for
    /// a running turn.
    #[must_use]
    pub fn snapshot(&self) -> Session {
        self.view.borrow().session.clone()
    }

    /// The command awaiting approval as of the last finished request.
    #[must_use]
    pub fn pending(&self) -> Option<PendingCommand> {
        self.view.borrow().pending.clone()
    }

    #[must_use]
    pub fn backends(&self) -> Vec<String> {
        self.backends.to_vec()
    }

    /// # Errors
    ///
    /// Returns `Session` if the snapshot cannot be written, or `Closed`.
    pub async fn save(&self, path: impl Into<PathBuf>) -> Result<(), EngineError> {
        let path = path.into();
        self.request(|reply| Request::Save { path, reply }).await
    }

    fn acquire_turn(&self) -> Result<TurnSlot, EngineError> {
        let Some(slot) = TurnSlot::acquire(&self.turn) else {
            let state = match self.state() {
                // accepted but not started yet
                EngineState::Idle | EngineState::AwaitingApproval => EngineState::Executing,
                state => state,
            };
            return Err(EngineError::Busy(state));
        };
        self.cancel_requested.store(false, Ordering::Release);
        Ok(slot)
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(make(reply))
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)?
    }
}

struct Actor {
    max_auto_steps: u32,
    cancel_requested: Arc<AtomicBool>,
    view: watch::Sender<View>,
}

impl Actor {
    async fn run(self, mut engine: DecisionEngine, mut rx: mpsc::Receiver<Request>) -> DecisionEngine {
        while let Some(request) = rx.recv().await {
            match request {
                Request::Submit { command, slot, reply } => {
                    let result = if self.cancelled() {
                        Ok(TurnOutcome::Cancelled { record: None })
                    } else {
                        let result = engine.submit(&command).await;
                        self.auto_approve(&mut engine, result).await
                    };
                    self.publish(&engine);
                    drop(slot);
                    let _ = reply.send(result);
                }
                Request::Approve { slot, reply } => {
                    let result = if self.cancelled() {
                        Ok(TurnOutcome::Cancelled { record: None })
                    } else {
                        let result = engine.approve().await;
                        self.auto_approve(&mut engine, result).await
                    };
                    self.publish(&engine);
                    drop(slot);
                    let _ = reply.send(result);
                }
                Request::Reject { reply } => {
                    let result = engine.reject();
                    self.publish(&engine);
                    let _ = reply.send(result);
                }
                Request::SetBackend { id, reply } => {
                    let result = engine.set_backend(&id);
                    self.publish(&engine);
                    let _ = reply.send(result);
                }
                Request::SetTarget { target, reply } => {
                    let result = engine.set_target(&target);
                    self.publish(&engine);
                    let _ = reply.send(result);
                }
                Request::DiscardPending { reply } => {
                    let discarded = engine.cancel_pending();
                    self.publish(&engine);
                    let _ = reply.send(Ok(discarded));
                }
                Request::Save { path, reply } => {
                    let _ = reply.send(engine.save(&path).await);
                }
            }
        }
        tracing::debug!("engine task stopped: all handles dropped");
        engine
    }

    fn cancelled(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
    }

    fn publish(&self, engine: &DecisionEngine) {
        self.view.send_replace(View::of(engine));
    }

    /// Keep approving `allow`-verdict commands until one needs the operator,
    /// the loop goes idle, the step cap is reached, or a cancel arrives.
    async fn auto_approve(
        &self,
        engine: &mut DecisionEngine,
        mut result: Result<TurnOutcome, EngineError>,
    ) -> Result<TurnOutcome, EngineError> {
        let mut steps = 0;
        while let Ok(TurnOutcome::AwaitingApproval(pending)) = &result
            && pending.verdict.verdict == Verdict::Allow
            && steps < self.max_auto_steps
        {
            if self.cancelled() {
                tracing::info!(command = %pending.command, "auto-execute stopped by cancel");
                engine.cancel_pending();
                return Ok(TurnOutcome::Cancelled { record: None });
            }
            steps += 1;
            tracing::info!(step = steps, max_auto_steps = self.max_auto_steps, command = %pending.command, "auto-approving");
            result = engine.approve().await;
        }
        if steps > 0 && matches!(result, Ok(TurnOutcome::AwaitingApproval(_))) {
            tracing::info!(steps, "auto-execute paused for operator approval");
        }
        result
    }
}
