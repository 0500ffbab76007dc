//! Core actor framework types and traits.
//!
//! Provides the building blocks for the orchestrator:
//! - `Actor` trait for defining actor behavior
//! - `ActorHandle` for sending messages and awaiting replies
//! - `ActorRef` for signalling shutdown

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info};

// =============================================================================
// Core Traits
// =============================================================================

/// Marker trait for actor messages.
pub trait Message: Send + Debug + 'static {}

impl<T: Send + Debug + 'static> Message for T {}

/// The Actor trait defines behavior for an actor.
///
/// Actors:
/// - Process messages one at a time (no internal concurrency)
/// - Own mutable state not shared with other actors
/// - Communicate only via message passing
#[async_trait]
pub trait Actor: Send + 'static {
    /// The message type this actor handles.
    type Message: Message;

    /// Actor name for logging.
    fn name(&self) -> &str;

    /// Handle a single message.
    ///
    /// Returns `Ok(true)` to continue, `Ok(false)` to stop, or `Err` on failure.
    async fn handle(
        &mut self,
        msg: Self::Message,
        ctx: &mut ActorContext,
    ) -> Result<bool, ActorError>;

    /// Called when the actor starts.
    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    /// Called when the actor is about to stop.
    async fn on_stop(&mut self, _ctx: &mut ActorContext) {}
}

/// Context provided to actors during message handling.
pub struct ActorContext {
    pub actor_id: String,

    pub messages_processed: u64,
}

impl ActorContext {
    pub fn new(actor_id: String) -> Self {
        Self {
            actor_id,
            messages_processed: 0,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors that can occur in actors.
#[derive(Debug, Error)]
pub enum ActorError {
    /// Actor has stopped.
    #[error("actor stopped")]
    ActorStopped,

    /// The actor dropped the reply channel without answering.
    #[error("actor dropped the request")]
    NoReply,
}

// =============================================================================
// Actor Handle
// =============================================================================

/// Handle for sending messages to an actor.
pub struct ActorHandle<M: Message> {
    /// Sender for the actor's mailbox.
    tx: mpsc::Sender<M>,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Send a message to the actor.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| ActorError::ActorStopped)
    }

    /// Send a message built around a reply channel and wait for the answer.
    ///
    /// Dropping the returned future stops the wait only; a message already in
    /// the mailbox is still processed.
    pub async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> M,
    ) -> Result<R, ActorError> {
        let (reply_to, reply) = oneshot::channel();
        self.send(build(reply_to)).await?;
        reply.await.map_err(|_| ActorError::NoReply)
    }

    /// True once the actor has stopped receiving.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Wait until the actor has stopped receiving.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Owning reference to a spawned actor task.
pub struct ActorRef {
    actor_id: String,

    task_handle: tokio::task::JoinHandle<()>,

    shutdown_tx: watch::Sender<bool>,
}

impl ActorRef {
    /// Signal the actor to stop after its current message.
    pub fn stop(&self) {
        debug!(actor_id = %self.actor_id, "Stopping actor");
        let _ = self.shutdown_tx.send(true);
    }

    /// Check if the actor task is still running.
    pub fn is_running(&self) -> bool {
        !self.task_handle.is_finished()
    }
}

/// Spawn `actor` on the current runtime.
pub fn spawn_actor<A: Actor>(actor: A, mailbox_size: usize) -> (ActorHandle<A::Message>, ActorRef) {
    let actor_id = format!("{}_{}", actor.name(), generate_actor_id());
    let (tx, rx) = mpsc::channel(mailbox_size);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    debug!(actor_id = %actor_id, "Spawning actor");
    let task_handle = tokio::spawn(run_actor_loop(actor, rx, shutdown_rx, actor_id.clone()));

    (
        ActorHandle { tx },
        ActorRef {
            actor_id,
            task_handle,
            shutdown_tx,
        },
    )
}

// =============================================================================
// Actor Loop
// =============================================================================

async fn run_actor_loop<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    mut shutdown: watch::Receiver<bool>,
    actor_id: String,
) {
    let mut ctx = ActorContext::new(actor_id.clone());

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %actor_id, error = %e, "Actor failed to start");
        return;
    }

    debug!(actor_id = %actor_id, "Actor started");

    loop {
        tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(actor_id = %actor_id, "Actor received shutdown signal");
                    break;
                }
            }

            msg = rx.recv() => {
                let Some(msg) = msg else {
                    debug!(actor_id = %actor_id, "Actor mailbox closed");
                    break;
                };

                ctx.messages_processed += 1;

                match actor.handle(msg, &mut ctx).await {
                    Ok(true) => {}
                    Ok(false) => {
                        info!(actor_id = %actor_id, "Actor requested stop");
                        break;
                    }
                    Err(e) => {
                        error!(actor_id = %actor_id, error = %e, "Actor failed");
                        break;
                    }
                }
            }
        }
    }

    // Pending requests see their reply channel dropped.
    rx.close();

    actor.on_stop(&mut ctx).await;
    info!(actor_id = %actor_id, "Actor stopped");
}

// =============================================================================
// Helpers
// =============================================================================

static ACTOR_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_actor_id() -> u64 {
    ACTOR_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

// =============================================================================
// Tests
// =============================================================================
