use std::collections::VecDeque;
use std::time::Duration;

use log::{error, info};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinSet};

const ACTOR_CHANNEL_SIZE: usize = 64;

/// A single-threaded cooperative actor.
/// All messages are processed sequentially by the event loop, so the actor
/// state can be mutated without synchronization.
#[async_trait::async_trait]
pub trait Actor: Sized + Send + 'static {
    type Message: Send + 'static;
    type Options: Send;

    fn name() -> &'static str;

    fn new(options: Self::Options) -> Self;

    async fn start(&mut self, ctx: &mut ActorContext<Self>);

    /// Process one message and return the next action.
    /// This method must not invoke any blocking functions, otherwise the
    /// actor event loop would be blocked since all messages are processed
    /// sequentially in a single task.
    /// If the actor needs to perform async or blocking operations, it should
    /// spawn tasks via [`ActorContext::spawn`] and have them complete by
    /// sending messages back to the actor.
    fn receive(&mut self, ctx: &mut ActorContext<Self>, message: Self::Message) -> ActorAction;

    async fn stop(self, ctx: &mut ActorContext<Self>);
}

pub enum ActorAction {
    Continue,
    Stop,
}

pub struct ActorContext<T: Actor> {
    handle: ActorHandle<T>,
    /// Messages the actor sent to itself while processing a message.
    /// They are processed before any external message, in order.
    pending: VecDeque<T::Message>,
    /// A set of tasks spawned by the actor when processing messages.
    /// All these tasks are aborted when the context is dropped.
    tasks: JoinSet<()>,
}

impl<T: Actor> ActorContext<T> {
    pub fn new(handle: &ActorHandle<T>) -> Self {
        Self {
            handle: handle.clone(),
            pending: VecDeque::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn handle(&self) -> &ActorHandle<T> {
        &self.handle
    }

    /// Enqueue a message to the actor itself.
    /// The message is processed before external messages, after the current
    /// one is handled.
    pub fn send(&mut self, message: T::Message) {
        self.pending.push_back(message);
    }

    /// Deliver a message to the actor itself after a delay.
    /// There is no cancellation; stale timer messages are expected to be
    /// recognized and ignored by the receiving handler.
    pub fn send_with_delay(&mut self, message: T::Message, delay: Duration) {
        let handle = self.handle.clone();
        self.tasks.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = handle.send(message).await;
        });
    }

    /// Spawn a task and save the handle in the context.
    /// The task should communicate errors by sending the actor a message;
    /// anything else is lost.
    pub fn spawn(
        &mut self,
        task: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> AbortHandle {
        self.tasks.spawn(task)
    }

    /// Join tasks that have completed and log panics.
    pub fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    error!("failed to join task spawned by actor: {e}");
                }
            }
        }
    }
}

pub struct ActorHandle<T: Actor> {
    sender: mpsc::Sender<T::Message>,
    stopped: watch::Receiver<bool>,
}

impl<T: Actor> Clone for ActorHandle<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

impl<T: Actor> ActorHandle<T> {
    pub fn new(options: T::Options) -> Self {
        let (tx, rx) = mpsc::channel(ACTOR_CHANNEL_SIZE);
        let (stopped_tx, stopped_rx) = watch::channel::<bool>(false);
        let handle = Self {
            sender: tx,
            stopped: stopped_rx,
        };
        let runner = ActorRunner {
            actor: T::new(options),
            ctx: ActorContext::new(&handle),
            receiver: rx,
            stopped: stopped_tx,
        };
        // The actor runs "detached" and the event loop task stops by itself
        // when the stop action is taken or all handles are dropped.
        tokio::spawn(runner.run());
        handle
    }

    pub async fn send(&self, message: T::Message) -> Result<(), SendError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| SendError::new::<T>())
    }

    pub async fn wait_for_stop(mut self) {
        // We ignore the receiver error since the sender must have been
        // dropped in this case, which means the actor has stopped.
        let _ = self.stopped.wait_for(|x| *x).await;
    }
}

#[derive(Debug)]
pub struct SendError {
    actor: &'static str,
}

impl SendError {
    fn new<T: Actor>() -> Self {
        Self { actor: T::name() }
    }
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to send message to stopped actor {}", self.actor)
    }
}

impl std::error::Error for SendError {}

/// A collection of actors that can be awaited together.
pub struct ActorSystem {
    stopped: Vec<watch::Receiver<bool>>,
}

impl Default for ActorSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl ActorSystem {
    pub fn new() -> Self {
        Self { stopped: vec![] }
    }

    pub fn spawn<T: Actor>(&mut self, options: T::Options) -> ActorHandle<T> {
        let handle = ActorHandle::<T>::new(options);
        self.stopped.push(handle.stopped.clone());
        handle
    }

    /// Wait for all spawned actors to stop.
    pub async fn join(&mut self) {
        for mut stopped in self.stopped.drain(..) {
            let _ = stopped.wait_for(|x| *x).await;
        }
    }
}

struct ActorRunner<T: Actor> {
    actor: T,
    ctx: ActorContext<T>,
    receiver: mpsc::Receiver<T::Message>,
    stopped: watch::Sender<bool>,
}

impl<T: Actor> ActorRunner<T> {
    async fn run(self) {
        let Self {
            mut actor,
            mut ctx,
            mut receiver,
            stopped,
        } = self;
        actor.start(&mut ctx).await;
        loop {
            let message = match ctx.pending.pop_front() {
                Some(x) => x,
                None => match receiver.recv().await {
                    Some(x) => x,
                    None => break,
                },
            };
            match actor.receive(&mut ctx, message) {
                ActorAction::Continue => {}
                ActorAction::Stop => break,
            }
            ctx.reap();
        }
        actor.stop(&mut ctx).await;
        info!("actor {} has stopped", T::name());
        let _ = stopped.send(true);
    }
}
