//! Tessera worker framework: a single-inbox actor abstraction.
//!
//! Each worker owns its state, receives typed messages through one
//! inbox and processes them strictly one at a time, suspending at await
//! points. The inbox policy is chosen per worker: an unbounded queue, a
//! bounded queue with admission control, or a dropbox that conflates
//! bursts into a single held message.

use std::{fmt::Debug, time::Duration};

use mailbox::{channel, InboxReceiver, InboxSender};
use thiserror::Error as ThisError;
use tokio::{
    sync::oneshot::{self, error::RecvError},
    task, time,
};

mod envelope;
mod mailbox;

pub use envelope::Envelope;
pub use mailbox::Mailbox;

pub mod prelude {
    //! Module with most used items.
    pub use super::{Actor, Addr, Context, ContextHandler, Handler, Mailbox, Message};
}

/// Error that might appear during `send` to a worker.
#[derive(ThisError, Debug)]
pub enum Error {
    /// The worker is gone, the message was not delivered.
    #[error("failed to send message to worker")]
    SendError,
    /// A bounded inbox refused admission.
    #[error("worker inbox is full")]
    MailboxFull,
    /// The worker dropped the request before answering. Happens when a
    /// dropbox conflation discards a request or the worker stops.
    #[error("failed to receive a response from a worker")]
    RecvError(#[from] RecvError),
}

/// Typed message: its `Result` is what the sender gets back.
pub trait Message {
    /// Result type of message.
    type Result: 'static;
}

/// Handle to a running worker; used to send messages to it.
pub struct Addr<A: Actor> {
    sender: InboxSender<A>,
}

impl<A: Actor> Clone for Addr<A> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<A: Actor> Debug for Addr<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Addr").finish_non_exhaustive()
    }
}

impl<A: Actor> Addr<A> {
    /// Send a message and wait for the answer.
    ///
    /// # Errors
    /// Fails if the worker is gone or drops the request unanswered.
    pub async fn send<M>(&self, message: M) -> Result<M::Result, Error>
    where
        M: Message + Send + 'static,
        M::Result: Send,
        A: ContextHandler<M>,
    {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Envelope::pack(message, Some(reply)))
            .await?;
        Ok(response.await?)
    }

    /// Send a message without waiting for an answer.
    pub async fn do_send<M>(&self, message: M)
    where
        M: Message + Send + 'static,
        M::Result: Send,
        A: ContextHandler<M>,
    {
        if let Err(error) = self.sender.send(Envelope::pack(message, None)).await {
            tessera_logger::error!(%error, "error sending worker message");
        }
    }

    /// Send without waiting for capacity; surfaces `MailboxFull` on a
    /// bounded inbox.
    ///
    /// # Errors
    /// Fails if the inbox is full or the worker is gone.
    pub fn try_send<M>(&self, message: M) -> Result<(), Error>
    where
        M: Message + Send + 'static,
        M::Result: Send,
        A: ContextHandler<M>,
    {
        self.sender.try_send(Envelope::pack(message, None))
    }

    /// Whether the worker stopped receiving.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Worker trait: state plus lifecycle hooks.
#[async_trait::async_trait]
pub trait Actor: Send + Sized + 'static {
    /// Inbox policy of this worker.
    fn mailbox(&self) -> Mailbox {
        Mailbox::Queue
    }

    /// Inactivity window after which [`Actor::on_idle`] fires. `None`
    /// disables the idle tick.
    fn idle_timeout(&self) -> Option<Duration> {
        None
    }

    /// At start hook.
    async fn on_start(&mut self, ctx: &mut Context<Self>) {
        let _ = ctx;
    }

    /// Invoked when no message arrived within `idle_timeout`.
    async fn on_idle(&mut self, ctx: &mut Context<Self>) {
        let _ = ctx;
    }

    /// At stop hook.
    async fn on_stop(&mut self, ctx: &mut Context<Self>) {
        let _ = ctx;
    }

    /// Conflation policy of a dropbox inbox: combine the held message
    /// with an incoming one. The newest message wins by default.
    #[must_use]
    fn conflate(held: Envelope<Self>, incoming: Envelope<Self>) -> Envelope<Self> {
        let _ = held;
        incoming
    }

    /// Start the worker; `on_start` completes before this returns.
    async fn start(self) -> Addr<Self> {
        start_internal(self, false).await
    }

    /// Start the worker with `on_start` running in the background.
    async fn start_background(self) -> Addr<Self> {
        start_internal(self, true).await
    }
}

async fn start_internal<A: Actor>(mut actor: A, background: bool) -> Addr<A> {
    let (sender, receiver) = channel(actor.mailbox());
    let addr = Addr { sender };
    let mut ctx = Context::new(addr.clone());
    if !background {
        actor.on_start(&mut ctx).await;
    }
    task::spawn(run_worker(actor, ctx, receiver, background));
    addr
}

async fn run_worker<A: Actor>(
    mut actor: A,
    mut ctx: Context<A>,
    mut receiver: InboxReceiver<A>,
    background: bool,
) {
    if background {
        actor.on_start(&mut ctx).await;
    }
    loop {
        if matches!(ctx.stop, Some(Stop::Now)) {
            break;
        }
        let envelope = match actor.idle_timeout() {
            Some(window) => match time::timeout(window, receiver.recv()).await {
                Ok(received) => received,
                Err(_elapsed) => {
                    actor.on_idle(&mut ctx).await;
                    continue;
                }
            },
            None => receiver.recv().await,
        };
        // The inbox is closed and drained once `recv` yields nothing.
        let Some(envelope) = envelope else { break };
        envelope.handle(&mut actor, &mut ctx).await;
        match ctx.stop {
            Some(Stop::Now) => break,
            Some(Stop::AfterBuffered) => receiver.close(),
            None => {}
        }
    }
    actor.on_stop(&mut ctx).await;
}

#[derive(Clone, Copy, Debug)]
enum Stop {
    Now,
    AfterBuffered,
}

/// Execution context handed to every handler.
#[derive(Debug)]
pub struct Context<A: Actor> {
    addr: Addr<A>,
    stop: Option<Stop>,
}

impl<A: Actor> Context<A> {
    fn new(addr: Addr<A>) -> Self {
        Self { addr, stop: None }
    }

    /// Stop after the current message.
    pub fn stop_now(&mut self) {
        self.stop = Some(Stop::Now);
    }

    /// Stop once every already-buffered message has been processed.
    pub fn stop_after_buffered(&mut self) {
        self.stop = Some(Stop::AfterBuffered);
    }

    /// Handle of the current worker.
    #[must_use]
    pub fn addr(&self) -> Addr<A> {
        self.addr.clone()
    }

    /// Deliver `message` to this worker after `delay`.
    pub fn notify<M>(&self, message: M, delay: Duration)
    where
        M: Message<Result = ()> + Send + 'static,
        A: ContextHandler<M>,
    {
        let addr = self.addr();
        task::spawn(async move {
            time::sleep(delay).await;
            addr.do_send(message).await;
        });
    }

    /// Deliver `M::default()` to this worker every `period`.
    pub fn notify_every<M>(&self, period: Duration)
    where
        M: Message<Result = ()> + Default + Send + 'static,
        A: ContextHandler<M>,
    {
        let addr = self.addr();
        task::spawn(async move {
            loop {
                time::sleep(period).await;
                if addr.is_closed() {
                    break;
                }
                addr.do_send(M::default()).await;
            }
        });
    }
}

/// Handler with access to the worker context.
#[async_trait::async_trait]
pub trait ContextHandler<M: Message>: Actor {
    /// Message handler.
    async fn handle(&mut self, ctx: &mut Context<Self>, message: M) -> M::Result;
}

/// Handler without context access.
#[async_trait::async_trait]
pub trait Handler<M: Message>: Actor {
    /// Message handler.
    async fn handle(&mut self, message: M) -> M::Result;
}

#[async_trait::async_trait]
impl<M, A> ContextHandler<M> for A
where
    M: Message + Send + 'static,
    A: Handler<M>,
{
    async fn handle(&mut self, _: &mut Context<Self>, message: M) -> M::Result {
        Handler::handle(self, message).await
    }
}
