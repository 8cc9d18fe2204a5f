//! Type-erased message envelopes. Each envelope carries one message and
//! the oneshot channel its typed response travels back on.

use std::any::Any;

use tokio::sync::oneshot;

use crate::{Actor, Context, ContextHandler, Message};

/// A message addressed to actor `A`, with its reply channel.
pub struct Envelope<A: Actor>(Box<dyn EnvelopeProxy<A> + Send>);

impl<A: Actor> Envelope<A> {
    pub(crate) fn pack<M>(message: M, reply: Option<oneshot::Sender<M::Result>>) -> Self
    where
        M: Message + Send + 'static,
        M::Result: Send,
        A: ContextHandler<M>,
    {
        Envelope(Box::new(SyncEnvelope {
            message: Some(message),
            reply,
        }))
    }

    pub(crate) async fn handle(mut self, actor: &mut A, ctx: &mut Context<A>) {
        self.0.handle(actor, ctx).await;
    }

    /// Whether this envelope wraps a message of type `M`.
    #[must_use]
    pub fn is<M>(&self) -> bool
    where
        M: Message + Send + 'static,
        M::Result: Send,
        A: ContextHandler<M>,
    {
        self.message::<M>().is_some()
    }

    /// Peek at the wrapped message, if it has type `M`.
    #[must_use]
    pub fn message<M>(&self) -> Option<&M>
    where
        M: Message + Send + 'static,
        M::Result: Send,
        A: ContextHandler<M>,
    {
        self.0
            .as_any()
            .downcast_ref::<SyncEnvelope<M>>()
            .and_then(|envelope| envelope.message.as_ref())
    }
}

#[async_trait::async_trait]
trait EnvelopeProxy<A: Actor>: Send {
    async fn handle(&mut self, actor: &mut A, ctx: &mut Context<A>);
    fn as_any(&self) -> &dyn Any;
}

struct SyncEnvelope<M: Message> {
    message: Option<M>,
    reply: Option<oneshot::Sender<M::Result>>,
}

#[async_trait::async_trait]
impl<A, M> EnvelopeProxy<A> for SyncEnvelope<M>
where
    A: ContextHandler<M>,
    M: Message + Send + 'static,
    M::Result: Send,
{
    async fn handle(&mut self, actor: &mut A, ctx: &mut Context<A>) {
        let message = self
            .message
            .take()
            .expect("INTERNAL BUG: envelope handled twice");
        let result = actor.handle(ctx, message).await;
        if let Some(reply) = self.reply.take() {
            // The caller may have stopped waiting; that is not an error.
            drop(reply.send(result));
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
