//! Inbox policies. A worker owns exactly one inbox; the policy decides
//! what happens when producers outpace the worker.

use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use crate::{envelope::Envelope, Actor, Error};

/// Admission policy of a worker inbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mailbox {
    /// Unbounded FIFO.
    Queue,
    /// FIFO with admission control: `try_send` fails when full.
    Bounded(usize),
    /// At most one held message; an incoming message is conflated with
    /// the held one through [`Actor::conflate`].
    Dropbox,
}

pub(crate) enum InboxSender<A: Actor> {
    Queue(mpsc::UnboundedSender<Envelope<A>>),
    Bounded(mpsc::Sender<Envelope<A>>),
    Dropbox(Arc<DropSlot<A>>),
}

impl<A: Actor> Clone for InboxSender<A> {
    fn clone(&self) -> Self {
        match self {
            InboxSender::Queue(sender) => InboxSender::Queue(sender.clone()),
            InboxSender::Bounded(sender) => InboxSender::Bounded(sender.clone()),
            InboxSender::Dropbox(slot) => InboxSender::Dropbox(Arc::clone(slot)),
        }
    }
}

pub(crate) enum InboxReceiver<A: Actor> {
    Queue(mpsc::UnboundedReceiver<Envelope<A>>),
    Bounded(mpsc::Receiver<Envelope<A>>),
    Dropbox(Arc<DropSlot<A>>),
}

/// The single-message slot of a dropbox inbox.
pub(crate) struct DropSlot<A: Actor> {
    held: std::sync::Mutex<Option<Envelope<A>>>,
    available: Notify,
    closed: std::sync::atomic::AtomicBool,
}

impl<A: Actor> DropSlot<A> {
    fn new() -> Self {
        Self {
            held: std::sync::Mutex::new(None),
            available: Notify::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn put(&self, incoming: Envelope<A>) -> Result<(), Error> {
        if self.closed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(Error::SendError);
        }
        let mut held = self.held.lock().expect("INTERNAL BUG: drop slot poisoned");
        *held = Some(match held.take() {
            Some(previous) => A::conflate(previous, incoming),
            None => incoming,
        });
        drop(held);
        self.available.notify_one();
        Ok(())
    }

    async fn take(&self) -> Option<Envelope<A>> {
        loop {
            {
                let mut held = self.held.lock().expect("INTERNAL BUG: drop slot poisoned");
                if let Some(envelope) = held.take() {
                    return Some(envelope);
                }
                if self.closed.load(std::sync::atomic::Ordering::Acquire) {
                    return None;
                }
            }
            self.available.notified().await;
        }
    }

    pub(crate) fn close(&self) {
        self.closed
            .store(true, std::sync::atomic::Ordering::Release);
        self.available.notify_one();
    }
}

pub(crate) fn channel<A: Actor>(mailbox: Mailbox) -> (InboxSender<A>, InboxReceiver<A>) {
    match mailbox {
        Mailbox::Queue => {
            let (sender, receiver) = mpsc::unbounded_channel();
            (InboxSender::Queue(sender), InboxReceiver::Queue(receiver))
        }
        Mailbox::Bounded(capacity) => {
            let (sender, receiver) = mpsc::channel(capacity.max(1));
            (InboxSender::Bounded(sender), InboxReceiver::Bounded(receiver))
        }
        Mailbox::Dropbox => {
            let slot = Arc::new(DropSlot::new());
            (
                InboxSender::Dropbox(Arc::clone(&slot)),
                InboxReceiver::Dropbox(slot),
            )
        }
    }
}

impl<A: Actor> InboxSender<A> {
    /// Deliver, waiting for capacity on a bounded inbox.
    pub(crate) async fn send(&self, envelope: Envelope<A>) -> Result<(), Error> {
        match self {
            InboxSender::Queue(sender) => {
                sender.send(envelope).map_err(|_| Error::SendError)
            }
            InboxSender::Bounded(sender) => {
                sender.send(envelope).await.map_err(|_| Error::SendError)
            }
            InboxSender::Dropbox(slot) => slot.put(envelope),
        }
    }

    /// Deliver without waiting; a full bounded inbox refuses admission.
    pub(crate) fn try_send(&self, envelope: Envelope<A>) -> Result<(), Error> {
        match self {
            InboxSender::Queue(sender) => {
                sender.send(envelope).map_err(|_| Error::SendError)
            }
            InboxSender::Bounded(sender) => sender.try_send(envelope).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => Error::MailboxFull,
                mpsc::error::TrySendError::Closed(_) => Error::SendError,
            }),
            InboxSender::Dropbox(slot) => slot.put(envelope),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        match self {
            InboxSender::Queue(sender) => sender.is_closed(),
            InboxSender::Bounded(sender) => sender.is_closed(),
            InboxSender::Dropbox(slot) => {
                slot.closed.load(std::sync::atomic::Ordering::Acquire)
            }
        }
    }
}

impl<A: Actor> InboxReceiver<A> {
    pub(crate) async fn recv(&mut self) -> Option<Envelope<A>> {
        match self {
            InboxReceiver::Queue(receiver) => receiver.recv().await,
            InboxReceiver::Bounded(receiver) => receiver.recv().await,
            InboxReceiver::Dropbox(slot) => slot.take().await,
        }
    }

    pub(crate) fn close(&mut self) {
        match self {
            InboxReceiver::Queue(receiver) => receiver.close(),
            InboxReceiver::Bounded(receiver) => receiver.close(),
            InboxReceiver::Dropbox(slot) => slot.close(),
        }
    }
}
