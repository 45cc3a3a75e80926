//! Outbound command gateway
//!
//! Commands are handed to the connection's writer task through an unbounded
//! channel, so issuing one never waits on inbound processing. While no link
//! is attached they wait in a FIFO queue.

use crate::connection::LinkHandle;
use crate::error::ChatError;
use crate::protocol::{CommandKind, PendingCommand};
use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot};

type Ack = oneshot::Sender<Result<(), ChatError>>;

/// Encoded command on its way to the socket
#[derive(Debug)]
pub struct OutboundFrame {
    pub kind: CommandKind,
    pub conversation_id: String,
    pub text: String,
    ack: Option<Ack>,
}

impl OutboundFrame {
    fn new(command: &PendingCommand, ack: Option<Ack>) -> Self {
        Self {
            kind: command.kind,
            conversation_id: command.conversation_id.clone(),
            text: command.to_frame(),
            ack,
        }
    }

    /// Report the write outcome to whoever holds the `Delivery`
    pub fn resolve(self, result: Result<(), ChatError>) {
        if let Some(ack) = self.ack {
            // Receiver may have been dropped, nobody is waiting then
            let _ = ack.send(result);
        }
    }
}

/// Resolves once the command is written to the socket
#[derive(Debug)]
#[must_use = "a Delivery can be awaited or dropped, dropping does not cancel the command"]
pub struct Delivery {
    rx: Option<oneshot::Receiver<Result<(), ChatError>>>,
}

impl Delivery {
    /// Fire-and-forget commands are never tracked
    fn untracked() -> Self {
        Self { rx: None }
    }

    pub async fn confirmed(self) -> Result<(), ChatError> {
        match self.rx {
            None => Ok(()),
            Some(rx) => rx.await.unwrap_or(Err(ChatError::ConnectionClosed)),
        }
    }
}

/// Queues commands and feeds the writer task
#[derive(Debug, Default)]
pub struct CommandGateway {
    link: Option<mpsc::UnboundedSender<OutboundFrame>>,
    /// Link last attached; kept after its writer dies, cleared by `detach`
    epoch: Option<u64>,
    pending: VecDeque<OutboundFrame>,
}

impl CommandGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a command, or queue it until a link is attached
    pub fn submit(&mut self, command: &PendingCommand) -> Delivery {
        if command.kind == CommandKind::Typing {
            if !self.is_attached() {
                // Only the latest typing value per conversation matters
                self.pending
                    .retain(|f| !(f.kind == CommandKind::Typing && f.conversation_id == command.conversation_id));
            }
            self.dispatch(OutboundFrame::new(command, None));
            return Delivery::untracked();
        }

        let (tx, rx) = oneshot::channel();
        self.dispatch(OutboundFrame::new(command, Some(tx)));
        Delivery { rx: Some(rx) }
    }

    /// Attach a live link and flush queued commands in issue order
    pub fn attach(&mut self, link: LinkHandle) {
        let queued = self.pending.len();
        self.link = Some(link.outbound);
        self.epoch = Some(link.epoch);
        while let Some(frame) = self.pending.pop_front() {
            if !self.forward(frame) {
                break;
            }
        }
        if queued > 0 {
            tracing::debug!(queued, "Flushed queued commands");
        }
    }

    /// Stop forwarding; later commands queue up again
    pub fn detach(&mut self) {
        self.link = None;
        self.epoch = None;
    }

    /// Fail every queued command with `ConnectionClosed`
    pub fn reject_pending(&mut self) -> usize {
        let rejected = self.pending.len();
        for frame in self.pending.drain(..) {
            frame.resolve(Err(ChatError::ConnectionClosed));
        }
        rejected
    }

    pub fn is_attached(&self) -> bool {
        self.link.as_ref().is_some_and(|link| !link.is_closed())
    }

    /// Epoch of the link the gateway was last attached to
    pub fn epoch(&self) -> Option<u64> {
        self.epoch
    }

    /// Epoch of the link a command submitted now would be written to.
    /// `None` means it waits for the next link.
    pub fn writing_epoch(&self) -> Option<u64> {
        if self.is_attached() {
            self.epoch
        } else {
            None
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn dispatch(&mut self, frame: OutboundFrame) {
        if self.link.is_some() {
            self.forward(frame);
        } else {
            self.pending.push_back(frame);
        }
    }

    /// Returns false when the writer is gone and the frame went back to the queue
    fn forward(&mut self, frame: OutboundFrame) -> bool {
        let Some(link) = &self.link else {
            self.pending.push_back(frame);
            return false;
        };
        match link.send(frame) {
            Ok(()) => true,
            Err(mpsc::error::SendError(frame)) => {
                tracing::debug!("Writer gone, queueing command");
                self.link = None;
                self.pending.push_front(frame);
                false
            }
        }
    }
}
