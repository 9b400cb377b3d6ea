//! Session task: runs an [`InboundSession`] on its own tokio task
//!
//! Transport and subscription events arrive as commands on a bounded
//! channel; a full channel backpressures the transport reader. Application
//! signals arrive on the unbounded signal channel and are handled first.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{InboundSession, PacketSender};
use crate::error::{SessionEndCause, SessionError};
use crate::flow::{GlobalFilter, PublishFlow, SignalReceiver};
use crate::protocol::{ProtocolError, PubRel, Publish, ReasonCode};
use crate::topic::{Subscription, TopicFilter};

type Reply<T> = oneshot::Sender<T>;

enum Command {
    Connect(PacketSender, Reply<u64>),
    Disconnect,
    Publish(Publish, Reply<Result<(), ProtocolError>>),
    PubRel(PubRel, Reply<Result<(), ProtocolError>>),
    Subscribe {
        subscriptions: Vec<Subscription>,
        subscription_identifier: Option<u32>,
        manual_acknowledgement: bool,
        reply: Reply<PublishFlow>,
    },
    SubAck {
        subscriptions: Vec<Subscription>,
        subscription_identifier: Option<u32>,
        reason_codes: Vec<ReasonCode>,
    },
    Unsubscribe {
        filters: Vec<TopicFilter>,
        reason_codes: Vec<ReasonCode>,
    },
    SubscribeGlobal {
        filter: GlobalFilter,
        manual_acknowledgement: bool,
        reply: Reply<PublishFlow>,
    },
    Subscriptions(Reply<Vec<(Option<u32>, Vec<Subscription>)>>),
    End(SessionEndCause),
}

/// Cloneable handle to a running session task
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
}

impl SessionHandle {
    async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx)).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub async fn connect(&self, outbound: PacketSender) -> Result<u64, SessionError> {
        self.call(|reply| Command::Connect(outbound, reply)).await
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        self.send(Command::Disconnect).await
    }

    /// Hand a decoded PUBLISH to the session; waits until it is admitted
    pub async fn publish(&self, publish: Publish) -> Result<(), SessionError> {
        self.call(|reply| Command::Publish(publish, reply))
            .await?
            .map_err(SessionError::Protocol)
    }

    pub async fn pubrel(&self, pubrel: PubRel) -> Result<(), SessionError> {
        self.call(|reply| Command::PubRel(pubrel, reply))
            .await?
            .map_err(SessionError::Protocol)
    }

    pub async fn subscribe(
        &self,
        subscriptions: Vec<Subscription>,
        subscription_identifier: Option<u32>,
        manual_acknowledgement: bool,
    ) -> Result<PublishFlow, SessionError> {
        self.call(|reply| Command::Subscribe {
            subscriptions,
            subscription_identifier,
            manual_acknowledgement,
            reply,
        })
        .await
    }

    pub async fn sub_ack(
        &self,
        subscriptions: Vec<Subscription>,
        subscription_identifier: Option<u32>,
        reason_codes: Vec<ReasonCode>,
    ) -> Result<(), SessionError> {
        self.send(Command::SubAck {
            subscriptions,
            subscription_identifier,
            reason_codes,
        })
        .await
    }

    pub async fn unsubscribe(
        &self,
        filters: Vec<TopicFilter>,
        reason_codes: Vec<ReasonCode>,
    ) -> Result<(), SessionError> {
        self.send(Command::Unsubscribe {
            filters,
            reason_codes,
        })
        .await
    }

    pub async fn subscribe_global(
        &self,
        filter: GlobalFilter,
        manual_acknowledgement: bool,
    ) -> Result<PublishFlow, SessionError> {
        self.call(|reply| Command::SubscribeGlobal {
            filter,
            manual_acknowledgement,
            reply,
        })
        .await
    }

    pub async fn subscriptions(
        &self,
    ) -> Result<Vec<(Option<u32>, Vec<Subscription>)>, SessionError> {
        self.call(Command::Subscriptions).await
    }

    /// End the session; the task exits once the command is handled
    pub async fn end(&self, cause: SessionEndCause) -> Result<(), SessionError> {
        self.send(Command::End(cause)).await
    }
}

/// Run `session` on a new task
///
/// `signals` must be the receiving half of the channel the session was
/// created with. The task ends on [`SessionHandle::end`] or once every
/// handle is dropped.
pub fn spawn(
    session: InboundSession,
    signals: SignalReceiver,
    capacity: usize,
) -> (SessionHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let task = tokio::spawn(run(session, signals, rx));
    (SessionHandle { commands: tx }, task)
}

async fn run(
    mut session: InboundSession,
    mut signals: SignalReceiver,
    mut commands: mpsc::Receiver<Command>,
) {
    loop {
        tokio::select! {
            biased;

            // The session holds a sender itself, so this never yields None
            Some(signal) = signals.recv() => {
                session.handle_signal(signal);
            }

            command = commands.recv() => {
                match command {
                    Some(command) => {
                        if !handle_command(&mut session, command) {
                            break;
                        }
                    }
                    None => {
                        debug!("all session handles dropped");
                        session.end(SessionEndCause::Closed);
                        break;
                    }
                }
            }
        }
    }
    info!("session task stopped");
}

/// Returns `false` once the session has ended
fn handle_command(session: &mut InboundSession, command: Command) -> bool {
    // A dropped reply receiver only means the caller stopped waiting
    match command {
        Command::Connect(outbound, reply) => {
            let _ = reply.send(session.connect(outbound));
        }
        Command::Disconnect => session.disconnect(),
        Command::Publish(publish, reply) => {
            let _ = reply.send(session.on_publish(publish));
        }
        Command::PubRel(pubrel, reply) => {
            let _ = reply.send(session.on_pubrel(pubrel));
        }
        Command::Subscribe {
            subscriptions,
            subscription_identifier,
            manual_acknowledgement,
            reply,
        } => {
            let flow = session.subscribe(
                &subscriptions,
                subscription_identifier,
                manual_acknowledgement,
            );
            let _ = reply.send(flow);
        }
        Command::SubAck {
            subscriptions,
            subscription_identifier,
            reason_codes,
        } => session.sub_ack(&subscriptions, subscription_identifier, &reason_codes),
        Command::Unsubscribe {
            filters,
            reason_codes,
        } => session.unsubscribe(&filters, &reason_codes),
        Command::SubscribeGlobal {
            filter,
            manual_acknowledgement,
            reply,
        } => {
            let _ = reply.send(session.subscribe_global(filter, manual_acknowledgement));
        }
        Command::Subscriptions(reply) => {
            let _ = reply.send(session.subscriptions());
        }
        Command::End(cause) => {
            session.end(cause);
            return false;
        }
    }
    true
}
