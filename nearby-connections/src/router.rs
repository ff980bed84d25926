// Copyright Nearby Connections Contributors
// SPDX-License-Identifier: Apache-2.0

//! The strategy gate, spec.md §4.2: a single serializer every attached
//! [`crate::session::ClientSession`] goes through before it may advertise or
//! discover, so that only one [`Strategy`] is active process-wide at a time.
//! Implemented the way the teacher drains a command queue on one task rather
//! than guarding shared state with a lock every caller takes directly.

use crate::status::Status;
use crate::strategy::Strategy;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

enum RouterCommand {
    Acquire {
        client_id: u64,
        strategy: Strategy,
        has_connected_endpoints: bool,
        reply: oneshot::Sender<Status>,
    },
    Release {
        client_id: u64,
        reply: oneshot::Sender<()>,
    },
    CurrentStrategy {
        reply: oneshot::Sender<Option<Strategy>>,
    },
}

struct ControllerState {
    strategy: Option<Strategy>,
    active_clients: HashSet<u64>,
}

/// Process-wide arbitrator for which [`Strategy`] is in force. One `Router`
/// is shared by every [`crate::session::ClientSession`] in a process.
pub struct Router {
    commands: mpsc::UnboundedSender<RouterCommand>,
}

impl Router {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run(rx));
        Arc::new(Self { commands: tx })
    }

    async fn run(mut commands: mpsc::UnboundedReceiver<RouterCommand>) {
        let mut state = ControllerState {
            strategy: None,
            active_clients: HashSet::new(),
        };
        while let Some(command) = commands.recv().await {
            match command {
                RouterCommand::Acquire {
                    client_id,
                    strategy,
                    has_connected_endpoints,
                    reply,
                } => {
                    let status =
                        Self::handle_acquire(&mut state, client_id, strategy, has_connected_endpoints);
                    let _ = reply.send(status);
                }
                RouterCommand::Release { client_id, reply } => {
                    state.active_clients.remove(&client_id);
                    if state.active_clients.is_empty() {
                        state.strategy = None;
                    }
                    let _ = reply.send(());
                }
                RouterCommand::CurrentStrategy { reply } => {
                    let _ = reply.send(state.strategy);
                }
            }
        }
    }

    /// spec.md §4.2: a session may join the active strategy, start a fresh
    /// one if none is active, or — as the sole client with no connected
    /// endpoints yet — replace the active one outright. Any other case
    /// reports `AlreadyHaveActiveStrategy`.
    fn handle_acquire(
        state: &mut ControllerState,
        client_id: u64,
        strategy: Strategy,
        has_connected_endpoints: bool,
    ) -> Status {
        match state.strategy {
            None => {
                state.strategy = Some(strategy);
                state.active_clients.insert(client_id);
                Status::Success
            }
            Some(current) if current == strategy => {
                state.active_clients.insert(client_id);
                Status::Success
            }
            Some(_) => {
                let sole_active =
                    state.active_clients.len() == 1 && state.active_clients.contains(&client_id);
                if sole_active && !has_connected_endpoints {
                    state.strategy = Some(strategy);
                    state.active_clients.clear();
                    state.active_clients.insert(client_id);
                    Status::Success
                } else {
                    Status::AlreadyHaveActiveStrategy
                }
            }
        }
    }

    /// Attempts to claim `strategy` on behalf of `client_id`.
    pub async fn acquire(&self, client_id: u64, strategy: Strategy, has_connected_endpoints: bool) -> Status {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(RouterCommand::Acquire {
                client_id,
                strategy,
                has_connected_endpoints,
                reply: reply_tx,
            })
            .is_err()
        {
            return Status::Error;
        }
        reply_rx.await.unwrap_or(Status::Error)
    }

    /// Releases `client_id`'s claim. Idempotent; the active strategy is
    /// cleared once no client holds it.
    pub async fn release(&self, client_id: u64) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(RouterCommand::Release {
                client_id,
                reply: reply_tx,
            })
            .is_err()
        {
            return;
        }
        let _ = reply_rx.await;
    }

    pub async fn current_strategy(&self) -> Option<Strategy> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(RouterCommand::CurrentStrategy { reply: reply_tx })
            .is_err()
        {
            return None;
        }
        reply_rx.await.ok().flatten()
    }
}
