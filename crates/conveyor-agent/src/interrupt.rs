//! OS signals mapped onto agent commands.
//!
//! SIGUSR1 and SIGINT cancel the running job, SIGUSR2 and SIGTERM stop it.
//! Either way the main loop exits once the current iteration is done.

use std::sync::Arc;

use conveyor_core::protocol::Command;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::command::CommandSignal;

#[derive(Clone)]
pub struct Interrupts {
    commands: CommandSignal,
    received: Arc<watch::Sender<bool>>,
}

impl Interrupts {
    pub fn new(commands: CommandSignal) -> Self {
        let (received, _) = watch::channel(false);
        Self {
            commands,
            received: Arc::new(received),
        }
    }

    /// Install the signal handlers on a background task.
    pub fn listen(&self) -> std::io::Result<JoinHandle<()>> {
        let mut usr1 = signal(SignalKind::user_defined1())?;
        let mut int = signal(SignalKind::interrupt())?;
        let mut usr2 = signal(SignalKind::user_defined2())?;
        let mut term = signal(SignalKind::terminate())?;
        let this = self.clone();
        Ok(tokio::spawn(async move {
            loop {
                let (name, command) = tokio::select! {
                    _ = usr1.recv() => ("SIGUSR1", Command::Cancel),
                    _ = int.recv() => ("SIGINT", Command::Cancel),
                    _ = usr2.recv() => ("SIGUSR2", Command::Stop),
                    _ = term.recv() => ("SIGTERM", Command::Stop),
                };
                info!(signal = name, command = ?command, "Received signal");
                this.trigger(command);
            }
        }))
    }

    pub fn trigger(&self, command: Command) {
        self.commands.raise(command);
        self.received.send_replace(true);
    }

    pub fn received(&self) -> bool {
        *self.received.borrow()
    }

    /// Resolves once any signal has arrived.
    pub async fn wait(&self) {
        let mut rx = self.received.subscribe();
        // The sender lives in `self`, so this only returns once triggered.
        let _ = rx.wait_for(|received| *received).await;
    }
}
