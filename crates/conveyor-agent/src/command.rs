//! The cancel/stop channel shared by signal handlers, the updater and the
//! runner.

use std::sync::Arc;

use conveyor_core::protocol::Command;
use tokio::sync::watch;

/// Holds the most urgent pending command. `Stop` outranks `Cancel` and is
/// never downgraded until the command is cleared.
#[derive(Clone)]
pub struct CommandSignal {
    tx: Arc<watch::Sender<Option<Command>>>,
}

impl CommandSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn raise(&self, command: Command) {
        self.tx.send_modify(|current| {
            if *current != Some(Command::Stop) {
                *current = Some(command);
            }
        });
    }

    pub fn current(&self) -> Option<Command> {
        *self.tx.borrow()
    }

    pub fn clear(&self) {
        self.tx.send_replace(None);
    }

    /// Resolves as soon as a command is pending, immediately if one already is.
    pub async fn raised(&self) -> Command {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(command) = *rx.borrow_and_update() {
                return command;
            }
            if rx.changed().await.is_err() {
                // The sender lives in `self`, so this never happens.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CommandSignal {
    fn default() -> Self {
        Self::new()
    }
}
