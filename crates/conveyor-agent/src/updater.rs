//! Ordered, retried delivery of reports to the servers.
//!
//! The updater runs as its own task and owns the outbound queue and the
//! per-server contact times. Everything else talks to it over a channel.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use conveyor_config::ServerEntry;
use conveyor_core::ResourceId;
use conveyor_core::protocol::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::command::CommandSignal;
use crate::transport::{Message, ServerApi};

/// A report addressed to the server that handed out the job.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub server: ServerEntry,
    pub job_id: ResourceId,
    pub message: Message,
}

enum Control {
    Report(Outbound),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Handle the runner uses to queue reports.
#[derive(Clone)]
pub struct ReportSender {
    tx: mpsc::UnboundedSender<Control>,
}

impl ReportSender {
    pub fn send(&self, outbound: Outbound) {
        if self.tx.send(Control::Report(outbound)).is_err() {
            warn!("Server updater is gone, dropping report");
        }
    }
}

pub struct ServerUpdater {
    tx: mpsc::UnboundedSender<Control>,
    handle: JoinHandle<()>,
}

impl ServerUpdater {
    /// Start the updater task.
    ///
    /// `batch_wait` bounds how long it waits for new reports before
    /// retrying undelivered ones; servers not contacted within
    /// `ping_interval` get a ping.
    pub fn spawn(
        api: Arc<dyn ServerApi>,
        servers: Vec<ServerEntry>,
        commands: CommandSignal,
        batch_wait: Duration,
        ping_interval: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let now = Instant::now();
        let last_contact = servers.iter().map(|s| (s.url.clone(), now)).collect();
        let task = UpdaterTask {
            api,
            rx,
            commands,
            servers,
            batch_wait,
            ping_interval,
            queue: VecDeque::new(),
            last_contact,
            waiters: Vec::new(),
        };
        let handle = tokio::spawn(task.run());
        Self { tx, handle }
    }

    pub fn reports(&self) -> ReportSender {
        ReportSender {
            tx: self.tx.clone(),
        }
    }

    /// Wait until every queued report is delivered. False on timeout.
    pub async fn flush(&self, wait: Duration) -> bool {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Control::Flush(done_tx)).is_err() {
            return false;
        }
        matches!(tokio::time::timeout(wait, done_rx).await, Ok(Ok(())))
    }

    /// Stop the task after one last delivery attempt. False if it had to be
    /// abandoned.
    pub async fn shutdown(self, wait: Duration) -> bool {
        let _ = self.tx.send(Control::Shutdown);
        let abort = self.handle.abort_handle();
        match tokio::time::timeout(wait, self.handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!("Server updater did not finish, some reports were not delivered");
                abort.abort();
                false
            }
        }
    }
}

struct UpdaterTask {
    api: Arc<dyn ServerApi>,
    rx: mpsc::UnboundedReceiver<Control>,
    commands: CommandSignal,
    servers: Vec<ServerEntry>,
    batch_wait: Duration,
    ping_interval: Duration,
    queue: VecDeque<Outbound>,
    last_contact: HashMap<String, Instant>,
    waiters: Vec<oneshot::Sender<()>>,
}

impl UpdaterTask {
    async fn run(mut self) {
        let mut running = true;
        while running {
            running = self.read_queue().await;
            self.send_messages().await;
            self.ping_servers().await;
        }
        self.send_messages().await;
        debug!(undelivered = self.queue.len(), "Server updater stopped");
    }

    /// Block for the first control message, then take whatever else is
    /// already waiting. Returns false once shutdown was requested.
    async fn read_queue(&mut self) -> bool {
        let first = match tokio::time::timeout(self.batch_wait, self.rx.recv()).await {
            Ok(Some(control)) => control,
            Ok(None) => return false,
            Err(_) => return true,
        };
        let mut running = self.accept(first);
        while let Ok(control) = self.rx.try_recv() {
            running &= self.accept(control);
        }
        running
    }

    fn accept(&mut self, control: Control) -> bool {
        match control {
            Control::Report(outbound) => {
                self.queue.push_back(outbound);
                true
            }
            Control::Flush(waiter) => {
                self.waiters.push(waiter);
                true
            }
            Control::Shutdown => {
                info!("Server updater shutting down");
                false
            }
        }
    }

    async fn send_messages(&mut self) {
        while let Some(next) = self.queue.front() {
            let result = self.api.post(&next.server, &next.message).await;
            self.last_contact
                .insert(next.server.url.clone(), Instant::now());

            let reply = match result {
                Ok(reply) => reply,
                Err(e) => {
                    // Later reports stay behind this one to keep the order.
                    warn!(error = %e, pending = self.queue.len(), "Report not delivered, will retry");
                    break;
                }
            };
            let Some(sent) = self.queue.pop_front() else {
                break;
            };

            if reply.status != "OK" {
                error!(job_id = %sent.job_id, status = %reply.status, message = %reply.message, "Server reported an error");
            }
            match reply.command {
                Some(Command::Cancel) => {
                    info!(job_id = %sent.job_id, "Server asked to cancel the job");
                    self.commands.raise(Command::Cancel);
                }
                Some(Command::Stop) => {
                    info!(job_id = %sent.job_id, "Server asked to stop the job");
                    self.commands.raise(Command::Stop);
                    let before = self.queue.len();
                    self.queue.retain(|queued| queued.job_id != sent.job_id);
                    debug!(dropped = before - self.queue.len(), "Dropped reports of stopped job");
                }
                None => {}
            }
        }

        if self.queue.is_empty() {
            for waiter in self.waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    async fn ping_servers(&mut self) {
        for server in &self.servers {
            let due = self
                .last_contact
                .get(&server.url)
                .is_none_or(|last| last.elapsed() >= self.ping_interval);
            if !due {
                continue;
            }
            if let Err(e) = self.api.ping(server).await {
                debug!(server = %server.url, error = %e, "Ping failed");
            }
            // Failed pings count too, so a dead server is not hammered.
            self.last_contact
                .insert(server.url.clone(), Instant::now());
        }
    }
}
