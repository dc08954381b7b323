//! Runtime thread backed by a [`LocalHost`].
//!
//! This module hosts the runtime on a dedicated OS thread with a
//! single-threaded Tokio runtime. Commands from other threads are forwarded
//! through [`RuntimeCommand`] and executed sequentially on that thread; jobs
//! scheduled by threadsafe functions wake the loop and run after every
//! command.

use crate::runtime::config::RuntimeConfig;
use crate::runtime::error::{Error, Result};
use crate::runtime::local::LocalHost;
use std::sync::mpsc::Receiver as StdReceiver;
use std::sync::mpsc::Sender as StdSender;
use std::thread::{JoinHandle, ThreadId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

type InitSignalChannel = (StdSender<Result<()>>, StdReceiver<Result<()>>);

/// Work executed on the runtime thread.
pub type Task = Box<dyn FnOnce(&LocalHost) + Send>;

/// Commands sent to the runtime thread.
pub enum RuntimeCommand {
    Run {
        task: Task,
    },
    /// Jobs were scheduled; run them.
    Wake,
    /// Answer once everything scheduled so far has run.
    Flush {
        responder: StdSender<()>,
    },
    Shutdown {
        responder: StdSender<()>,
    },
}

/// A started runtime thread.
pub struct RuntimeThread {
    pub sender: mpsc::UnboundedSender<RuntimeCommand>,
    pub thread_id: ThreadId,
    pub join: JoinHandle<()>,
}

pub fn spawn_runtime_thread(config: RuntimeConfig) -> Result<RuntimeThread> {
    config.validate()?;

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<RuntimeCommand>();
    let (init_tx, init_rx): InitSignalChannel = std::sync::mpsc::channel();
    let waker = cmd_tx.downgrade();

    let join = std::thread::Builder::new()
        .name(config.thread_name.clone())
        .spawn(move || {
            let tokio_rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    let _ = init_tx.send(Err(Error::Runtime(format!(
                        "failed to build tokio runtime: {err}"
                    ))));
                    return;
                }
            };

            let host = LocalHost::new();
            host.set_job_notifier(move || {
                if let Some(tx) = waker.upgrade() {
                    let _ = tx.send(RuntimeCommand::Wake);
                }
            });
            let mut core = RuntimeCore { host, config };
            let _ = init_tx.send(Ok(()));

            tokio_rt.block_on(async move {
                core.run(cmd_rx).await;
            });
        })
        .map_err(|e| Error::Runtime(format!("Failed to spawn runtime thread: {}", e)))?;

    match init_rx.recv() {
        Ok(Ok(())) => Ok(RuntimeThread {
            sender: cmd_tx,
            thread_id: join.thread().id(),
            join,
        }),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(Error::Runtime(
            "Runtime thread initialization failed".to_string(),
        )),
    }
}

struct RuntimeCore {
    host: LocalHost,
    config: RuntimeConfig,
}

impl RuntimeCore {
    async fn run(&mut self, mut rx: mpsc::UnboundedReceiver<RuntimeCommand>) {
        debug!(thread = %self.config.thread_name, "runtime thread started");
        while let Some(cmd) = rx.recv().await {
            match cmd {
                RuntimeCommand::Run { task } => {
                    task(&self.host);
                    self.host.collect_exception("task");
                    self.host.run_pending_jobs();
                }
                RuntimeCommand::Wake => {
                    self.host.run_pending_jobs();
                }
                RuntimeCommand::Flush { responder } => {
                    self.host.run_pending_jobs();
                    let _ = responder.send(());
                }
                RuntimeCommand::Shutdown { responder } => {
                    self.shutdown();
                    let _ = responder.send(());
                    return;
                }
            }
        }
        // Every handle was dropped without closing.
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.config.drain_jobs_on_shutdown {
            let ran = self.host.run_pending_jobs();
            debug!(jobs = ran, "drained jobs before shutdown");
        } else if self.host.pending_jobs() > 0 {
            warn!(
                jobs = self.host.pending_jobs(),
                "jobs dropped at shutdown without running"
            );
        }

        let env = self.host.env();
        let live = env
            .instance_state()
            .map(|state| state.live_callbacks())
            .unwrap_or(0);
        self.host.teardown();
        debug!(callbacks = live, "runtime torn down");

        let uncaught = self.host.take_uncaught_exceptions();
        if !uncaught.is_empty() {
            warn!(
                count = uncaught.len(),
                "uncaught exceptions were never collected before shutdown"
            );
        }
    }
}
