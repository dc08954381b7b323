//! Thread-safe handle for interacting with the runtime thread.

use crate::runtime::callback::IntoCallback;
use crate::runtime::config::RuntimeConfig;
use crate::runtime::env::Env;
use crate::runtime::error::{Error, Result};
use crate::runtime::js_value::JSValue;
use crate::runtime::local::LocalHost;
use crate::runtime::runner::{spawn_runtime_thread, RuntimeCommand, Task};
use crate::runtime::sys::Status;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::mpsc as async_mpsc;
use tokio::sync::oneshot;

#[derive(Clone)]
pub struct RuntimeHandle {
    tx: Option<async_mpsc::UnboundedSender<RuntimeCommand>>,
    shutdown: Arc<Mutex<bool>>,
    join: Arc<Mutex<Option<JoinHandle<()>>>>,
    thread_id: ThreadId,
    config: Arc<RuntimeConfig>,
}

impl RuntimeHandle {
    pub fn spawn(config: RuntimeConfig) -> Result<Self> {
        let thread = spawn_runtime_thread(config.clone())?;
        Ok(Self {
            tx: Some(thread.sender),
            shutdown: Arc::new(Mutex::new(false)),
            join: Arc::new(Mutex::new(Some(thread.join))),
            thread_id: thread.thread_id,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn shutdown_flag(&self) -> MutexGuard<'_, bool> {
        self.shutdown.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sender(&self) -> Result<&async_mpsc::UnboundedSender<RuntimeCommand>> {
        if *self.shutdown_flag() {
            return Err(Error::Runtime("Runtime has been shut down".to_string()));
        }
        self.tx
            .as_ref()
            .ok_or_else(|| Error::Runtime("Runtime has been shut down".to_string()))
    }

    /// Blocking waits on the runtime thread itself could never finish.
    fn check_not_runtime_thread(&self) -> Result<()> {
        if thread::current().id() == self.thread_id {
            return Err(Error::WouldDeadlock);
        }
        Ok(())
    }

    fn send_task(&self, task: Task, what: &str) -> Result<()> {
        self.sender()?
            .send(RuntimeCommand::Run { task })
            .map_err(|_| Error::Runtime(format!("Failed to send {what} command")))
    }

    /// Run `f` on the runtime thread and wait for its result.
    pub fn run_sync<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Env) -> R + Send + 'static,
    {
        self.with_host(move |host| f(&host.env()))
    }

    /// Like [`RuntimeHandle::run_sync`], with access to the host itself.
    pub fn with_host<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&LocalHost) -> R + Send + 'static,
    {
        self.check_not_runtime_thread()?;
        let (result_tx, result_rx) = mpsc::channel();

        self.send_task(
            Box::new(move |host: &LocalHost| {
                let _ = result_tx.send(f(host));
            }),
            "run",
        )?;

        result_rx
            .recv()
            .map_err(|_| Error::Runtime("Failed to receive run result".to_string()))
    }

    /// Run `f` on the runtime thread without blocking the caller.
    ///
    /// Fails after the configured call timeout; `f` still runs to completion
    /// on the runtime thread.
    pub async fn run_async<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&Env) -> R + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();

        self.send_task(
            Box::new(move |host: &LocalHost| {
                let _ = result_tx.send(f(&host.env()));
            }),
            "run_async",
        )?;

        let received = match self.config.call_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, result_rx)
                .await
                .map_err(|_| {
                    Error::Runtime(format!(
                        "Call timed out after {}ms",
                        timeout.as_millis()
                    ))
                })?,
            None => result_rx.await,
        };
        received.map_err(|_| Error::Runtime("Failed to receive async run result".to_string()))
    }

    /// Register `callback` as the global function `name`.
    pub fn register_function<M, C>(&self, name: &str, callback: C) -> Result<()>
    where
        M: 'static,
        C: IntoCallback<M> + Send + 'static,
    {
        let name = name.to_string();
        self.run_sync(move |env| {
            let function = env.new_function(&name, callback)?;
            env.global()?.set_named(&name, &function)
        })?
    }

    /// Call the global function `name` with `args` and snapshot its result.
    pub fn call_global(&self, name: &str, args: Vec<JSValue>) -> Result<JSValue> {
        let name = name.to_string();
        let (depth, bytes) = (self.config.max_snapshot_depth, self.config.max_snapshot_bytes);
        self.run_sync(move |env| {
            let callee = env.global()?.get_named(&name)?;
            if !callee.is_function()? {
                return Err(Error::Runtime(format!("'{name}' is not a function")));
            }
            let args = args
                .into_iter()
                .map(|arg| env.value_of(arg))
                .collect::<Result<Vec<_>>>()?;
            match callee.as_function()?.invoke(&args) {
                Ok(result) => result.to_snapshot_with_limits(depth, bytes),
                Err(err @ Error::Status(Status::PendingException)) => Err(env.catch_exception(err)),
                Err(err) => Err(err),
            }
        })?
    }

    /// Wait until every job scheduled before this call has run.
    pub fn flush(&self) -> Result<()> {
        self.check_not_runtime_thread()?;
        let (result_tx, result_rx) = mpsc::channel();
        self.sender()?
            .send(RuntimeCommand::Flush {
                responder: result_tx,
            })
            .map_err(|_| Error::Runtime("Failed to send flush command".to_string()))?;
        result_rx
            .recv()
            .map_err(|_| Error::Runtime("Failed to receive flush result".to_string()))
    }

    /// Messages of exceptions that escaped jobs or tasks since the last call.
    pub fn take_uncaught_exceptions(&self) -> Result<Vec<String>> {
        self.with_host(|host| host.take_uncaught_exceptions())
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_flag()
    }

    pub fn close(&mut self) -> Result<()> {
        self.check_not_runtime_thread()?;
        let mut shutdown_guard = self.shutdown.lock().unwrap_or_else(PoisonError::into_inner);
        if *shutdown_guard {
            return Ok(());
        }

        if let Some(tx) = self.tx.take() {
            let (result_tx, result_rx) = mpsc::channel();
            if tx
                .send(RuntimeCommand::Shutdown {
                    responder: result_tx,
                })
                .is_err()
            {
                return Err(Error::Runtime("Failed to send shutdown command".to_string()));
            }

            match result_rx.recv() {
                Ok(_) => {
                    *shutdown_guard = true;
                }
                Err(_) => {
                    return Err(Error::Runtime(
                        "Failed to confirm runtime shutdown".to_string(),
                    ));
                }
            }
        }

        let join = self.join.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(join) = join {
            join.join()
                .map_err(|_| Error::Runtime("Runtime thread panicked".to_string()))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("thread", &self.config.thread_name)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
