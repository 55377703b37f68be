//! Purpose: A named thread that runs a closure on a fixed period until stopped.
//! Exports: `Ticker`.
//! Role: Shared lifecycle for the reclaim daemon, handle heartbeats, and event listeners.
//! Invariants: Dropping a `Ticker` stops its thread and waits for the running tick.
//! Invariants: A tick returning `ControlFlow::Break` ends the thread without a stop signal.

use std::ops::ControlFlow;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::warn;

use crate::core::error::{Error, ErrorKind};

pub struct Ticker {
    name: String,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Ticker {
    /// Runs `tick` immediately, then once per `period`.
    pub fn spawn(
        name: impl Into<String>,
        period: Duration,
        mut tick: impl FnMut() -> ControlFlow<()> + Send + 'static,
    ) -> Result<Self, Error> {
        let name = name.into();
        let (stop, stopped) = mpsc::channel::<()>();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                loop {
                    if tick().is_break() {
                        break;
                    }
                    match stopped.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message(format!("failed to start {name} thread"))
                    .with_source(err)
            })?;
        Ok(Self {
            name,
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|thread| !thread.is_finished())
    }

    /// Signals the thread and joins it. Called from the ticker's own thread it
    /// only signals, since a thread cannot join itself.
    pub fn stop(&mut self) -> Result<(), Error> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        if thread.thread().id() == thread::current().id() {
            return Ok(());
        }
        thread.join().map_err(|_| {
            Error::new(ErrorKind::Internal).with_message(format!("{} thread panicked", self.name))
        })
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(error = %err, "background thread did not stop cleanly");
        }
    }
}

impl std::fmt::Debug for Ticker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticker")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}
