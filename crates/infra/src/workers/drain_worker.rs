use std::io;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use civitas_events::{CommitNotice, EventBus, Subscription};

use crate::drain::Dispatcher;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    ///
    /// A drain in progress finishes its current record first.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!(worker = %self.name, "drain worker panicked");
            }
        }
    }
}

/// Background loop draining a single consumer.
///
/// - wakes on every commit notice, and on each poll tick
/// - coalesces queued notices into one drain
/// - a failed drain is logged and retried on the next wake-up
#[derive(Debug)]
pub struct DrainWorker;

impl DrainWorker {
    pub fn spawn(
        dispatcher: Arc<Dispatcher>,
        consumer: &'static str,
        notices: Option<Subscription<CommitNotice>>,
        poll_interval: Duration,
    ) -> io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let name = format!("drain-{consumer}");

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(&dispatcher, consumer, notices, shutdown_rx, poll_interval))?;

        Ok(WorkerHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }

    /// One worker per registered consumer, each with its own subscription.
    pub fn spawn_all<B>(dispatcher: Arc<Dispatcher>, bus: Option<&B>) -> io::Result<Vec<WorkerHandle>>
    where
        B: EventBus<CommitNotice> + ?Sized,
    {
        let interval = dispatcher.config().poll_interval;
        let mut handles = Vec::with_capacity(dispatcher.consumer_names().len());
        for &consumer in dispatcher.consumer_names() {
            let notices = bus.map(|bus| bus.subscribe());
            match Self::spawn(dispatcher.clone(), consumer, notices, interval) {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    for handle in handles {
                        handle.shutdown();
                    }
                    return Err(err);
                }
            }
        }
        info!(workers = handles.len(), "drain workers started");
        Ok(handles)
    }
}

fn worker_loop(
    dispatcher: &Dispatcher,
    consumer: &'static str,
    notices: Option<Subscription<CommitNotice>>,
    shutdown_rx: mpsc::Receiver<()>,
    poll_interval: Duration,
) {
    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        match dispatcher.drain(consumer) {
            Ok(report) if report.progressed() > 0 || report.blocked_at.is_some() => {
                debug!(
                    consumer,
                    applied = report.applied,
                    dead_lettered = report.dead_lettered,
                    blocked_at = ?report.blocked_at,
                    "drain pass"
                );
            }
            Ok(_) => {}
            Err(err) => warn!(consumer, error = %err, "drain failed"),
        }

        match &notices {
            Some(sub) => match sub.recv_timeout(poll_interval) {
                Ok(_) => {
                    sub.drain_pending();
                }
                Err(RecvTimeoutError::Timeout) => {}
                // Bus gone: keep polling.
                Err(RecvTimeoutError::Disconnected) => match shutdown_rx.recv_timeout(poll_interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                },
            },
            None => match shutdown_rx.recv_timeout(poll_interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            },
        }
    }
    debug!(consumer, "drain worker stopped");
}
