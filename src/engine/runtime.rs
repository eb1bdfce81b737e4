//! Threaded shell around the engine core.
//!
//! One engine thread owns the `EngineCore` and is the only writer; a
//! submit worker runs the blocking transport calls; a poll thread ticks at
//! the configured interval and wakes early after confirmations. Everything
//! meets over channels, so ordering between interleaved completions is
//! decided in one place: the engine thread's inbox.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};

use crate::config::Config;
use crate::core::identity::{CorrelationId, TargetKey};
use crate::core::merge::{Matcher, MergedView};
use crate::core::record::{SubmitFailure, SubmitOk};
use crate::core::snapshot::Canonical;

use super::broadcast::{StatusFilter, StatusSubscription};
use super::core::{CompletionOutcome, EngineCore, EngineError, SupersedeIntent};
use super::transport::Transport;

enum Command<P, T> {
    Submit {
        payload: P,
        target: TargetKey,
        intent: SupersedeIntent,
        reply: Sender<Result<CorrelationId, EngineError>>,
    },
    Retry {
        correlation_id: CorrelationId,
        reply: Sender<Result<CorrelationId, EngineError>>,
    },
    Discard {
        correlation_id: CorrelationId,
        reply: Sender<Result<(), EngineError>>,
    },
    View {
        reply: Sender<MergedView<P, T>>,
    },
    Subscribe {
        filter: StatusFilter,
        reply: Sender<crate::Result<StatusSubscription>>,
    },
    Completion {
        correlation_id: CorrelationId,
        result: Result<SubmitOk<T>, SubmitFailure>,
    },
    Snapshot {
        items: Vec<T>,
    },
    Shutdown,
}

struct SubmitJob<P> {
    correlation_id: CorrelationId,
    payload: P,
}

struct PollWake;

/// Cloneable front door to a running engine.
///
/// Calls block until the engine thread answers; `Terminated` after
/// shutdown.
pub struct EngineHandle<P, T> {
    commands: Sender<Command<P, T>>,
}

impl<P, T> Clone for EngineHandle<P, T> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
        }
    }
}

impl<P, T> EngineHandle<P, T> {
    pub fn submit(
        &self,
        payload: P,
        target: TargetKey,
        intent: SupersedeIntent,
    ) -> crate::Result<CorrelationId> {
        let (reply, answer) = bounded(1);
        self.commands
            .send(Command::Submit {
                payload,
                target,
                intent,
                reply,
            })
            .map_err(|_| EngineError::Terminated)?;
        let result = answer.recv().map_err(|_| EngineError::Terminated)?;
        Ok(result?)
    }

    pub fn retry(&self, correlation_id: CorrelationId) -> crate::Result<CorrelationId> {
        let (reply, answer) = bounded(1);
        self.commands
            .send(Command::Retry {
                correlation_id,
                reply,
            })
            .map_err(|_| EngineError::Terminated)?;
        let result = answer.recv().map_err(|_| EngineError::Terminated)?;
        Ok(result?)
    }

    pub fn discard(&self, correlation_id: CorrelationId) -> crate::Result<()> {
        let (reply, answer) = bounded(1);
        self.commands
            .send(Command::Discard {
                correlation_id,
                reply,
            })
            .map_err(|_| EngineError::Terminated)?;
        let result = answer.recv().map_err(|_| EngineError::Terminated)?;
        Ok(result?)
    }

    pub fn merged_view(&self) -> crate::Result<MergedView<P, T>> {
        let (reply, answer) = bounded(1);
        self.commands
            .send(Command::View { reply })
            .map_err(|_| EngineError::Terminated)?;
        Ok(answer.recv().map_err(|_| EngineError::Terminated)?)
    }

    pub fn subscribe(&self, filter: StatusFilter) -> crate::Result<StatusSubscription> {
        let (reply, answer) = bounded(1);
        self.commands
            .send(Command::Subscribe { filter, reply })
            .map_err(|_| EngineError::Terminated)?;
        answer.recv().map_err(|_| EngineError::Terminated)?
    }
}

/// A running engine: engine thread, submit worker, poll ticker.
pub struct Runtime<P, T> {
    handle: EngineHandle<P, T>,
    engine_thread: Option<JoinHandle<()>>,
    submit_thread: Option<JoinHandle<()>>,
    poll_thread: Option<JoinHandle<()>>,
}

impl<P, T> Runtime<P, T>
where
    P: Clone + Send + 'static,
    T: Canonical + Clone + Send + 'static,
{
    pub fn start<M, X>(config: Config, matcher: M, transport: X) -> Self
    where
        M: Matcher<P, T> + Send + 'static,
        X: Transport<P, T> + 'static,
    {
        let transport = Arc::new(transport);
        let (cmd_tx, cmd_rx) = unbounded::<Command<P, T>>();
        let (job_tx, job_rx) = unbounded::<SubmitJob<P>>();
        let (wake_tx, wake_rx) = bounded::<PollWake>(1);

        let engine_thread = {
            let config = config.clone();
            std::thread::Builder::new()
                .name("converge-engine".to_string())
                .spawn(move || run_engine(config, matcher, cmd_rx, job_tx, wake_tx))
                .expect("spawn engine thread")
        };

        let submit_thread = {
            let transport = Arc::clone(&transport);
            let cmd_tx = cmd_tx.clone();
            std::thread::Builder::new()
                .name("converge-submit".to_string())
                .spawn(move || run_submit_worker(transport, job_rx, cmd_tx))
                .expect("spawn submit worker")
        };

        let poll_thread = {
            let interval = Duration::from_millis(config.poll.interval_ms.max(1));
            let cmd_tx = cmd_tx.clone();
            std::thread::Builder::new()
                .name("converge-poll".to_string())
                .spawn(move || run_poll_loop(transport, interval, wake_rx, cmd_tx))
                .expect("spawn poll thread")
        };

        Self {
            handle: EngineHandle { commands: cmd_tx },
            engine_thread: Some(engine_thread),
            submit_thread: Some(submit_thread),
            poll_thread: Some(poll_thread),
        }
    }
}

impl<P, T> Runtime<P, T> {
    pub fn handle(&self) -> EngineHandle<P, T> {
        self.handle.clone()
    }

    /// Stop all threads. Idempotent; in-flight transport calls finish and
    /// their results are dropped.
    pub fn shutdown(&mut self) {
        let _ = self.handle.commands.send(Command::Shutdown);
        for thread in [
            self.engine_thread.take(),
            self.submit_thread.take(),
            self.poll_thread.take(),
        ]
        .into_iter()
        .flatten()
        {
            let _ = thread.join();
        }
    }
}

impl<P, T> Drop for Runtime<P, T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_engine<P, T, M>(
    config: Config,
    matcher: M,
    commands: Receiver<Command<P, T>>,
    jobs: Sender<SubmitJob<P>>,
    poll_wake: Sender<PollWake>,
) where
    P: Clone,
    T: Canonical + Clone,
    M: Matcher<P, T>,
{
    let mut core = EngineCore::new(&config, matcher);

    while let Ok(command) = commands.recv() {
        match command {
            Command::Submit {
                payload,
                target,
                intent,
                reply,
            } => {
                let result = core.submit(payload.clone(), target, intent);
                if let Ok(correlation_id) = &result {
                    let _ = jobs.send(SubmitJob {
                        correlation_id: *correlation_id,
                        payload,
                    });
                }
                let _ = reply.send(result);
            }
            Command::Retry {
                correlation_id,
                reply,
            } => {
                let result = core.retry(correlation_id);
                if let Ok(new_id) = &result
                    && let Some(record) = core.record(new_id)
                {
                    let _ = jobs.send(SubmitJob {
                        correlation_id: *new_id,
                        payload: record.payload.clone(),
                    });
                }
                let _ = reply.send(result);
            }
            Command::Discard {
                correlation_id,
                reply,
            } => {
                let _ = reply.send(core.discard(correlation_id));
            }
            Command::View { reply } => {
                let _ = reply.send(core.merged_view());
            }
            Command::Subscribe { filter, reply } => {
                let _ = reply.send(core.subscribe(filter).map_err(crate::Error::from));
            }
            Command::Completion {
                correlation_id,
                result,
            } => {
                let outcome = core.complete(correlation_id, result);
                if outcome == CompletionOutcome::Confirmed && config.poll.poll_after_confirm {
                    // Reconcile the authoritative view promptly instead of
                    // waiting out the interval. Full channel means a wake
                    // is already queued.
                    let _ = poll_wake.try_send(PollWake);
                }
            }
            Command::Snapshot { items } => {
                core.apply_poll(items);
            }
            Command::Shutdown => break,
        }
    }
    // jobs/poll_wake drop here, disconnecting the worker threads.
}

fn run_submit_worker<P, T, X>(
    transport: Arc<X>,
    jobs: Receiver<SubmitJob<P>>,
    commands: Sender<Command<P, T>>,
) where
    X: Transport<P, T> + ?Sized,
{
    for job in jobs.iter() {
        let result = transport.submit(&job.payload);
        if commands
            .send(Command::Completion {
                correlation_id: job.correlation_id,
                result,
            })
            .is_err()
        {
            break;
        }
    }
}

fn run_poll_loop<P, T, X>(
    transport: Arc<X>,
    interval: Duration,
    wake: Receiver<PollWake>,
    commands: Sender<Command<P, T>>,
) where
    X: Transport<P, T> + ?Sized,
{
    loop {
        match wake.recv_timeout(interval) {
            Ok(PollWake) | Err(RecvTimeoutError::Timeout) => match transport.poll() {
                Ok(items) => {
                    if commands.send(Command::Snapshot { items }).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    // No update this cycle; existing state stays visible.
                    tracing::debug!(%err, "poll cycle skipped");
                }
            },
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::config::{Config, PollConfig};
    use crate::core::identity::ServerId;
    use crate::core::merge::NoHeuristic;
    use crate::core::snapshot::Canonical;
    use crate::engine::broadcast::StatusPhase;
    use crate::engine::transport::PollFailure;

    #[derive(Clone, Debug, PartialEq)]
    struct Msg {
        id: String,
        body: String,
    }

    impl Canonical for Msg {
        fn server_id(&self) -> ServerId {
            ServerId::new(self.id.clone()).unwrap()
        }
    }

    /// Transport backed by an in-memory "server": submits persist into it,
    /// polls read it back.
    struct MemoryServer {
        messages: Mutex<Vec<Msg>>,
        fail_submits: Mutex<usize>,
    }

    impl MemoryServer {
        fn new() -> Self {
            Self {
                messages: Mutex::new(Vec::new()),
                fail_submits: Mutex::new(0),
            }
        }

        fn failing_first(count: usize) -> Self {
            Self {
                messages: Mutex::new(Vec::new()),
                fail_submits: Mutex::new(count),
            }
        }
    }

    impl Transport<String, Msg> for MemoryServer {
        fn submit(&self, payload: &String) -> Result<SubmitOk<Msg>, SubmitFailure> {
            {
                let mut remaining = self.fail_submits.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(SubmitFailure::clean("network error"));
                }
            }
            let mut messages = self.messages.lock().unwrap();
            let id = format!("m{}", messages.len() + 1);
            let msg = Msg {
                id: id.clone(),
                body: payload.clone(),
            };
            messages.push(msg.clone());
            Ok(SubmitOk {
                server_id: ServerId::new(id).unwrap(),
                item: msg,
                freshness: None,
            })
        }

        fn poll(&self) -> Result<Vec<Msg>, PollFailure> {
            Ok(self.messages.lock().unwrap().clone())
        }
    }

    fn fast_config() -> Config {
        Config {
            poll: PollConfig {
                interval_ms: 10,
                poll_after_confirm: true,
            },
            ..Config::default()
        }
    }

    fn target(s: &str) -> TargetKey {
        TargetKey::parse(s).unwrap()
    }

    #[test]
    fn submit_confirms_and_reconciles_end_to_end() {
        let mut runtime =
            Runtime::start(fast_config(), NoHeuristic, MemoryServer::new());
        let handle = runtime.handle();
        let sub = handle.subscribe(StatusFilter::All).unwrap();

        handle
            .submit("hi".to_string(), target("msg:1"), SupersedeIntent::default())
            .unwrap();

        for expected in [
            StatusPhase::Pending,
            StatusPhase::Confirmed,
            StatusPhase::Reconciled,
        ] {
            let change = sub
                .recv_timeout(Duration::from_secs(5))
                .expect("status change within deadline");
            assert_eq!(change.phase, expected);
        }

        let view = handle.merged_view().unwrap();
        assert_eq!(view.len(), 1);
        assert!(!view.entries()[0].is_optimistic());

        runtime.shutdown();
    }

    #[test]
    fn failed_submit_surfaces_and_retry_converges() {
        let mut runtime = Runtime::start(
            fast_config(),
            NoHeuristic,
            MemoryServer::failing_first(1),
        );
        let handle = runtime.handle();
        let sub = handle.subscribe(StatusFilter::All).unwrap();

        let id = handle
            .submit("hi".to_string(), target("msg:1"), SupersedeIntent::default())
            .unwrap();

        for expected in [StatusPhase::Pending, StatusPhase::Failed] {
            let change = sub
                .recv_timeout(Duration::from_secs(5))
                .expect("status change within deadline");
            assert_eq!(change.phase, expected);
        }

        let view = handle.merged_view().unwrap();
        assert!(view.entries()[0].is_failed());

        let new_id = handle.retry(id).unwrap();
        assert_ne!(new_id, id);

        loop {
            let change = sub
                .recv_timeout(Duration::from_secs(5))
                .expect("status change within deadline");
            if change.phase == StatusPhase::Reconciled {
                break;
            }
        }

        let view = handle.merged_view().unwrap();
        assert_eq!(view.len(), 1);
        assert!(!view.entries()[0].is_optimistic());

        runtime.shutdown();
    }

    #[test]
    fn handle_reports_terminated_after_shutdown() {
        let mut runtime =
            Runtime::start(fast_config(), NoHeuristic, MemoryServer::new());
        let handle = runtime.handle();
        runtime.shutdown();

        let err = handle
            .submit("hi".to_string(), target("msg:1"), SupersedeIntent::default())
            .unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Engine(EngineError::Terminated)
        ));
    }
}
