//! Handoff from the scheduler thread to the backend.
//!
//! The scheduler pushes packed messages into an SPSC ring; a dedicated
//! consumer thread polls the ring and forwards each message to the backend
//! bound for the session. The consumer never blocks on the ring: when it is
//! empty it backs off according to a [`BackoffPolicy`].

mod backoff;
mod ring;

pub use backoff::{BackoffPolicy, IdleWait};
pub use ring::{DEFAULT_CAPACITY, RingConsumer, RingProducer, RingStats, dispatch_ring};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, SendError};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::error::BackendError;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub capacity: usize,
    pub backoff: BackoffPolicy,
    /// Upper bound on waiting for the consumer thread in [`Dispatcher::close`].
    pub join_timeout: Duration,
    pub device: Option<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            backoff: BackoffPolicy::default(),
            join_timeout: Duration::from_millis(500),
            device: None,
        }
    }
}

struct Session {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<Option<Box<dyn Backend>>>,
    backend_name: String,
}

/// Owns at most one dispatch session: a ring, its consumer thread and the
/// backend that thread forwards to.
pub struct Dispatcher {
    config: DispatchConfig,
    session: Option<Session>,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// Tears down any previous session, starts a consumer, then initializes
    /// `backend` and hands it to that consumer. The backend is only
    /// initialized once the consumer thread exists. The returned producer is
    /// the only way to feed the session.
    pub fn init(
        &mut self,
        mut backend: Box<dyn Backend>,
        stats: Arc<RingStats>,
    ) -> Result<RingProducer, BackendError> {
        self.close();

        let backend_name = backend.name().to_string();
        stats.reset();
        let (producer, consumer) = dispatch_ring(self.config.capacity, stats);
        let stop = Arc::new(AtomicBool::new(false));
        let consumer_stop = stop.clone();
        let policy = self.config.backoff;
        let (backend_tx, backend_rx) = channel::bounded::<Box<dyn Backend>>(1);

        let handle = thread::Builder::new()
            .name("midi-dispatch".into())
            .spawn(move || {
                let backend = backend_rx.recv().ok()?;
                Some(consume(consumer, backend, &consumer_stop, policy))
            })
            .map_err(|e| BackendError::Spawn(e.to_string()))?;

        if let Err(e) = backend.initialize(self.config.device.as_deref()) {
            drop(backend_tx);
            let _ = handle.join();
            return Err(e);
        }
        if let Err(SendError(mut backend)) = backend_tx.send(backend) {
            backend.shutdown();
            let _ = handle.join();
            return Err(BackendError::Spawn("dispatch thread exited early".into()));
        }

        info!(
            backend = %backend_name,
            capacity = producer.capacity(),
            policy = ?policy,
            "dispatch session started"
        );
        self.session = Some(Session {
            stop,
            handle,
            backend_name,
        });
        Ok(producer)
    }

    /// Stops the consumer after it drains what is queued, then shuts the
    /// backend down. If the consumer does not finish within the join timeout
    /// it is left to exit on its own.
    pub fn close(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        session.stop.store(true, Ordering::Release);

        let deadline = Instant::now() + self.config.join_timeout;
        while !session.handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(
                    backend = %session.backend_name,
                    "dispatch thread did not stop in time, detaching"
                );
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }

        match session.handle.join() {
            Ok(Some(mut backend)) => {
                backend.shutdown();
                info!(backend = %session.backend_name, "dispatch session closed");
            }
            Ok(None) => {}
            Err(_) => warn!(backend = %session.backend_name, "dispatch thread panicked"),
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.close();
    }
}

fn consume(
    mut consumer: RingConsumer,
    mut backend: Box<dyn Backend>,
    stop: &AtomicBool,
    policy: BackoffPolicy,
) -> Box<dyn Backend> {
    let idle = IdleWait::new(policy);
    let stats = consumer.stats().clone();
    debug!(policy = ?idle.policy(), "dispatch consumer running");

    loop {
        match consumer.pop() {
            Some(packed) => {
                backend.send(packed);
                stats.record_dispatched();
                idle.reset();
            }
            None => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                idle.wait();
            }
        }
    }

    debug!(dispatched = stats.dispatched(), "dispatch consumer stopped");
    backend
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RecordingBackend;

    fn wait_for(stats: &RingStats, count: u64) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while stats.dispatched() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn forwards_messages_in_order() {
        let backend = RecordingBackend::default();
        let stats = Arc::new(RingStats::default());
        let mut dispatcher = Dispatcher::new(DispatchConfig::default());
        let mut producer = dispatcher
            .init(Box::new(backend.clone()), stats.clone())
            .unwrap();

        for msg in 0..500u32 {
            producer.submit(msg);
        }
        wait_for(&stats, 500);
        dispatcher.close();

        assert_eq!(backend.messages(), (0..500).collect::<Vec<_>>());
        assert_eq!(stats.dispatched(), 500);
        assert!(*backend.shut_down.lock());
        assert!(!dispatcher.is_running());
    }

    #[test]
    fn spin_consumer_forwards_messages() {
        let backend = RecordingBackend::default();
        let stats = Arc::new(RingStats::default());
        let mut dispatcher = Dispatcher::new(DispatchConfig {
            backoff: BackoffPolicy::Spin,
            ..DispatchConfig::default()
        });
        let mut producer = dispatcher
            .init(Box::new(backend.clone()), stats.clone())
            .unwrap();
        for msg in 0..100u32 {
            producer.submit(msg);
        }
        wait_for(&stats, 100);
        dispatcher.close();
        assert_eq!(backend.messages(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn close_drains_queued_messages() {
        let backend = RecordingBackend::default();
        let stats = Arc::new(RingStats::default());
        let mut dispatcher = Dispatcher::new(DispatchConfig {
            backoff: BackoffPolicy::SpinSleep { sleep_us: 100 },
            ..DispatchConfig::default()
        });
        let mut producer = dispatcher
            .init(Box::new(backend.clone()), stats.clone())
            .unwrap();
        for msg in 0..64u32 {
            producer.submit(msg);
        }
        dispatcher.close();
        assert_eq!(backend.messages().len(), 64);
    }

    #[test]
    fn failed_backend_starts_no_session() {
        let backend = RecordingBackend {
            fail_init: true,
            ..RecordingBackend::default()
        };
        let shut_down = backend.shut_down.clone();
        let mut dispatcher = Dispatcher::new(DispatchConfig::default());
        let result = dispatcher.init(Box::new(backend), Arc::new(RingStats::default()));
        assert!(matches!(result, Err(BackendError::Unavailable(_))));
        assert!(!dispatcher.is_running());
        assert!(!*shut_down.lock());
    }

    #[test]
    fn consumer_waits_for_an_initialized_backend() {
        let backend = RecordingBackend::default();
        let stats = Arc::new(RingStats::default());
        let mut dispatcher = Dispatcher::new(DispatchConfig::default());

        let failing = RecordingBackend {
            fail_init: true,
            ..RecordingBackend::default()
        };
        assert!(dispatcher.init(Box::new(failing), stats.clone()).is_err());

        let mut producer = dispatcher
            .init(Box::new(backend.clone()), stats.clone())
            .unwrap();
        producer.submit(7);
        wait_for(&stats, 1);
        dispatcher.close();
        assert_eq!(backend.messages(), vec![7]);
        assert!(*backend.shut_down.lock());
    }

    #[test]
    fn rebinding_closes_previous_backend() {
        let first = RecordingBackend::default();
        let second = RecordingBackend::default();
        let stats = Arc::new(RingStats::default());
        let mut dispatcher = Dispatcher::new(DispatchConfig::default());

        let mut producer = dispatcher
            .init(Box::new(first.clone()), stats.clone())
            .unwrap();
        producer.submit(1);
        wait_for(&stats, 1);

        let mut producer = dispatcher
            .init(Box::new(second.clone()), stats.clone())
            .unwrap();
        assert!(*first.shut_down.lock());
        producer.submit(2);
        wait_for(&stats, 1);
        dispatcher.close();

        assert_eq!(first.messages(), vec![1]);
        assert_eq!(second.messages(), vec![2]);
    }
}
