//! Cooperative socket multiplexer
//!
//! Every socket registers its descriptor with the poller and at most one
//! job. The multiplexer calls a job when the poller reports its socket
//! ready (or when the job was just installed or explicitly scheduled); the
//! job does a bounded amount of non-blocking work and returns either itself
//! (wait for the next readiness), a replacement job (switch behaviour), or
//! `None` (unregister). Nothing ever blocks waiting for I/O.
//!
//! Readiness is edge-triggered: a job that hands itself back must have
//! drained its socket until it would block.

use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, trace, warn};

const WAKE_TOKEN: Token = Token(usize::MAX);
const EVENT_CAPACITY: usize = 256;

/// Process-unique socket identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(u64);

impl SocketId {
    /// Allocates a fresh identity
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SocketId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    fn token(&self) -> Token {
        Token(self.0 as usize)
    }

    fn from_token(token: Token) -> Self {
        SocketId(token.0 as u64)
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket#{}", self.0)
    }
}

/// A continuation registered with the multiplexer
pub trait SocketJob: Send + Sync {
    /// Performs one step of work
    ///
    /// Return `Some(self)` to be invoked again later, another job to replace
    /// this one, or `None` to unregister.
    fn run(
        self: Arc<Self>,
        readable: bool,
        writable: bool,
        error: bool,
    ) -> Option<Arc<dyn SocketJob>>;

    /// Whether the job is interested in read readiness
    fn is_readable(&self) -> bool;

    /// Whether the job is interested in write readiness
    fn is_writable(&self) -> bool;
}

/// Returns true if both handles refer to the same job instance
pub fn same_job(a: &Arc<dyn SocketJob>, b: &Arc<dyn SocketJob>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// Signature of a method a [`MethodJob`] dispatches to
pub type JobMethod<T> =
    fn(&T, &Arc<dyn SocketJob>, bool, bool, bool) -> Option<Arc<dyn SocketJob>>;

/// Job that forwards readiness to a method on a socket
///
/// Holds the socket weakly: once the socket has been destroyed the job
/// unregisters itself instead of touching freed state.
pub struct MethodJob<T> {
    target: Weak<T>,
    method: JobMethod<T>,
    readable: bool,
    writable: bool,
}

impl<T: Send + Sync + 'static> MethodJob<T> {
    /// Binds `method` on `target` with the given interest
    pub fn new(target: Weak<T>, method: JobMethod<T>, readable: bool, writable: bool) -> Arc<Self> {
        Arc::new(Self {
            target,
            method,
            readable,
            writable,
        })
    }
}

impl<T: Send + Sync + 'static> SocketJob for MethodJob<T> {
    fn run(
        self: Arc<Self>,
        readable: bool,
        writable: bool,
        error: bool,
    ) -> Option<Arc<dyn SocketJob>> {
        let target = self.target.upgrade()?;
        let method = self.method;
        let me: Arc<dyn SocketJob> = self;
        method(&target, &me, readable, writable, error)
    }

    fn is_readable(&self) -> bool {
        self.readable
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

/// The scheduler sockets install their jobs on
pub trait Multiplexer: Send + Sync {
    /// Starts reporting readiness of `source` to the job of `owner`
    fn register(
        &self,
        owner: SocketId,
        source: &mut dyn Source,
        interest: Interest,
    ) -> io::Result<()>;

    /// Stops reporting readiness of `source`
    fn deregister(&self, source: &mut dyn Source) -> io::Result<()>;

    /// Registers `job` for `owner`, replacing any job it already had
    ///
    /// The new job runs on the next pass with its declared interest.
    fn add_socket(&self, owner: SocketId, job: Arc<dyn SocketJob>);

    /// Unregisters whatever job `owner` has
    fn remove_socket(&self, owner: SocketId);

    /// Runs the job of `owner` on the next pass with its declared interest
    ///
    /// Used when the socket has new work the poller cannot see, such as
    /// freshly queued output.
    fn schedule(&self, owner: SocketId);
}

#[derive(Debug, Default, Clone, Copy)]
struct Readiness {
    readable: bool,
    writable: bool,
    error: bool,
    scheduled: bool,
}

struct Poller {
    poll: Poll,
    events: Events,
}

/// [`Multiplexer`] backed by a `mio` poller
///
/// Sockets are registered under a token derived from their [`SocketId`].
/// A pass waits for readiness, then runs the job of every socket that
/// became ready plus every job that was installed or scheduled since the
/// last pass.
pub struct SocketMultiplexer {
    poller: Mutex<Poller>,
    registry: Registry,
    waker: Waker,
    jobs: Mutex<HashMap<SocketId, Arc<dyn SocketJob>>>,
    scheduled: Mutex<HashSet<SocketId>>,
}

impl SocketMultiplexer {
    /// Creates an empty multiplexer
    ///
    /// # Errors
    ///
    /// Returns error if the OS poller cannot be created
    pub fn new() -> io::Result<Arc<Self>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Arc::new(Self {
            poller: Mutex::new(Poller {
                poll,
                events: Events::with_capacity(EVENT_CAPACITY),
            }),
            registry,
            waker,
            jobs: Mutex::new(HashMap::new()),
            scheduled: Mutex::new(HashSet::new()),
        }))
    }

    /// Number of registered jobs
    pub fn job_count(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if `owner` currently has a job registered
    pub fn has_job(&self, owner: SocketId) -> bool {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&owner)
    }

    /// The job currently registered for `owner`
    pub fn job_for(&self, owner: SocketId) -> Option<Arc<dyn SocketJob>> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&owner)
            .cloned()
    }

    /// One pass that does not wait for readiness
    pub fn poll_once(&self) -> usize {
        self.poll_timeout(Some(Duration::ZERO))
    }

    /// Waits up to `timeout` for readiness, then runs the jobs that are due
    ///
    /// Returns how many jobs ran. The job table is not locked while jobs
    /// run, so a job may register, replace or remove jobs (its own
    /// included) and a stalled job only stalls this thread.
    pub fn poll_timeout(&self, timeout: Option<Duration>) -> usize {
        let mut due = self.wait(timeout);
        let scheduled: Vec<SocketId> = self
            .scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for owner in scheduled {
            due.entry(owner).or_default().scheduled = true;
        }

        let mut ran = 0;
        for (owner, readiness) in due {
            let Some(job) = self.job_for(owner) else {
                continue;
            };
            let readable = readiness.readable || (readiness.scheduled && job.is_readable());
            let writable = readiness.writable || (readiness.scheduled && job.is_writable());
            let next = Arc::clone(&job).run(readable, writable, readiness.error);
            ran += 1;
            self.replace(owner, &job, next);
        }
        ran
    }

    fn wait(&self, timeout: Option<Duration>) -> HashMap<SocketId, Readiness> {
        let mut due: HashMap<SocketId, Readiness> = HashMap::new();
        let mut poller = self.poller.lock().unwrap_or_else(PoisonError::into_inner);
        let Poller { poll, events } = &mut *poller;

        // Scheduled work must not sit out the timeout
        let timeout = if self.has_scheduled() {
            Some(Duration::ZERO)
        } else {
            timeout
        };
        if let Err(e) = poll.poll(events, timeout) {
            if e.kind() != io::ErrorKind::Interrupted {
                warn!("Socket multiplexer poll failed: {}", e);
            }
            return due;
        }

        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let readiness = due.entry(SocketId::from_token(event.token())).or_default();
            readiness.readable |= event.is_readable() || event.is_read_closed();
            readiness.writable |= event.is_writable() || event.is_write_closed();
            readiness.error |= event.is_error();
        }
        due
    }

    fn has_scheduled(&self) -> bool {
        !self
            .scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }

    fn replace(
        &self,
        owner: SocketId,
        job: &Arc<dyn SocketJob>,
        next: Option<Arc<dyn SocketJob>>,
    ) {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        // Only touch the entry if nobody re-registered it while the job ran
        let unchanged = jobs
            .get(&owner)
            .map(|current| same_job(current, job))
            .unwrap_or(false);
        if !unchanged {
            return;
        }
        match next {
            Some(next) if same_job(&next, job) => {}
            Some(next) => {
                trace!("{} switched job", owner);
                jobs.insert(owner, next);
                drop(jobs);
                // The new job may have work the poller already reported
                self.scheduled
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(owner);
            }
            None => {
                trace!("{} job finished", owner);
                jobs.remove(&owner);
            }
        }
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!("Could not wake socket multiplexer: {}", e);
        }
    }

    /// Drives the multiplexer on a dedicated worker thread
    ///
    /// `interval` bounds how long one pass waits for readiness.
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> io::Result<MultiplexerHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let mux = Arc::clone(self);
        let stop_flag = Arc::clone(&stop);

        let thread = thread::Builder::new()
            .name("socket-multiplexer".to_string())
            .spawn(move || {
                debug!("Socket multiplexer started");
                while !stop_flag.load(Ordering::SeqCst) {
                    mux.poll_timeout(Some(interval));
                }
                debug!("Socket multiplexer stopped");
            })?;

        Ok(MultiplexerHandle {
            stop,
            mux: Arc::clone(self),
            thread: Some(thread),
        })
    }
}

impl Multiplexer for SocketMultiplexer {
    fn register(
        &self,
        owner: SocketId,
        source: &mut dyn Source,
        interest: Interest,
    ) -> io::Result<()> {
        self.registry.register(source, owner.token(), interest)
    }

    fn deregister(&self, source: &mut dyn Source) -> io::Result<()> {
        self.registry.deregister(source)
    }

    fn add_socket(&self, owner: SocketId, job: Arc<dyn SocketJob>) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(owner, job);
        self.schedule(owner);
    }

    fn remove_socket(&self, owner: SocketId) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&owner);
        self.scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&owner);
    }

    fn schedule(&self, owner: SocketId) {
        self.scheduled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(owner);
        self.wake();
    }
}

/// Stops and joins the multiplexer thread when stopped or dropped
pub struct MultiplexerHandle {
    stop: Arc<AtomicBool>,
    mux: Arc<SocketMultiplexer>,
    thread: Option<JoinHandle<()>>,
}

impl MultiplexerHandle {
    /// Signals the worker to stop and waits for it
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        self.mux.wake();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Socket multiplexer thread panicked");
            }
        }
    }
}

impl Drop for MultiplexerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct Counter {
        calls: AtomicUsize,
        finish_after: usize,
    }

    impl Counter {
        fn step(
            &self,
            job: &Arc<dyn SocketJob>,
            _readable: bool,
            _writable: bool,
            _error: bool,
        ) -> Option<Arc<dyn SocketJob>> {
            let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if calls >= self.finish_after {
                None
            } else {
                Some(Arc::clone(job))
            }
        }
    }

    fn counter(finish_after: usize) -> Arc<Counter> {
        Arc::new(Counter {
            calls: AtomicUsize::new(0),
            finish_after,
        })
    }

    /// Remembers the readiness of every call
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(bool, bool, bool)>>,
    }

    impl Recorder {
        fn step(
            &self,
            job: &Arc<dyn SocketJob>,
            readable: bool,
            writable: bool,
            error: bool,
        ) -> Option<Arc<dyn SocketJob>> {
            self.calls.lock().unwrap().push((readable, writable, error));
            Some(Arc::clone(job))
        }
    }

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_job_returning_itself_waits_for_readiness() {
        let mux = SocketMultiplexer::new().unwrap();
        let target = counter(3);
        let id = SocketId::next();
        let job: Arc<dyn SocketJob> =
            MethodJob::new(Arc::downgrade(&target), Counter::step, true, false);
        mux.add_socket(id, job);

        assert_eq!(mux.poll_once(), 1);
        // Nothing is ready and nothing was scheduled
        assert_eq!(mux.poll_once(), 0);
        assert_eq!(target.calls.load(Ordering::SeqCst), 1);

        mux.schedule(id);
        mux.poll_once();
        assert!(mux.has_job(id));

        mux.schedule(id);
        mux.poll_once();
        assert!(!mux.has_job(id));
        assert_eq!(target.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_job_for_dropped_target_unregisters() {
        let mux = SocketMultiplexer::new().unwrap();
        let target = counter(100);
        let id = SocketId::next();
        let job: Arc<dyn SocketJob> =
            MethodJob::new(Arc::downgrade(&target), Counter::step, true, true);
        mux.add_socket(id, job);

        drop(target);
        mux.poll_once();
        assert_eq!(mux.job_count(), 0);
    }

    #[test]
    fn test_same_job_identity() {
        let target = counter(1);
        let a: Arc<dyn SocketJob> =
            MethodJob::new(Arc::downgrade(&target), Counter::step, true, false);
        let b: Arc<dyn SocketJob> =
            MethodJob::new(Arc::downgrade(&target), Counter::step, true, false);
        assert!(same_job(&a, &Arc::clone(&a)));
        assert!(!same_job(&a, &b));
    }

    #[test]
    fn test_socket_ids_are_unique() {
        let a = SocketId::next();
        let b = SocketId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("socket#"));
        assert_eq!(SocketId::from_token(a.token()), a);
    }

    #[test]
    fn test_idle_socket_runs_only_when_readable() {
        let mux = SocketMultiplexer::new().unwrap();
        let (local, mut remote) = pair();
        local.set_nonblocking(true).unwrap();
        let mut stream = mio::net::TcpStream::from_std(local);
        let id = SocketId::next();
        mux.register(id, &mut stream, Interest::READABLE).unwrap();

        let target = Arc::new(Recorder::default());
        let job: Arc<dyn SocketJob> =
            MethodJob::new(Arc::downgrade(&target), Recorder::step, false, false);
        mux.add_socket(id, job);

        // The fresh job runs once with its declared interest
        assert_eq!(mux.poll_once(), 1);
        assert_eq!(mux.poll_once(), 0);
        assert_eq!(mux.poll_once(), 0);
        assert_eq!(*target.calls.lock().unwrap(), vec![(false, false, false)]);

        remote.write_all(b"x").unwrap();
        for _ in 0..200 {
            if mux.poll_once() > 0 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            target.calls.lock().unwrap().last().copied(),
            Some((true, false, false))
        );
    }

    #[test]
    fn test_schedule_wakes_a_waiting_worker() {
        let mux = SocketMultiplexer::new().unwrap();
        let mut handle = mux.spawn(Duration::from_secs(30)).unwrap();
        // Let the worker settle into a long wait
        thread::sleep(Duration::from_millis(20));

        let started = Instant::now();
        let target = counter(1);
        let job: Arc<dyn SocketJob> =
            MethodJob::new(Arc::downgrade(&target), Counter::step, true, false);
        mux.add_socket(SocketId::next(), job);
        for _ in 0..500 {
            if mux.job_count() == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(mux.job_count(), 0);
        assert_eq!(target.calls.load(Ordering::SeqCst), 1);

        handle.stop();
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
