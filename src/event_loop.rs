//! The selector-driven run loop and its control handle.
//!
//! Exactly one thread owns the selector, the session managers, the buffer
//! pool, and the file store; every handler callback runs on it. External
//! threads interact through three queues (dials, timed tasks, plain tasks)
//! plus the shutdown flag, each paired with a selector wakeup.

use std::io;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, warn};

use crate::buffer::pool::{BufferPool, HeapBufferPool, SlabBufferPool};
use crate::config::Config;
use crate::error::Error;
use crate::manager::SessionManager;
use crate::metrics;
use crate::session::{IoEnv, Session, SessionState};
use crate::store::FileStore;
use crate::timer::{TaskKind, TimeTask, TimerHandle};

const TOKEN_SERVER: Token = Token(0);
const TOKEN_WAKER: Token = Token(1);
const TOKEN_BASE: usize = 2;

// Selector cadence while shutdown drains the remaining sessions.
const SHUTDOWN_SWEEP: Duration = Duration::from_millis(100);

type Task = Box<dyn FnOnce() + Send>;

/// Observes loop lifecycle. Both hooks run on the loop thread.
pub trait EventLoopListener: Send + Sync {
    /// Called before the first loop iteration.
    fn init(&self, event_loop: &EventLoop) {
        let _ = event_loop;
    }

    /// Called exactly once after the loop exits, cleanup included.
    fn destroy(&self, event_loop: &EventLoop) {
        let _ = event_loop;
    }
}

/// A pending dial handed to the loop thread.
struct ConnRequest {
    remote: SocketAddr,
    timeout: Duration,
}

// A dial whose socket is registered for OP_CONNECT (writable) readiness.
// The timer handle cancels the associated connect-timeout task; exactly one
// of {connect completion, timeout} wins.
struct PendingConnect {
    chan: TcpStream,
    remote: SocketAddr,
    handle: TimerHandle,
}

struct Shared {
    config: Config,
    shutdown: AtomicBool,
    terminated: Mutex<bool>,
    terminated_cv: Condvar,
    waker: Waker,
    conn_tx: Sender<ConnRequest>,
    timer_tx: Sender<TimeTask>,
    task_tx: Sender<Task>,
    loop_thread: OnceLock<ThreadId>,
    join: Mutex<Option<JoinHandle<()>>>,
}

// Mutex poisoning is unrecoverable here; keep the guard either way.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Control handle for one event loop thread.
///
/// Cheap to clone; every clone talks to the same loop. Created via
/// [`EventLoop::start`] or [`ConfigBuilder::boot`](crate::config::ConfigBuilder::boot).
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<Shared>,
}

impl EventLoop {
    /// Bind the listener (when a server initializer is configured), spawn
    /// the loop thread, and return the control handle.
    pub fn start(config: Config) -> Result<EventLoop, Error> {
        config.validate()?;
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), TOKEN_WAKER)?;

        let server_chan = match &config.server_initializer {
            Some(_) => Some(open_server_chan(&config)?),
            None => None,
        };

        // pools built up front so construction failures surface to the
        // caller instead of killing the loop thread
        let pool: Box<dyn BufferPool + Send> = if config.buffer_direct {
            Box::new(SlabBufferPool::new(config.pool_size, config.buffer_size))
        } else {
            Box::new(HeapBufferPool::new(config.pool_size, config.buffer_size))
        };
        let store = FileStore::open(config.store_size, config.buffer_size)?;

        let (conn_tx, conn_rx) = crossbeam_channel::unbounded();
        let (timer_tx, timer_rx) = crossbeam_channel::unbounded();
        let (task_tx, task_rx) = crossbeam_channel::unbounded();

        let shared = Arc::new(Shared {
            config: config.clone(),
            shutdown: AtomicBool::new(false),
            terminated: Mutex::new(false),
            terminated_cv: Condvar::new(),
            waker,
            conn_tx,
            timer_tx,
            task_tx,
            loop_thread: OnceLock::new(),
            join: Mutex::new(None),
        });
        let handle = EventLoop {
            shared: Arc::clone(&shared),
        };

        // the selector loop is built on its own thread: sessions hold
        // non-Send handler cells and must never cross threads
        let loop_handle = handle.clone();
        let loop_shared = Arc::clone(&shared);
        let loop_config = config.clone();
        let thread = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || {
                let mut inner = SelectorLoop::new(
                    poll,
                    server_chan,
                    pool,
                    store,
                    conn_rx,
                    timer_rx,
                    task_rx,
                    loop_shared,
                    loop_config,
                );
                inner.run(&loop_handle);
            })
            .map_err(Error::Io)?;
        if !config.daemon {
            *lock(&shared.join) = Some(thread);
        }
        Ok(handle)
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        *lock(&self.shared.terminated)
    }

    /// True when called from the loop thread.
    pub fn in_event_loop(&self) -> bool {
        self.shared.loop_thread.get() == Some(&thread::current().id())
    }

    /// Request shutdown and wake the selector. Idempotent.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let _ = self.shared.waker.wake();
    }

    /// Block until the loop thread has terminated.
    pub fn await_termination(&self) {
        let join = lock(&self.shared.join).take();
        if let Some(handle) = join {
            let _ = handle.join();
            return;
        }
        let mut done = lock(&self.shared.terminated);
        while !*done {
            done = match self.shared.terminated_cv.wait(done) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Dial the configured host and port with the configured timeout.
    pub fn connect(&self) -> Result<(), Error> {
        let remote = self.default_remote()?;
        self.connect_with_timeout(remote, self.shared.config.connect_timeout)
    }

    /// Dial `remote` with the configured timeout.
    pub fn connect_to(&self, remote: SocketAddr) -> Result<(), Error> {
        self.connect_with_timeout(remote, self.shared.config.connect_timeout)
    }

    /// Dial `remote`. A zero timeout disables the connect deadline.
    pub fn connect_with_timeout(
        &self,
        remote: SocketAddr,
        timeout: Duration,
    ) -> Result<(), Error> {
        self.shared
            .conn_tx
            .send(ConnRequest { remote, timeout })
            .map_err(|_| Error::Terminated)?;
        if !self.in_event_loop() {
            let _ = self.shared.waker.wake();
        }
        Ok(())
    }

    /// Run `task` on the loop thread. Runs inline (before returning) when
    /// already called from the loop thread; otherwise submission order is
    /// preserved.
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> Result<(), Error> {
        if self.in_event_loop() {
            task();
            return Ok(());
        }
        self.shared
            .task_tx
            .send(Box::new(task))
            .map_err(|_| Error::Terminated)?;
        let _ = self.shared.waker.wake();
        Ok(())
    }

    /// Schedule a one-shot task. Resolution is "next loop turn at or after
    /// the deadline".
    pub fn schedule(
        &self,
        delay: Duration,
        task: impl FnMut() + Send + 'static,
    ) -> Result<TimerHandle, Error> {
        self.schedule_inner(delay, None, Box::new(task))
    }

    /// Schedule a repeating task; runs at `delay`, then every `period`.
    pub fn schedule_at_fixed_rate(
        &self,
        delay: Duration,
        period: Duration,
        task: impl FnMut() + Send + 'static,
    ) -> Result<TimerHandle, Error> {
        self.schedule_inner(delay, Some(period), Box::new(task))
    }

    fn schedule_inner(
        &self,
        delay: Duration,
        period: Option<Duration>,
        task: Box<dyn FnMut() + Send>,
    ) -> Result<TimerHandle, Error> {
        let handle = TimerHandle::new();
        let at = self.shared.config.clock.now() + delay;
        self.shared
            .timer_tx
            .send(TimeTask {
                execute_at: at,
                period,
                handle: handle.clone(),
                kind: TaskKind::User(task),
            })
            .map_err(|_| Error::Terminated)?;
        if !self.in_event_loop() {
            let _ = self.shared.waker.wake();
        }
        Ok(handle)
    }

    fn default_remote(&self) -> Result<SocketAddr, Error> {
        let config = &self.shared.config;
        format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|_| {
                Error::Config(format!(
                    "invalid remote address {}:{}",
                    config.host, config.port
                ))
            })
    }
}

fn open_server_chan(config: &Config) -> Result<TcpListener, Error> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|_| {
            Error::Config(format!(
                "invalid listen address {}:{}",
                config.host, config.port
            ))
        })?;
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.backlog.min(i32::MAX as u32) as i32)?;
    info!(%addr, "listen");
    Ok(TcpListener::from_std(socket.into()))
}

// Which manager a session token belongs to.
#[derive(Clone, Copy)]
enum Side {
    Server,
    Client,
}

// Fields every dispatch needs, kept apart from the managers so an IoEnv can
// borrow them while a session is borrowed mutably.
struct IoState {
    poll: Poll,
    pool: Box<dyn BufferPool + Send>,
    store: FileStore,
    config: Config,
}

impl IoState {
    fn env(&mut self, shutdown: bool) -> IoEnv<'_> {
        IoEnv {
            registry: self.poll.registry(),
            pool: &mut *self.pool,
            store: &mut self.store,
            config: &self.config,
            now: self.config.clock.now(),
            shutdown,
        }
    }
}

struct SelectorLoop {
    io: IoState,
    events: Events,
    ready: Vec<(Token, bool, bool)>,
    server_chan: Option<TcpListener>,
    server_mgr: SessionManager,
    client_mgr: SessionManager,
    shared: Arc<Shared>,
    conn_rx: Receiver<ConnRequest>,
    timer_rx: Receiver<TimeTask>,
    task_rx: Receiver<Task>,
    timers: Vec<TimeTask>,
    pending: Vec<Option<PendingConnect>>,
    pending_free: Vec<usize>,
    client_base: usize,
    connect_base: usize,
}

impl SelectorLoop {
    #[allow(clippy::too_many_arguments)]
    fn new(
        poll: Poll,
        server_chan: Option<TcpListener>,
        pool: Box<dyn BufferPool + Send>,
        store: FileStore,
        conn_rx: Receiver<ConnRequest>,
        timer_rx: Receiver<TimeTask>,
        task_rx: Receiver<Task>,
        shared: Arc<Shared>,
        config: Config,
    ) -> SelectorLoop {
        let max_server = if server_chan.is_some() {
            config.server_conns()
        } else {
            0
        };
        let max_client = config.client_conns();
        let client_base = TOKEN_BASE + max_server;
        let connect_base = client_base + max_client;
        let server_mgr = SessionManager::new(
            "server",
            TOKEN_BASE,
            max_server,
            config.server_initializer.clone(),
        );
        let client_mgr = SessionManager::new(
            "client",
            client_base,
            max_client,
            config.client_initializer.clone(),
        );
        SelectorLoop {
            io: IoState {
                poll,
                pool,
                store,
                config,
            },
            events: Events::with_capacity(1024),
            ready: Vec::new(),
            server_chan,
            server_mgr,
            client_mgr,
            shared,
            conn_rx,
            timer_rx,
            task_rx,
            timers: Vec::new(),
            pending: Vec::new(),
            pending_free: Vec::new(),
            client_base,
            connect_base,
        }
    }

    fn run(&mut self, handle: &EventLoop) {
        let _ = self.shared.loop_thread.set(thread::current().id());
        let started = self.io.config.clock.now();
        self.init_chans();
        info!(name = %self.io.config.name, "started");

        let listener = self.io.config.listener.clone();
        if let Some(listener) = &listener {
            listener.init(handle);
        }

        if let Err(e) = self.run_loop() {
            error!(error = %e, "selector loop severe error");
        }
        self.cleanup();

        {
            let mut done = lock(&self.shared.terminated);
            *done = true;
            self.shared.terminated_cv.notify_all();
        }
        if let Some(listener) = &listener {
            listener.destroy(handle);
        }
        let uptime = self.io.config.clock.now().duration_since(started);
        info!(name = %self.io.config.name, uptime_secs = uptime.as_secs(), "terminated");
    }

    fn run_loop(&mut self) -> Result<(), Error> {
        loop {
            // 0. shutdown: stop accepting, drain, terminate once both
            //    managers report completion
            let shutdown = self.shared.shutdown.load(Ordering::Acquire);
            if shutdown {
                self.destroy_server_chan();
                self.shutdown_sessions();
                if self.server_mgr.is_completed() && self.client_mgr.is_completed() {
                    break;
                }
            } else {
                // 1. dial requests
                self.handle_conn_requests();
            }

            // 2. readiness selection bounded by the nearest deadline
            self.drain_timer_queue();
            let timeout = self.nearest_deadline(shutdown);
            match self.io.poll.poll(&mut self.events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            self.ready.clear();
            for event in self.events.iter() {
                self.ready.push((
                    event.token(),
                    event.is_readable() || event.is_read_closed(),
                    event.is_writable() || event.is_write_closed(),
                ));
            }
            for i in 0..self.ready.len() {
                let (token, readable, writable) = self.ready[i];
                self.dispatch_event(token, readable, writable);
            }

            // 3. due timers, 4. idle sweep, 5. executor tasks
            self.execute_time_tasks();
            self.check_idle_sessions();
            self.execute_tasks();
            self.sweep_sessions();
        }
        Ok(())
    }

    fn init_chans(&mut self) {
        if let Some(chan) = self.server_chan.as_mut()
            && let Err(e) = self
                .io
                .poll
                .registry()
                .register(chan, TOKEN_SERVER, Interest::READABLE)
        {
            warn!(error = %e, "server channel registration failed");
        }
    }

    fn destroy_server_chan(&mut self) {
        if let Some(mut chan) = self.server_chan.take() {
            let _ = self.io.poll.registry().deregister(&mut chan);
            info!(name = %self.io.config.name, "shutdown");
        }
    }

    fn shutdown_sessions(&mut self) {
        let mut env = self.io.env(true);
        self.server_mgr.close_all(&mut env);
        self.client_mgr.close_all(&mut env);
    }

    fn dispatch_event(&mut self, token: Token, readable: bool, writable: bool) {
        match token {
            TOKEN_WAKER => {}
            TOKEN_SERVER => self.on_accept_ready(),
            token if token.0 >= self.connect_base => {
                self.on_connect_ready(token.0 - self.connect_base)
            }
            token => {
                let side = if token.0 >= self.client_base {
                    Side::Client
                } else {
                    Side::Server
                };
                self.on_session_event(side, token, readable, writable);
            }
        }
    }

    fn on_session_event(&mut self, side: Side, token: Token, readable: bool, writable: bool) {
        let shutdown = self.shared.shutdown.load(Ordering::Acquire);
        let mgr = match side {
            Side::Server => &mut self.server_mgr,
            Side::Client => &mut self.client_mgr,
        };
        let Some(slot) = mgr.slot_of(token) else {
            return;
        };
        let Some(sess) = mgr.get_mut(slot) else {
            return;
        };
        let mut env = self.io.env(shutdown);

        let mut result = Ok(());
        if readable {
            result = sess.fire_read_ready(&mut env);
        }
        if result.is_ok() && writable && sess.state() != SessionState::Closed {
            result = sess.fire_write_ready(&mut env);
        }
        if let Err(e) = result {
            route_uncaught(sess, &mut env, &e);
        }
    }

    fn on_accept_ready(&mut self) {
        loop {
            let result = match self.server_chan.as_ref() {
                Some(server) => server.accept(),
                None => return,
            };
            match result {
                Ok((chan, _peer)) => {
                    metrics::CONNECTIONS_ACCEPTED.increment();
                    let shutdown = self.shared.shutdown.load(Ordering::Acquire);
                    let mut env = self.io.env(shutdown);
                    if let Some(slot) =
                        self.server_mgr.allocate_session(&mut env, Some(chan), None)
                        && let Some(sess) = self.server_mgr.get_mut(slot)
                        && let Err(e) = sess.fire_connected(&mut env)
                    {
                        route_uncaught(sess, &mut env, &e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept channel error");
                    return;
                }
            }
        }
    }

    fn handle_conn_requests(&mut self) {
        while let Ok(req) = self.conn_rx.try_recv() {
            if let Err(e) = self.open_socket_chan(&req) {
                let mut env = self.io.env(false);
                self.client_mgr.fire_failure(&mut env, &e);
            }
        }
    }

    fn open_socket_chan(&mut self, req: &ConnRequest) -> Result<(), Error> {
        let mut chan = TcpStream::connect(req.remote)?;
        let slot = match self.pending_free.pop() {
            Some(slot) => slot,
            None => {
                self.pending.push(None);
                self.pending.len() - 1
            }
        };
        let token = Token(self.connect_base + slot);
        if let Err(e) = self
            .io
            .poll
            .registry()
            .register(&mut chan, token, Interest::WRITABLE)
        {
            self.pending_free.push(slot);
            return Err(e.into());
        }
        let handle = TimerHandle::new();
        if !req.timeout.is_zero() {
            self.timers.push(TimeTask {
                execute_at: self.io.config.clock.now() + req.timeout,
                period: None,
                handle: handle.clone(),
                kind: TaskKind::ConnectTimeout { pending: slot },
            });
        }
        debug!(remote = %req.remote, "dialing");
        self.pending[slot] = Some(PendingConnect {
            chan,
            remote: req.remote,
            handle,
        });
        Ok(())
    }

    fn on_connect_ready(&mut self, slot: usize) {
        enum Outcome {
            Wait,
            Ready,
            Failed(io::Error),
        }
        let outcome = match self.pending.get_mut(slot).and_then(|p| p.as_mut()) {
            None => return,
            Some(entry) => match entry.chan.take_error() {
                Ok(Some(e)) | Err(e) => Outcome::Failed(e),
                Ok(None) => match entry.chan.peer_addr() {
                    Ok(_) => Outcome::Ready,
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => Outcome::Wait,
                    Err(e) => Outcome::Failed(e),
                },
            },
        };
        match outcome {
            Outcome::Wait => {}
            Outcome::Ready => {
                let Some(pc) = self.pending[slot].take() else {
                    return;
                };
                self.pending_free.push(slot);
                pc.handle.cancel();
                let mut chan = pc.chan;
                let _ = self.io.poll.registry().deregister(&mut chan);
                metrics::CONNECTIONS_DIALED.increment();

                let shutdown = self.shared.shutdown.load(Ordering::Acquire);
                let mut env = self.io.env(shutdown);
                if let Some(s) = self.client_mgr.allocate_session(&mut env, Some(chan), None)
                    && let Some(sess) = self.client_mgr.get_mut(s)
                    && let Err(e) = sess.fire_connected(&mut env)
                {
                    route_uncaught(sess, &mut env, &e);
                }
            }
            Outcome::Failed(e) => {
                let Some(pc) = self.pending[slot].take() else {
                    return;
                };
                self.pending_free.push(slot);
                pc.handle.cancel();
                let mut chan = pc.chan;
                let _ = self.io.poll.registry().deregister(&mut chan);
                drop(chan);

                let cause = Error::Io(e);
                let mut env = self.io.env(false);
                self.client_mgr.fire_failure(&mut env, &cause);
            }
        }
    }

    // A connect deadline fired first: close the channel and surface the
    // timeout through a transient session.
    fn fire_connect_timeout(&mut self, slot: usize) {
        let Some(pc) = self.pending.get_mut(slot).and_then(|p| p.take()) else {
            return;
        };
        self.pending_free.push(slot);
        let mut chan = pc.chan;
        let _ = self.io.poll.registry().deregister(&mut chan);
        drop(chan);

        let cause = Error::ConnectTimeout(pc.remote);
        let shutdown = self.shared.shutdown.load(Ordering::Acquire);
        let mut env = self.io.env(shutdown);
        self.client_mgr.fire_failure(&mut env, &cause);
    }

    fn drain_timer_queue(&mut self) {
        while let Ok(task) = self.timer_rx.try_recv() {
            self.timers.push(task);
        }
    }

    // Nearest deadline across timers and session idle bounds. None blocks
    // indefinitely; zero selects without blocking.
    fn nearest_deadline(&mut self, shutdown: bool) -> Option<Duration> {
        let now = self.io.config.clock.now();
        self.timers.retain(|t| !t.handle.is_cancelled());
        let mut nearest = self.timers.iter().map(|t| t.execute_at).min();
        for deadline in [
            self.server_mgr.min_idle_deadline(),
            self.client_mgr.min_idle_deadline(),
        ]
        .into_iter()
        .flatten()
        {
            nearest = Some(nearest.map_or(deadline, |n| n.min(deadline)));
        }
        let mut timeout = nearest.map(|at| at.saturating_duration_since(now));
        if shutdown {
            // sessions may be draining; keep sweeping
            timeout = Some(timeout.map_or(SHUTDOWN_SWEEP, |t| t.min(SHUTDOWN_SWEEP)));
        }
        timeout
    }

    fn execute_time_tasks(&mut self) {
        let now = self.io.config.clock.now();
        let mut i = 0;
        while i < self.timers.len() {
            if self.timers[i].handle.is_cancelled() {
                self.timers.swap_remove(i);
                continue;
            }
            if self.timers[i].execute_at > now {
                i += 1;
                continue;
            }
            let mut task = self.timers.swap_remove(i);
            match &mut task.kind {
                TaskKind::User(f) => {
                    if catch_unwind(AssertUnwindSafe(|| f())).is_err() {
                        warn!("scheduled task panicked");
                    }
                }
                TaskKind::ConnectTimeout { pending } => {
                    let slot = *pending;
                    task.handle.cancel();
                    self.fire_connect_timeout(slot);
                }
            }
            if let Some(period) = task.period
                && !task.handle.is_cancelled()
            {
                task.execute_at += period;
                self.timers.push(task);
            }
        }
    }

    fn check_idle_sessions(&mut self) {
        let shutdown = self.shared.shutdown.load(Ordering::Acquire);
        let mut env = self.io.env(shutdown);
        self.server_mgr.check_idle(&mut env);
        self.client_mgr.check_idle(&mut env);
    }

    fn execute_tasks(&mut self) {
        while let Ok(task) = self.task_rx.try_recv() {
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                warn!("executor task panicked");
            }
        }
    }

    fn sweep_sessions(&mut self) {
        self.server_mgr.sweep_closed();
        self.client_mgr.sweep_closed();
    }

    fn cleanup(&mut self) {
        self.destroy_server_chan();
        {
            let mut env = self.io.env(true);
            self.server_mgr.force_close_all(&mut env);
            self.client_mgr.force_close_all(&mut env);
        }
        for slot in self.pending.iter_mut() {
            if let Some(pc) = slot.take() {
                pc.handle.cancel();
                let mut chan = pc.chan;
                let _ = self.io.poll.registry().deregister(&mut chan);
            }
        }
        while self.conn_rx.try_recv().is_ok() {}
        while self.timer_rx.try_recv().is_ok() {}
        while self.task_rx.try_recv().is_ok() {}
        self.timers.clear();
        self.io.store.close();
        self.io.pool.close();
    }
}

// Error captured while dispatching selector events: report it through the
// pipeline, or force-close if it arose inside `on_cause` itself.
fn route_uncaught(sess: &mut Session, env: &mut IoEnv<'_>, cause: &Error) {
    warn!(id = sess.id(), error = %cause, "uncaught session error");
    if sess.in_on_cause {
        sess.finish_close(env);
    } else {
        sess.fire_cause(env, cause);
    }
}
