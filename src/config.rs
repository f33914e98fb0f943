//! Runtime configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::buffer::pool::DEFAULT_BUFFER_SIZE;
use crate::error::Error;
use crate::event_loop::{EventLoop, EventLoopListener};
use crate::manager::SessionInitializer;
use crate::store::MAX_STORE_SIZE;
use crate::timer::{Clock, MonotonicClock};

/// Configuration for an [`EventLoop`].
///
/// Plain data with public fields; prefer [`Config::builder`] for
/// discoverable methods and build-time validation.
#[derive(Clone)]
pub struct Config {
    /// Name for the loop thread and log records.
    pub name: String,
    /// Listen / default dial host.
    pub host: String,
    /// Listen / default dial port.
    pub port: u16,
    /// TCP listen backlog.
    pub backlog: u32,
    /// When true the loop's join handle is not retained;
    /// [`EventLoop::await_termination`] then waits on the terminated flag.
    pub daemon: bool,
    /// Default session capacity for both managers.
    pub max_conns: usize,
    /// Accepted-session capacity; 0 inherits `max_conns`.
    pub max_server_conns: usize,
    /// Initiated-session capacity; 0 inherits `max_conns`.
    pub max_client_conns: usize,
    /// Assert read interest as soon as a session opens.
    pub auto_read: bool,
    /// Select the slab-backed pool (one contiguous allocation) instead of
    /// the per-allocation heap pool.
    pub buffer_direct: bool,
    /// Pooled block size in bytes; must be a power of two.
    pub buffer_size: usize,
    /// Memory pool byte budget.
    pub pool_size: u64,
    /// File store byte budget; capped at [`MAX_STORE_SIZE`].
    pub store_size: u64,
    /// Resident input buffers per session before OP_READ is deasserted.
    pub max_read_buffers: usize,
    /// Resident output buffers per session before writes spill to the
    /// file store.
    pub max_write_buffers: usize,
    /// Successful writes against one channel per loop turn.
    pub write_spin_count: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Pipeline initializer for accepted sessions; enables the listener.
    pub server_initializer: Option<Arc<dyn SessionInitializer>>,
    /// Pipeline initializer for initiated sessions.
    pub client_initializer: Option<Arc<dyn SessionInitializer>>,
    /// Lifecycle hooks, called on the loop thread.
    pub listener: Option<Arc<dyn EventLoopListener>>,
    /// Monotonic clock; replace it to drive timers in tests.
    pub clock: Arc<dyn Clock>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: "netline".to_string(),
            host: "0.0.0.0".to_string(),
            port: 9696,
            backlog: 1024,
            daemon: false,
            max_conns: 10240,
            max_server_conns: 0,
            max_client_conns: 0,
            auto_read: true,
            buffer_direct: true,
            buffer_size: DEFAULT_BUFFER_SIZE,
            pool_size: 64 << 20,
            store_size: 256 << 20,
            max_read_buffers: 8,
            max_write_buffers: 64,
            write_spin_count: 16,
            connect_timeout: Duration::from_millis(30_000),
            read_timeout: Duration::from_millis(30_000),
            write_timeout: Duration::from_millis(60_000),
            server_initializer: None,
            client_initializer: None,
            listener: None,
            clock: Arc::new(MonotonicClock),
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Validate configuration values. Returns an error if any value is out
    /// of range or no initializer is present.
    pub fn validate(&self) -> Result<(), Error> {
        if self.server_initializer.is_none() && self.client_initializer.is_none() {
            return Err(Error::Config(
                "no server or client session initializer".into(),
            ));
        }
        if self.max_conns == 0 {
            return Err(Error::Config("max_conns must be > 0".into()));
        }
        if self.buffer_size == 0 || !self.buffer_size.is_power_of_two() {
            return Err(Error::Config(
                "buffer_size must be a power of two".into(),
            ));
        }
        if self.pool_size < self.buffer_size as u64 {
            return Err(Error::Config(
                "pool_size must hold at least one buffer".into(),
            ));
        }
        if self.store_size > MAX_STORE_SIZE {
            return Err(Error::Config(format!(
                "store_size can't exceed {MAX_STORE_SIZE}"
            )));
        }
        if self.store_size < self.buffer_size as u64 {
            return Err(Error::Config(
                "store_size must hold at least one region".into(),
            ));
        }
        if self.max_read_buffers == 0 {
            return Err(Error::Config("max_read_buffers must be > 0".into()));
        }
        if self.max_write_buffers == 0 {
            return Err(Error::Config("max_write_buffers must be > 0".into()));
        }
        if self.write_spin_count == 0 {
            return Err(Error::Config("write_spin_count must be > 0".into()));
        }
        if self.connect_timeout.is_zero()
            || self.read_timeout.is_zero()
            || self.write_timeout.is_zero()
        {
            return Err(Error::Config("timeouts must be > 0".into()));
        }
        Ok(())
    }

    /// Accepted-session capacity with the `max_conns` default applied.
    pub fn server_conns(&self) -> usize {
        if self.max_server_conns == 0 {
            self.max_conns
        } else {
            self.max_server_conns
        }
    }

    /// Initiated-session capacity with the `max_conns` default applied.
    pub fn client_conns(&self) -> usize {
        if self.max_client_conns == 0 {
            self.max_conns
        } else {
            self.max_client_conns
        }
    }
}

/// Builder for [`Config`] with discoverable methods and `build()`
/// validation.
///
/// # Example
///
/// ```rust,no_run
/// use netline::{Config, Session};
///
/// let event_loop = Config::builder()
///     .name("echo")
///     .port(7878)
///     .buffer_size(4096)
///     .max_conns(1024)
///     .server_initializer(|session: &mut Session| {
///         // session.add_handler(...)
///         let _ = session;
///     })
///     .boot()
///     .expect("boot failed");
/// event_loop.await_termination();
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    // ── Identity and addressing ──────────────────────────────────────

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn backlog(mut self, backlog: u32) -> Self {
        self.config.backlog = backlog;
        self
    }

    pub fn daemon(mut self, daemon: bool) -> Self {
        self.config.daemon = daemon;
        self
    }

    // ── Connection limits ────────────────────────────────────────────

    pub fn max_conns(mut self, n: usize) -> Self {
        self.config.max_conns = n;
        self
    }

    pub fn max_server_conns(mut self, n: usize) -> Self {
        self.config.max_server_conns = n;
        self
    }

    pub fn max_client_conns(mut self, n: usize) -> Self {
        self.config.max_client_conns = n;
        self
    }

    // ── Buffering ────────────────────────────────────────────────────

    pub fn auto_read(mut self, auto_read: bool) -> Self {
        self.config.auto_read = auto_read;
        self
    }

    pub fn buffer_direct(mut self, direct: bool) -> Self {
        self.config.buffer_direct = direct;
        self
    }

    pub fn buffer_size(mut self, bytes: usize) -> Self {
        self.config.buffer_size = bytes;
        self
    }

    pub fn pool_size(mut self, bytes: u64) -> Self {
        self.config.pool_size = bytes;
        self
    }

    pub fn store_size(mut self, bytes: u64) -> Self {
        self.config.store_size = bytes;
        self
    }

    pub fn max_read_buffers(mut self, n: usize) -> Self {
        self.config.max_read_buffers = n;
        self
    }

    pub fn max_write_buffers(mut self, n: usize) -> Self {
        self.config.max_write_buffers = n;
        self
    }

    pub fn write_spin_count(mut self, n: usize) -> Self {
        self.config.write_spin_count = n;
        self
    }

    // ── Timeouts ─────────────────────────────────────────────────────

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    // ── Wiring ───────────────────────────────────────────────────────

    /// Install the accepted-session initializer; its presence enables the
    /// listener socket.
    pub fn server_initializer<I: SessionInitializer + 'static>(mut self, init: I) -> Self {
        self.config.server_initializer = Some(Arc::new(init));
        self
    }

    /// Install the initiated-session initializer.
    pub fn client_initializer<I: SessionInitializer + 'static>(mut self, init: I) -> Self {
        self.config.client_initializer = Some(Arc::new(init));
        self
    }

    /// Install lifecycle hooks, called on the loop thread.
    pub fn event_loop_listener<L: EventLoopListener + 'static>(mut self, listener: L) -> Self {
        self.config.listener = Some(Arc::new(listener));
        self
    }

    /// Replace the monotonic clock, e.g. with a test clock.
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.config.clock = Arc::new(clock);
        self
    }

    // ── Escape hatch ─────────────────────────────────────────────────

    /// Mutable access to the underlying config for fields without builder
    /// methods.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    // ── Terminals ────────────────────────────────────────────────────

    /// Validate and return the final [`Config`].
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Validate, then start an [`EventLoop`] with the result.
    pub fn boot(self) -> Result<EventLoop, Error> {
        EventLoop::start(self.build()?)
    }
}
