//! Per-connection state: selector registration, handler pipeline, buffered
//! input and output, idle tracking, and the read/write scheduling paths.

use std::io::{self, Read};
use std::mem;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use socket2::SockRef;
use tracing::debug;

use crate::buffer::input::BufferInputStream;
use crate::buffer::output::{BufferOutputStream, Drain};
use crate::buffer::pool::BufferPool;
use crate::buffer::Buffer;
use crate::config::Config;
use crate::error::{Error, IdleKind};
use crate::metrics;
use crate::pipeline::{self, EventHandler, Inbound, Outbound, Pipeline};
use crate::store::FileStore;

/// Per-dispatch I/O capabilities threaded from the event loop into sessions
/// and handler contexts.
pub(crate) struct IoEnv<'e> {
    pub(crate) registry: &'e Registry,
    pub(crate) pool: &'e mut dyn BufferPool,
    pub(crate) store: &'e mut FileStore,
    pub(crate) config: &'e Config,
    pub(crate) now: Instant,
    pub(crate) shutdown: bool,
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

// Read/write idle tracking; swept by the loop between selector turns.
pub(crate) struct IdleState {
    read_timeout: Duration,
    write_timeout: Duration,
    last_read: Instant,
    last_write: Instant,
}

/// One TCP connection.
///
/// A session owns its channel, selector registration, pipeline, and both
/// stream views. It is created on accept or on connect completion, fires
/// `on_connected` when it opens, and is destroyed on explicit close,
/// channel EOF, unrecoverable error, or loop shutdown.
pub struct Session {
    id: u64,
    name: &'static str,
    pub(crate) slot: usize,
    token: Token,
    chan: Option<TcpStream>,
    state: SessionState,
    pub(crate) pipeline: Pipeline,
    input: BufferInputStream,
    pub(crate) output: BufferOutputStream,
    idle: IdleState,
    pub(crate) in_on_cause: bool,
    // current pipeline dispatch nesting; events raised while > 0 are
    // deferred so a handler cell is never re-entered
    pub(crate) depth: u32,
    flushed_pending: bool,
    want_read: bool,
    want_write: bool,
    registered: bool,
    read_suspended: bool,
}

impl Session {
    pub(crate) fn new(
        name: &'static str,
        id: u64,
        slot: usize,
        token: Token,
        chan: Option<TcpStream>,
        config: &Config,
        now: Instant,
    ) -> Session {
        Session {
            id,
            name,
            slot,
            token,
            chan,
            state: SessionState::Connecting,
            pipeline: Pipeline::new(),
            input: BufferInputStream::new(),
            output: BufferOutputStream::new(config.max_write_buffers),
            idle: IdleState {
                read_timeout: config.read_timeout,
                write_timeout: config.write_timeout,
                last_read: now,
                last_write: now,
            },
            in_on_cause: false,
            depth: 0,
            flushed_pending: false,
            want_read: false,
            want_write: false,
            registered: false,
            read_suspended: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True until the session starts closing.
    pub fn is_open(&self) -> bool {
        matches!(self.state, SessionState::Connecting | SessionState::Open)
    }

    // Closing sessions still hold their slot until the final drain.
    pub(crate) fn is_active(&self) -> bool {
        self.state != SessionState::Closed
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.chan.as_ref().and_then(|c| c.peer_addr().ok())
    }

    /// Append a handler at the tail of the pipeline.
    pub fn add_handler<H: EventHandler>(&mut self, handler: H) {
        self.pipeline.add_last(handler);
    }

    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }

    /// The staged input stream. Empty while an `on_read` dispatch holds it.
    pub fn input_mut(&mut self) -> &mut BufferInputStream {
        &mut self.input
    }

    /// Bytes queued for the socket and not yet drained.
    pub fn output_pending(&self) -> usize {
        self.output.pending()
    }

    /// Transition to OPEN: set TCP options, optionally auto-assert read
    /// interest. The caller fires `on_connected` afterwards.
    pub(crate) fn mark_open(&mut self, env: &mut IoEnv<'_>) -> Result<(), Error> {
        self.state = SessionState::Open;
        if let Some(chan) = &self.chan {
            chan.set_nodelay(true)?;
            let sock = SockRef::from(chan);
            sock.set_keepalive(true)?;
            sock.set_reuse_address(true)?;
        }
        if env.config.auto_read {
            self.enable_read(env)?;
        }
        Ok(())
    }

    pub(crate) fn enable_read(&mut self, env: &mut IoEnv<'_>) -> Result<(), Error> {
        self.read_suspended = false;
        if !self.want_read {
            self.want_read = true;
            self.update_interest(env.registry)?;
        }
        Ok(())
    }

    pub(crate) fn disable_read(&mut self, env: &mut IoEnv<'_>) -> Result<(), Error> {
        if self.want_read {
            self.want_read = false;
            self.update_interest(env.registry)?;
        }
        Ok(())
    }

    pub(crate) fn enable_write(&mut self, env: &mut IoEnv<'_>) -> Result<(), Error> {
        if !self.want_write {
            self.want_write = true;
            self.update_interest(env.registry)?;
        }
        Ok(())
    }

    pub(crate) fn disable_write(&mut self, env: &mut IoEnv<'_>) -> Result<(), Error> {
        if self.want_write {
            self.want_write = false;
            self.update_interest(env.registry)?;
        }
        Ok(())
    }

    // mio has no empty interest set, so the (read, write) pair maps onto
    // register / reregister / deregister transitions.
    fn update_interest(&mut self, registry: &Registry) -> Result<(), Error> {
        let Some(chan) = self.chan.as_mut() else {
            return Ok(());
        };
        let interest = match (self.want_read, self.want_write) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };
        match (interest, self.registered) {
            (Some(interest), true) => registry.reregister(chan, self.token, interest)?,
            (Some(interest), false) => {
                registry.register(chan, self.token, interest)?;
                self.registered = true;
            }
            (None, true) => {
                registry.deregister(chan)?;
                self.registered = false;
            }
            (None, false) => {}
        }
        Ok(())
    }

    /// Read readiness: pull bytes into pooled buffers and fire `on_read`
    /// per successful read, until the socket would block, the peer closes,
    /// or backpressure pauses ingress.
    pub(crate) fn fire_read_ready(&mut self, env: &mut IoEnv<'_>) -> Result<(), Error> {
        loop {
            if !self.is_open() || !self.want_read {
                return Ok(());
            }
            if self.input.tail_buffer_with_room().is_none() {
                if self.input.buffer_count() >= env.config.max_read_buffers {
                    // ingress budget spent; wait for the handler to consume
                    self.read_suspended = true;
                    self.want_read = false;
                    self.update_interest(env.registry)?;
                    return Ok(());
                }
                let buf = env.pool.allocate()?;
                self.input.push_buffer(buf);
            }
            let read_res = {
                let Some(chan) = self.chan.as_mut() else {
                    return Err(Error::ChannelClosed);
                };
                match self.input.tail_buffer_with_room() {
                    Some(buf) => {
                        let widx = buf.write_index();
                        let dst = &mut env.pool.data_mut(buf)[widx..];
                        match chan.read(dst) {
                            Ok(n) => {
                                buf.advance_write(n);
                                Ok(n)
                            }
                            Err(e) => Err(e),
                        }
                    }
                    None => return Ok(()),
                }
            };
            match read_res {
                Ok(0) => {
                    // peer EOF
                    debug!(name = self.name, id = self.id, "channel EOF");
                    self.close(env);
                    return Ok(());
                }
                Ok(n) => {
                    metrics::BYTES_RECEIVED.add(n as u64);
                    self.idle.last_read = env.now;
                    self.fire_read(env)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Dispatch `on_read` with the staged input stream as the payload.
    pub(crate) fn fire_read(&mut self, env: &mut IoEnv<'_>) -> Result<(), Error> {
        let stream = mem::take(&mut self.input);
        let mut msg = Inbound::Stream(stream);
        let node = self.pipeline.next(pipeline::HEAD);
        let res = pipeline::dispatch_read(self, env, node, &mut msg);
        if let Inbound::Stream(stream) = msg {
            self.input = stream;
        }
        self.drain_deferred(env)?;
        self.maybe_resume_read(env)?;
        res
    }

    /// Submit an outbound message at the tail of the pipeline. `on_write`
    /// propagates backward; byte-form payloads land in the output stream at
    /// the head sentinel.
    pub(crate) fn write(&mut self, env: &mut IoEnv<'_>, msg: Outbound) -> Result<(), Error> {
        if self.state == SessionState::Closed {
            return Err(Error::ChannelClosed);
        }
        let node = self.pipeline.prev(pipeline::TAIL);
        let res = pipeline::dispatch_write(self, env, node, msg);
        self.drain_deferred(env)?;
        res
    }

    /// Assert write interest and attempt an immediate drain.
    pub(crate) fn flush(&mut self, env: &mut IoEnv<'_>) -> Result<(), Error> {
        if self.state == SessionState::Closed {
            return Err(Error::ChannelClosed);
        }
        if self.output.is_empty() {
            return Ok(());
        }
        self.enable_write(env)?;
        self.fire_write_ready(env)
    }

    /// Write readiness: drain up to the spin budget, then either keep
    /// OP_WRITE asserted or report the flush completion. `on_flushed` fires
    /// once per transition of the output stream from non-empty to empty.
    pub(crate) fn fire_write_ready(&mut self, env: &mut IoEnv<'_>) -> Result<(), Error> {
        if self.output.is_empty() {
            self.disable_write(env)?;
            if self.state == SessionState::Closing {
                self.finish_close(env);
            }
            return Ok(());
        }
        let drain = self.drain_output(env)?;
        if drain.bytes > 0 {
            metrics::BYTES_SENT.add(drain.bytes as u64);
            self.idle.last_write = env.now;
        }
        if drain.completed {
            self.disable_write(env)?;
            if self.state == SessionState::Closing {
                self.finish_close(env);
                return Ok(());
            }
            if self.depth > 0 {
                // raised mid-callback; fire once the dispatch stack unwinds
                self.flushed_pending = true;
            } else {
                self.fire_flushed(env)?;
            }
        }
        Ok(())
    }

    // Fire events that completed while a handler callback was on the stack.
    fn drain_deferred(&mut self, env: &mut IoEnv<'_>) -> Result<(), Error> {
        while self.depth == 0 && self.flushed_pending {
            self.flushed_pending = false;
            if self.state == SessionState::Closed {
                break;
            }
            self.fire_flushed(env)?;
        }
        Ok(())
    }

    fn drain_output(&mut self, env: &mut IoEnv<'_>) -> Result<Drain, Error> {
        let Some(chan) = self.chan.as_mut() else {
            return Err(Error::ChannelClosed);
        };
        self.output.drain_to(
            &mut *env.pool,
            &mut *env.store,
            chan,
            env.config.write_spin_count,
        )
    }

    pub(crate) fn fire_flushed(&mut self, env: &mut IoEnv<'_>) -> Result<(), Error> {
        let node = self.pipeline.next(pipeline::HEAD);
        let res = pipeline::dispatch_flushed(self, env, node);
        self.drain_deferred(env)?;
        self.maybe_resume_read(env)?;
        res
    }

    pub(crate) fn fire_connected(&mut self, env: &mut IoEnv<'_>) -> Result<(), Error> {
        let node = self.pipeline.next(pipeline::HEAD);
        let res = pipeline::dispatch_connected(self, env, node);
        self.drain_deferred(env)?;
        res
    }

    /// Route an error through the pipeline. An error raised while already
    /// inside `on_cause` force-closes the session instead of re-entering
    /// the handlers.
    pub(crate) fn fire_cause(&mut self, env: &mut IoEnv<'_>, cause: &Error) {
        if self.in_on_cause {
            self.finish_close(env);
            return;
        }
        self.in_on_cause = true;
        let node = self.pipeline.next(pipeline::HEAD);
        pipeline::dispatch_cause(self, env, node, cause);
        self.in_on_cause = false;
        let _ = self.drain_deferred(env);
    }

    // Head-sentinel terminals for the outbound path.
    pub(crate) fn append_output(&mut self, env: &mut IoEnv<'_>, bytes: &[u8]) -> Result<(), Error> {
        self.output.write(&mut *env.pool, &mut *env.store, bytes)
    }

    pub(crate) fn push_output_buffer(&mut self, buf: Buffer) {
        self.output.push_buffer(buf);
    }

    // Re-assert read interest once backpressure cleared.
    fn maybe_resume_read(&mut self, env: &mut IoEnv<'_>) -> Result<(), Error> {
        if self.read_suspended
            && self.is_open()
            && self.input.buffer_count() < env.config.max_read_buffers
        {
            self.enable_read(env)?;
        }
        Ok(())
    }

    /// Begin closing. With pending output the session drains first and the
    /// resources are released after the final flush; otherwise immediately.
    pub(crate) fn close(&mut self, env: &mut IoEnv<'_>) {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return;
        }
        if self.output.is_empty() || self.chan.is_none() {
            self.finish_close(env);
            return;
        }
        self.state = SessionState::Closing;
        self.want_read = false;
        self.read_suspended = false;
        let _ = self.update_interest(env.registry);
        if self.enable_write(env).is_err() || self.fire_write_ready(env).is_err() {
            self.finish_close(env);
        }
    }

    /// Release the channel, registration, and buffered data.
    pub(crate) fn finish_close(&mut self, env: &mut IoEnv<'_>) {
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Closed;
        if let Some(mut chan) = self.chan.take() {
            if self.registered {
                let _ = env.registry.deregister(&mut chan);
                self.registered = false;
            }
        }
        self.input.release_all(&mut *env.pool, &mut *env.store);
        self.output.release_all(&mut *env.pool, &mut *env.store);
        metrics::CONNECTIONS_CLOSED.increment();
        debug!(name = self.name, id = self.id, slot = self.slot, "session closed");
    }

    /// Next instant an idle timeout could fire, given the asserted
    /// interests.
    pub(crate) fn idle_deadline(&self) -> Option<Instant> {
        if !self.is_open() {
            return None;
        }
        let mut deadline: Option<Instant> = None;
        if self.want_read && !self.idle.read_timeout.is_zero() {
            deadline = Some(self.idle.last_read + self.idle.read_timeout);
        }
        if self.want_write && !self.idle.write_timeout.is_zero() {
            let at = self.idle.last_write + self.idle.write_timeout;
            deadline = Some(deadline.map_or(at, |d| d.min(at)));
        }
        deadline
    }

    /// Fire `on_cause(IdleTimeout)` for any interval that lapsed while the
    /// respective interest was asserted. Timestamps refresh on firing so a
    /// swallowed timeout re-arms instead of firing every turn.
    pub(crate) fn check_idle(&mut self, env: &mut IoEnv<'_>) {
        if !self.is_open() {
            return;
        }
        if self.want_read
            && !self.idle.read_timeout.is_zero()
            && env.now.duration_since(self.idle.last_read) >= self.idle.read_timeout
        {
            self.idle.last_read = env.now;
            let cause = Error::IdleTimeout(IdleKind::Read);
            self.fire_cause(env, &cause);
        }
        if self.is_open()
            && self.want_write
            && !self.idle.write_timeout.is_zero()
            && env.now.duration_since(self.idle.last_write) >= self.idle.write_timeout
        {
            self.idle.last_write = env.now;
            let cause = Error::IdleTimeout(IdleKind::Write);
            self.fire_cause(env, &cause);
        }
    }

    pub(crate) fn refresh_io_timestamps(&mut self, now: Instant) {
        self.idle.last_read = now;
        self.idle.last_write = now;
    }

    #[cfg(test)]
    pub(crate) fn wants_read(&self) -> bool {
        self.want_read
    }
}
