//! Per-session handler pipeline.
//!
//! A doubly-linked chain of handler contexts stored as an arena of nodes
//! with integer prev/next links; indices 0 and 1 are the head and tail
//! sentinels. Inbound events (`on_connected`, `on_read`, `on_flushed`,
//! `on_cause`) propagate head to tail; `on_write` propagates tail to head,
//! where the payload must be in byte form and is appended to the session
//! output stream.

use std::any::Any;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::Bytes;
use tracing::warn;

use crate::buffer::input::BufferInputStream;
use crate::buffer::pool::BufferPool;
use crate::buffer::Buffer;
use crate::error::Error;
use crate::session::{IoEnv, Session};
use crate::store::FileStore;

pub(crate) const HEAD: usize = 0;
pub(crate) const TAIL: usize = 1;

/// Inbound payload flowing head to tail.
pub enum Inbound {
    /// Raw bytes staged by the session read path. The session's input
    /// stream is moved into the payload for the duration of the dispatch
    /// and restored afterwards.
    Stream(BufferInputStream),
    /// A decoded application object re-emitted by an upstream handler.
    Object(Box<dyn Any>),
}

impl Inbound {
    /// View the payload as the session input stream, if it still is one.
    pub fn as_stream(&mut self) -> Option<&mut BufferInputStream> {
        match self {
            Inbound::Stream(stream) => Some(stream),
            Inbound::Object(_) => None,
        }
    }

    /// Downcast an object payload.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        match self {
            Inbound::Object(obj) => obj.downcast_ref(),
            Inbound::Stream(_) => None,
        }
    }
}

/// Outbound payload flowing tail to head.
pub enum Outbound {
    /// Wire-ready bytes.
    Bytes(Bytes),
    /// A pooled buffer handed over without copying; the stream takes
    /// ownership of the handle.
    Buffer(Buffer),
    /// An application object still to be encoded by a downstream handler.
    Object(Box<dyn Any>),
}

impl Outbound {
    /// Wrap an application object for a downstream encoder.
    pub fn object<T: Any>(value: T) -> Outbound {
        Outbound::Object(Box::new(value))
    }
}

impl From<Bytes> for Outbound {
    fn from(bytes: Bytes) -> Outbound {
        Outbound::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Outbound {
    fn from(bytes: Vec<u8>) -> Outbound {
        Outbound::Bytes(bytes.into())
    }
}

impl From<&[u8]> for Outbound {
    fn from(bytes: &[u8]) -> Outbound {
        Outbound::Bytes(Bytes::copy_from_slice(bytes))
    }
}

impl From<Buffer> for Outbound {
    fn from(buf: Buffer) -> Outbound {
        Outbound::Buffer(buf)
    }
}

/// A session-scoped event handler.
///
/// Default methods pass every event through unchanged, so a handler only
/// overrides what it cares about. Handlers run on the event loop thread and
/// must not block.
pub trait EventHandler: 'static {
    fn on_connected(&mut self, ctx: &mut Context<'_, '_>) -> Result<(), Error> {
        ctx.fire_connected()
    }

    fn on_read(&mut self, ctx: &mut Context<'_, '_>, msg: &mut Inbound) -> Result<(), Error> {
        ctx.fire_read(msg)
    }

    fn on_write(&mut self, ctx: &mut Context<'_, '_>, msg: Outbound) -> Result<(), Error> {
        ctx.fire_write(msg)
    }

    fn on_flushed(&mut self, ctx: &mut Context<'_, '_>) -> Result<(), Error> {
        ctx.fire_flushed()
    }

    fn on_cause(&mut self, ctx: &mut Context<'_, '_>, cause: &Error) {
        ctx.fire_cause(cause)
    }
}

struct Node {
    handler: Option<Rc<RefCell<dyn EventHandler>>>,
    prev: usize,
    next: usize,
    removed: bool,
}

/// The handler chain of one session.
pub struct Pipeline {
    nodes: Vec<Node>,
}

impl Pipeline {
    pub(crate) fn new() -> Pipeline {
        Pipeline {
            nodes: vec![
                Node {
                    handler: None,
                    prev: usize::MAX,
                    next: TAIL,
                    removed: false,
                },
                Node {
                    handler: None,
                    prev: HEAD,
                    next: usize::MAX,
                    removed: false,
                },
            ],
        }
    }

    /// Append a handler just before the tail sentinel.
    pub fn add_last<H: EventHandler>(&mut self, handler: H) {
        let prev = self.nodes[TAIL].prev;
        self.insert(prev, TAIL, handler);
    }

    /// Insert a handler just after the head sentinel.
    pub fn add_first<H: EventHandler>(&mut self, handler: H) {
        let next = self.nodes[HEAD].next;
        self.insert(HEAD, next, handler);
    }

    fn insert<H: EventHandler>(&mut self, prev: usize, next: usize, handler: H) {
        let idx = self.nodes.len();
        self.nodes.push(Node {
            handler: Some(Rc::new(RefCell::new(handler))),
            prev,
            next,
            removed: false,
        });
        self.nodes[prev].next = idx;
        self.nodes[next].prev = idx;
    }

    /// Unlink a handler. The node keeps its own links so an in-flight
    /// dispatch passing through it still reaches its neighbors.
    pub(crate) fn remove(&mut self, idx: usize) {
        if idx == HEAD || idx == TAIL || self.nodes[idx].removed {
            return;
        }
        let prev = self.nodes[idx].prev;
        let next = self.nodes[idx].next;
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
        self.nodes[idx].removed = true;
        self.nodes[idx].handler = None;
    }

    /// Number of user handlers currently linked.
    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut idx = self.nodes[HEAD].next;
        while idx != TAIL {
            count += 1;
            idx = self.nodes[idx].next;
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.nodes[HEAD].next == TAIL
    }

    pub(crate) fn next(&self, idx: usize) -> usize {
        self.nodes[idx].next
    }

    pub(crate) fn prev(&self, idx: usize) -> usize {
        self.nodes[idx].prev
    }

    pub(crate) fn handler(&self, idx: usize) -> Option<Rc<RefCell<dyn EventHandler>>> {
        self.nodes[idx].handler.clone()
    }
}

/// Handler view of its session: allocation, interest toggling, writing,
/// flushing, closing, and event propagation.
pub struct Context<'a, 'e> {
    pub(crate) session: &'a mut Session,
    pub(crate) env: &'a mut IoEnv<'e>,
    pub(crate) node: usize,
}

impl Context<'_, '_> {
    pub fn session_id(&self) -> u64 {
        self.session.id()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.session.peer_addr()
    }

    /// True when the owning event loop is shutting down.
    pub fn is_shutdown(&self) -> bool {
        self.env.shutdown
    }

    /// Allocate a pooled buffer.
    pub fn alloc(&mut self) -> Result<Buffer, Error> {
        self.env.pool.allocate()
    }

    /// Duplicate a buffer handle, sharing the underlying block.
    pub fn retain(&mut self, buf: &Buffer) -> Buffer {
        self.env.pool.retain(buf)
    }

    /// Release a buffer handle back to the pool.
    pub fn release(&mut self, buf: Buffer) {
        self.env.pool.release(buf);
    }

    /// The pool and store, split-borrowed for stream operations.
    pub fn buffers(&mut self) -> (&mut dyn BufferPool, &mut FileStore) {
        (&mut *self.env.pool, &mut *self.env.store)
    }

    /// The session's staged input. Empty while an `on_read` dispatch holds
    /// the stream (the `Inbound` payload owns it then).
    pub fn input(&mut self) -> &mut BufferInputStream {
        self.session.input_mut()
    }

    /// The session's handler chain, e.g. to insert or remove handlers.
    pub fn pipeline_mut(&mut self) -> &mut Pipeline {
        &mut self.session.pipeline
    }

    /// Unlink this handler from the pipeline.
    pub fn remove_self(&mut self) {
        self.session.pipeline.remove(self.node);
    }

    pub fn enable_read(&mut self) -> Result<(), Error> {
        self.session.enable_read(self.env)
    }

    pub fn disable_read(&mut self) -> Result<(), Error> {
        self.session.disable_read(self.env)
    }

    pub fn enable_write(&mut self) -> Result<(), Error> {
        self.session.enable_write(self.env)
    }

    pub fn disable_write(&mut self) -> Result<(), Error> {
        self.session.disable_write(self.env)
    }

    /// Submit an outbound message, propagating toward the head from this
    /// handler (the caller's own `on_write` is not invoked).
    pub fn write(&mut self, msg: impl Into<Outbound>) -> Result<(), Error> {
        self.fire_write(msg)
    }

    /// Assert write interest and drain what the socket will take.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.session.flush(self.env)
    }

    /// Close the session. Pending output drains first; the slot is
    /// reclaimed by the loop after the current dispatch.
    pub fn close(&mut self) {
        self.session.close(self.env);
    }

    /// Pass `on_connected` to the next handler.
    pub fn fire_connected(&mut self) -> Result<(), Error> {
        let next = self.session.pipeline.next(self.node);
        dispatch_connected(self.session, self.env, next)
    }

    /// Pass an inbound payload to the next handler.
    pub fn fire_read(&mut self, msg: &mut Inbound) -> Result<(), Error> {
        let next = self.session.pipeline.next(self.node);
        dispatch_read(self.session, self.env, next, msg)
    }

    /// Pass an outbound payload to the previous handler (toward the head).
    pub fn fire_write(&mut self, msg: impl Into<Outbound>) -> Result<(), Error> {
        let prev = self.session.pipeline.prev(self.node);
        dispatch_write(self.session, self.env, prev, msg.into())
    }

    /// Pass `on_flushed` to the next handler.
    pub fn fire_flushed(&mut self) -> Result<(), Error> {
        let next = self.session.pipeline.next(self.node);
        dispatch_flushed(self.session, self.env, next)
    }

    /// Pass an error to the next handler.
    pub fn fire_cause(&mut self, cause: &Error) {
        let next = self.session.pipeline.next(self.node);
        dispatch_cause(self.session, self.env, next, cause)
    }
}

// Dispatch functions track the session's dispatch depth so events raised
// mid-callback (e.g. a flush completing inside `on_read`) are deferred
// until the stack unwinds, instead of re-borrowing a handler cell.

pub(crate) fn dispatch_connected(
    session: &mut Session,
    env: &mut IoEnv<'_>,
    node: usize,
) -> Result<(), Error> {
    let Some(handler) = session.pipeline.handler(node) else {
        return Ok(());
    };
    let mut ctx = Context { session, env, node };
    ctx.session.depth += 1;
    let result = handler.borrow_mut().on_connected(&mut ctx);
    ctx.session.depth -= 1;
    result
}

pub(crate) fn dispatch_read(
    session: &mut Session,
    env: &mut IoEnv<'_>,
    node: usize,
    msg: &mut Inbound,
) -> Result<(), Error> {
    let Some(handler) = session.pipeline.handler(node) else {
        return Ok(());
    };
    let mut ctx = Context { session, env, node };
    ctx.session.depth += 1;
    let result = handler.borrow_mut().on_read(&mut ctx, msg);
    ctx.session.depth -= 1;
    result
}

pub(crate) fn dispatch_write(
    session: &mut Session,
    env: &mut IoEnv<'_>,
    node: usize,
    msg: Outbound,
) -> Result<(), Error> {
    let Some(handler) = session.pipeline.handler(node) else {
        return head_append(session, env, msg);
    };
    let mut ctx = Context { session, env, node };
    ctx.session.depth += 1;
    let result = handler.borrow_mut().on_write(&mut ctx, msg);
    ctx.session.depth -= 1;
    result
}

pub(crate) fn dispatch_flushed(
    session: &mut Session,
    env: &mut IoEnv<'_>,
    node: usize,
) -> Result<(), Error> {
    let Some(handler) = session.pipeline.handler(node) else {
        return Ok(());
    };
    let mut ctx = Context { session, env, node };
    ctx.session.depth += 1;
    let result = handler.borrow_mut().on_flushed(&mut ctx);
    ctx.session.depth -= 1;
    result
}

pub(crate) fn dispatch_cause(
    session: &mut Session,
    env: &mut IoEnv<'_>,
    node: usize,
    cause: &Error,
) {
    let Some(handler) = session.pipeline.handler(node) else {
        // tail default: surface the error and close the session
        warn!(id = session.id(), error = %cause, "unhandled session error");
        session.close(env);
        return;
    };
    let mut ctx = Context { session, env, node };
    ctx.session.depth += 1;
    handler.borrow_mut().on_cause(&mut ctx, cause);
    ctx.session.depth -= 1;
}

// The head sentinel's write terminal: whatever arrives must be byte-form.
fn head_append(session: &mut Session, env: &mut IoEnv<'_>, msg: Outbound) -> Result<(), Error> {
    match msg {
        Outbound::Bytes(bytes) => session.append_output(env, &bytes),
        Outbound::Buffer(buf) => {
            session.push_output_buffer(buf);
            Ok(())
        }
        Outbound::Object(_) => Err(Error::Handler(
            "non-byte payload reached pipeline head".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::pool::SlabBufferPool;
    use crate::config::Config;
    use crate::session::SessionState;
    use std::time::Instant;

    struct Fixture {
        poll: mio::Poll,
        pool: SlabBufferPool,
        store: FileStore,
        config: Config,
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture {
                poll: mio::Poll::new().unwrap(),
                pool: SlabBufferPool::new(64 * 4096, 4096),
                store: FileStore::open(1 << 20, 4096).unwrap(),
                config: Config::default(),
            }
        }

        fn env(&mut self) -> IoEnv<'_> {
            IoEnv {
                registry: self.poll.registry(),
                pool: &mut self.pool,
                store: &mut self.store,
                config: &self.config,
                now: Instant::now(),
                shutdown: false,
            }
        }

        fn session(&self) -> Session {
            Session::new(
                "test",
                1,
                0,
                mio::Token(42),
                None,
                &self.config,
                Instant::now(),
            )
        }
    }

    /// Records the order events hit it and tags outbound payloads.
    struct Recorder {
        name: &'static str,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl EventHandler for Recorder {
        fn on_connected(&mut self, ctx: &mut Context<'_, '_>) -> Result<(), Error> {
            self.log.borrow_mut().push(format!("{}:connected", self.name));
            ctx.fire_connected()
        }

        fn on_read(&mut self, ctx: &mut Context<'_, '_>, msg: &mut Inbound) -> Result<(), Error> {
            self.log.borrow_mut().push(format!("{}:read", self.name));
            ctx.fire_read(msg)
        }

        fn on_write(&mut self, ctx: &mut Context<'_, '_>, msg: Outbound) -> Result<(), Error> {
            self.log.borrow_mut().push(format!("{}:write", self.name));
            ctx.fire_write(msg)
        }
    }

    #[test]
    fn inbound_runs_head_to_tail_outbound_runs_tail_to_head() {
        let mut fx = Fixture::new();
        let mut sess = fx.session();
        let log = Rc::new(RefCell::new(Vec::new()));
        sess.add_handler(Recorder {
            name: "a",
            log: log.clone(),
        });
        sess.add_handler(Recorder {
            name: "b",
            log: log.clone(),
        });

        let mut env = fx.env();
        sess.fire_connected(&mut env).unwrap();
        sess.write(&mut env, Outbound::from(&b"x"[..])).unwrap();

        assert_eq!(
            *log.borrow(),
            vec!["a:connected", "b:connected", "b:write", "a:write"]
        );
        // the payload reached the head and landed in the output stream
        assert_eq!(sess.output_pending(), 1);
    }

    #[test]
    fn object_payload_at_head_is_an_error() {
        let mut fx = Fixture::new();
        let mut sess = fx.session();
        let mut env = fx.env();
        let result = sess.write(&mut env, Outbound::object("not bytes"));
        assert!(matches!(result, Err(Error::Handler(_))));
    }

    /// Encoder that turns string objects into bytes on the way out.
    struct Encoder;

    impl EventHandler for Encoder {
        fn on_write(&mut self, ctx: &mut Context<'_, '_>, msg: Outbound) -> Result<(), Error> {
            match msg {
                Outbound::Object(obj) => match obj.downcast::<&str>() {
                    Ok(s) => ctx.fire_write(s.as_bytes()),
                    Err(_) => Err(Error::Handler("unexpected payload".into())),
                },
                other => ctx.fire_write(other),
            }
        }
    }

    #[test]
    fn encoder_transforms_objects_before_the_head() {
        let mut fx = Fixture::new();
        let mut sess = fx.session();
        sess.add_handler(Encoder);
        let mut env = fx.env();
        sess.write(&mut env, Outbound::object("frame")).unwrap();
        assert_eq!(sess.output_pending(), 5);
    }

    #[test]
    fn unhandled_cause_closes_the_session() {
        let mut fx = Fixture::new();
        let mut sess = fx.session();
        let mut env = fx.env();
        sess.fire_cause(&mut env, &Error::ChannelClosed);
        assert_eq!(sess.state(), SessionState::Closed);
    }

    /// Swallows errors instead of letting the tail close the session.
    struct Swallow;

    impl EventHandler for Swallow {
        fn on_cause(&mut self, _ctx: &mut Context<'_, '_>, _cause: &Error) {}
    }

    #[test]
    fn handler_can_swallow_a_cause() {
        let mut fx = Fixture::new();
        let mut sess = fx.session();
        sess.add_handler(Swallow);
        let mut env = fx.env();
        sess.fire_cause(&mut env, &Error::ChannelClosed);
        assert!(sess.is_open() || sess.state() == SessionState::Connecting);
    }

    #[test]
    fn removed_handler_is_skipped() {
        struct RemoveOnConnect {
            log: Rc<RefCell<Vec<String>>>,
        }

        impl EventHandler for RemoveOnConnect {
            fn on_connected(&mut self, ctx: &mut Context<'_, '_>) -> Result<(), Error> {
                ctx.remove_self();
                ctx.fire_connected()
            }

            fn on_read(
                &mut self,
                ctx: &mut Context<'_, '_>,
                msg: &mut Inbound,
            ) -> Result<(), Error> {
                self.log.borrow_mut().push("removed:read".into());
                ctx.fire_read(msg)
            }
        }

        let mut fx = Fixture::new();
        let mut sess = fx.session();
        let log = Rc::new(RefCell::new(Vec::new()));
        sess.add_handler(RemoveOnConnect { log: log.clone() });
        sess.add_handler(Recorder {
            name: "b",
            log: log.clone(),
        });

        let mut env = fx.env();
        sess.fire_connected(&mut env).unwrap();
        assert_eq!(sess.pipeline_mut().len(), 1);

        sess.fire_read(&mut env).unwrap();
        assert_eq!(*log.borrow(), vec!["b:connected", "b:read"]);
    }
}
