//! netline — readiness-driven single-threaded TCP runtime.
//!
//! One thread, one selector: every socket, buffer, and handler callback
//! lives on the event loop thread. Connections flow through a per-session
//! pipeline of [`EventHandler`]s; reads land in pooled fixed-size buffers
//! with backpressure, writes spill to a temp-file store past a memory
//! budget and drain back out under a spin budget.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use netline::{Config, Context, Error, EventHandler, Inbound, Session};
//!
//! struct Echo;
//!
//! impl EventHandler for Echo {
//!     fn on_read(&mut self, ctx: &mut Context<'_, '_>, msg: &mut Inbound) -> Result<(), Error> {
//!         if let Some(input) = msg.as_stream() {
//!             let mut data = vec![0u8; input.available()];
//!             let (pool, store) = ctx.buffers();
//!             let n = input.read(pool, store, &mut data)?;
//!             data.truncate(n);
//!             ctx.write(data)?;
//!             ctx.flush()?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<(), Error> {
//!     let event_loop = Config::builder()
//!         .name("echo")
//!         .port(7878)
//!         .server_initializer(|session: &mut Session| session.add_handler(Echo))
//!         .boot()?;
//!     event_loop.await_termination();
//!     Ok(())
//! }
//! ```
//!
//! External threads may only enqueue work: [`EventLoop::connect_to`],
//! [`EventLoop::schedule`], and [`EventLoop::execute`] all hand off to the
//! loop thread and wake the selector. Handlers must not block.

// ── Modules ─────────────────────────────────────────────────────────────
pub mod buffer;
pub mod config;
pub mod error;
pub(crate) mod manager;
pub(crate) mod metrics;
pub mod pipeline;
pub mod session;
pub mod store;
pub mod timer;

mod event_loop;

// ── Re-exports: configuration ───────────────────────────────────────────

/// Runtime configuration.
pub use config::Config;
/// Builder for [`Config`] with discoverable methods and `build()` validation.
pub use config::ConfigBuilder;

// ── Re-exports: loop and lifecycle ──────────────────────────────────────

/// Control handle for one event loop thread.
pub use event_loop::EventLoop;
/// Loop lifecycle hooks, called on the loop thread.
pub use event_loop::EventLoopListener;
/// Builds the handler pipeline for each new session.
pub use manager::SessionInitializer;
/// Cancellation handle for a scheduled task.
pub use timer::TimerHandle;
/// Monotonic time source, injectable for tests.
pub use timer::{Clock, MonotonicClock};

// ── Re-exports: sessions and handlers ───────────────────────────────────

/// Handler view of its session.
pub use pipeline::Context;
/// A session-scoped event handler.
pub use pipeline::EventHandler;
/// Inbound payload flowing head to tail.
pub use pipeline::Inbound;
/// Outbound payload flowing tail to head.
pub use pipeline::Outbound;
/// The handler chain of one session.
pub use pipeline::Pipeline;
/// One TCP connection.
pub use session::Session;
/// Session lifecycle states.
pub use session::SessionState;

// ── Re-exports: buffering ───────────────────────────────────────────────

/// Handle over one pooled fixed-size block.
pub use buffer::Buffer;
/// Read view over queued buffers and spill regions.
pub use buffer::input::BufferInputStream;
/// Outcome of one output drain attempt.
pub use buffer::output::Drain;
/// Write view with spill-over past the memory budget.
pub use buffer::output::BufferOutputStream;
/// Fixed-size block allocator contract.
pub use buffer::pool::BufferPool;
/// Default pooled block size.
pub use buffer::pool::DEFAULT_BUFFER_SIZE;
/// Per-allocation pool variant.
pub use buffer::pool::HeapBufferPool;
/// Contiguous-slab pool variant.
pub use buffer::pool::SlabBufferPool;
/// A fixed-size slice of the spill file.
pub use store::FileRegion;
/// File-backed region pool for write spill-over.
pub use store::FileStore;
/// Hard upper bound for the store size.
pub use store::MAX_STORE_SIZE;

// ── Re-exports: errors ──────────────────────────────────────────────────

/// Runtime errors.
pub use error::Error;
/// Which direction of a session went idle.
pub use error::IdleKind;
