//! Slotted table of live sessions, one per side (accepted vs initiated).

use std::sync::Arc;
use std::time::Instant;

use mio::Token;
use mio::net::TcpStream;
use tracing::{debug, error};

use crate::error::Error;
use crate::session::{IoEnv, Session, SessionState};

/// Builds the handler pipeline for each new session. Implemented for
/// closures, so `|session: &mut Session| session.add_handler(...)` works
/// directly in the config builder.
pub trait SessionInitializer: Send + Sync {
    fn init_session(&self, session: &mut Session);
}

impl<F> SessionInitializer for F
where
    F: Fn(&mut Session) + Send + Sync,
{
    fn init_session(&self, session: &mut Session) {
        self(session)
    }
}

/// Fixed-capacity slot table. New sessions fill the first free slot;
/// `max_index` is a high-water mark that only grows when a session is
/// placed at or above it and shrinks over trailing holes on release.
pub(crate) struct SessionManager {
    name: &'static str,
    token_base: usize,
    sessions: Vec<Option<Session>>,
    next_session_id: u64,
    max_index: usize,
    initializer: Option<Arc<dyn SessionInitializer>>,
}

impl SessionManager {
    pub(crate) fn new(
        name: &'static str,
        token_base: usize,
        max_conns: usize,
        initializer: Option<Arc<dyn SessionInitializer>>,
    ) -> SessionManager {
        let mut sessions = Vec::with_capacity(max_conns);
        sessions.resize_with(max_conns, || None);
        SessionManager {
            name,
            token_base,
            sessions,
            next_session_id: 0,
            max_index: 0,
            initializer,
        }
    }

    /// True when no live session remains below the high-water index.
    pub(crate) fn is_completed(&self) -> bool {
        self.sessions[..self.max_index]
            .iter()
            .all(|slot| slot.as_ref().is_none_or(|sess| !sess.is_active()))
    }

    #[cfg(test)]
    pub(crate) fn max_index(&self) -> usize {
        self.max_index
    }

    /// Map a selector token back to a slot, if it belongs to this manager.
    pub(crate) fn slot_of(&self, token: Token) -> Option<usize> {
        let t = token.0;
        if t >= self.token_base && t < self.token_base + self.sessions.len() {
            Some(t - self.token_base)
        } else {
            None
        }
    }

    pub(crate) fn get_mut(&mut self, slot: usize) -> Option<&mut Session> {
        self.sessions.get_mut(slot).and_then(|s| s.as_mut())
    }

    /// Build a session for `chan`, run the user initializer, configure the
    /// socket, register interest, and place it in the first free slot.
    ///
    /// With `cause` set (or on any setup failure) a transient session is
    /// built just to fire `on_cause`, and no slot is taken. Returns the
    /// occupied slot on success.
    pub(crate) fn allocate_session(
        &mut self,
        env: &mut IoEnv<'_>,
        chan: Option<TcpStream>,
        cause: Option<&Error>,
    ) -> Option<usize> {
        let id = self.next_session_id;
        self.next_session_id += 1;

        let slot = self.find_slot();
        let (slot, token) = match slot {
            Some(slot) => (slot, Token(self.token_base + slot)),
            None => {
                // table exhausted; surface the failure on a transient session
                let reason = format!(
                    "{} allocation exceeds maxConns {}",
                    self.name,
                    self.sessions.len()
                );
                let cause = Error::SessionAllocate(reason);
                self.fire_transient(env, id, chan, &cause);
                return None;
            }
        };

        let mut sess = Session::new(self.name, id, slot, token, chan, env.config, env.now);
        if let Some(init) = &self.initializer {
            init.init_session(&mut sess);
        }

        if let Some(cause) = cause {
            sess.fire_cause(env, cause);
            return None;
        }

        sess.refresh_io_timestamps(env.now);
        if let Err(e) = sess.mark_open(env) {
            error!(name = self.name, id, error = %e, "initialize session error");
            sess.fire_cause(env, &e);
            return None;
        }

        if slot >= self.max_index {
            self.max_index = slot + 1;
        }
        debug!(
            name = self.name,
            id,
            slot,
            max_index = self.max_index,
            "allocated session"
        );
        self.sessions[slot] = Some(sess);
        Some(slot)
    }

    // First empty (or fully closed) slot. The high-water guard mirrors the
    // original semantics: a table whose high-water mark reached capacity is
    // treated as exhausted.
    fn find_slot(&self) -> Option<usize> {
        if self.max_index >= self.sessions.len() {
            return None;
        }
        self.sessions.iter().position(|slot| {
            slot.as_ref()
                .is_none_or(|sess| sess.state() == SessionState::Closed)
        })
    }

    // Build, initialize, and fire `on_cause` on a session that never takes
    // a slot. Used for dial failures and table exhaustion.
    fn fire_transient(
        &self,
        env: &mut IoEnv<'_>,
        id: u64,
        chan: Option<TcpStream>,
        cause: &Error,
    ) {
        let mut sess = Session::new(
            self.name,
            id,
            usize::MAX,
            Token(self.token_base),
            chan,
            env.config,
            env.now,
        );
        if let Some(init) = &self.initializer {
            init.init_session(&mut sess);
        }
        sess.fire_cause(env, cause);
    }

    /// Report a failure (dial error, connect timeout) through a transient
    /// session so the user pipeline observes `on_cause`.
    pub(crate) fn fire_failure(&mut self, env: &mut IoEnv<'_>, cause: &Error) {
        let id = self.next_session_id;
        self.next_session_id += 1;
        self.fire_transient(env, id, None, cause);
    }

    /// Reclaim every slot whose session has fully closed, shrinking the
    /// high-water mark across trailing holes.
    pub(crate) fn sweep_closed(&mut self) {
        for slot in self.sessions[..self.max_index].iter_mut() {
            if slot
                .as_ref()
                .is_some_and(|sess| sess.state() == SessionState::Closed)
            {
                *slot = None;
            }
        }
        while self.max_index > 0 && self.sessions[self.max_index - 1].is_none() {
            self.max_index -= 1;
        }
    }

    /// Begin closing every open session; pending output drains first.
    pub(crate) fn close_all(&mut self, env: &mut IoEnv<'_>) {
        for slot in 0..self.max_index {
            if let Some(sess) = self.sessions[slot].as_mut()
                && sess.is_open()
            {
                sess.close(env);
            }
        }
    }

    /// Hard-close everything, releasing resources immediately.
    pub(crate) fn force_close_all(&mut self, env: &mut IoEnv<'_>) {
        for slot in 0..self.max_index {
            if let Some(sess) = self.sessions[slot].as_mut()
                && sess.is_active()
            {
                sess.finish_close(env);
            }
        }
        self.sweep_closed();
    }

    /// Smallest idle deadline over the open sessions.
    pub(crate) fn min_idle_deadline(&self) -> Option<Instant> {
        self.sessions[..self.max_index]
            .iter()
            .flatten()
            .filter_map(|sess| sess.idle_deadline())
            .min()
    }

    /// Run the idle sweep over every open session.
    pub(crate) fn check_idle(&mut self, env: &mut IoEnv<'_>) {
        for slot in 0..self.max_index {
            if let Some(sess) = self.sessions[slot].as_mut() {
                sess.check_idle(env);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::pool::SlabBufferPool;
    use crate::config::Config;
    use crate::store::FileStore;
    use std::net::TcpListener as StdTcpListener;

    struct Fixture {
        poll: mio::Poll,
        pool: SlabBufferPool,
        store: FileStore,
        config: Config,
        listener: StdTcpListener,
        peers: Vec<std::net::TcpStream>,
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture {
                poll: mio::Poll::new().unwrap(),
                pool: SlabBufferPool::new(64 * 4096, 4096),
                store: FileStore::open(1 << 20, 4096).unwrap(),
                config: Config::default(),
                listener: StdTcpListener::bind("127.0.0.1:0").unwrap(),
                peers: Vec::new(),
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

        fn chan(&mut self) -> TcpStream {
            let addr = self.listener.local_addr().unwrap();
            let peer = std::net::TcpStream::connect(addr).unwrap();
            let (accepted, _) = self.listener.accept().unwrap();
            accepted.set_nonblocking(true).unwrap();
            self.peers.push(peer);
            TcpStream::from_std(accepted)
        }
    }

    fn manager(max_conns: usize) -> SessionManager {
        SessionManager::new("server", 2, max_conns, None)
    }

    #[test]
    fn slots_fill_and_release_back_to_zero() {
        let mut fx = Fixture::new();
        let mut mgr = manager(4);

        let mut slots = Vec::new();
        for _ in 0..3 {
            let chan = fx.chan();
            let mut env = fx.env();
            slots.push(mgr.allocate_session(&mut env, Some(chan), None).unwrap());
        }
        assert_eq!(slots, vec![0, 1, 2]);
        assert_eq!(mgr.max_index(), 3);
        assert!(!mgr.is_completed());

        // close in allocation order; the high-water mark still returns to 0
        for slot in slots {
            let mut env = fx.env();
            if let Some(sess) = mgr.get_mut(slot) {
                sess.finish_close(&mut env);
            }
        }
        assert!(mgr.is_completed());
        mgr.sweep_closed();
        assert_eq!(mgr.max_index(), 0);
    }

    #[test]
    fn holes_fill_first() {
        let mut fx = Fixture::new();
        let mut mgr = manager(4);

        for _ in 0..3 {
            let chan = fx.chan();
            let mut env = fx.env();
            mgr.allocate_session(&mut env, Some(chan), None).unwrap();
        }

        // free the middle slot; max_index stays
        {
            let mut env = fx.env();
            mgr.get_mut(1).unwrap().finish_close(&mut env);
        }
        mgr.sweep_closed();
        assert_eq!(mgr.max_index(), 3);

        let chan = fx.chan();
        let mut env = fx.env();
        let slot = mgr.allocate_session(&mut env, Some(chan), None).unwrap();
        assert_eq!(slot, 1);
        assert_eq!(mgr.max_index(), 3);
    }

    #[test]
    fn exhausted_table_fires_session_allocate() {
        use crate::pipeline::{Context, EventHandler};
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        static FAILURES: AtomicUsize = AtomicUsize::new(0);

        struct CauseProbe;

        impl EventHandler for CauseProbe {
            fn on_cause(&mut self, ctx: &mut Context<'_, '_>, cause: &Error) {
                if matches!(cause, Error::SessionAllocate(_)) {
                    FAILURES.fetch_add(1, Ordering::SeqCst);
                }
                ctx.fire_cause(cause);
            }
        }

        let init: Arc<dyn SessionInitializer> =
            Arc::new(|session: &mut Session| session.add_handler(CauseProbe));
        let mut fx = Fixture::new();
        let mut mgr = SessionManager::new("server", 2, 1, Some(init));

        let chan = fx.chan();
        let mut env = fx.env();
        assert!(mgr.allocate_session(&mut env, Some(chan), None).is_some());

        let chan = fx.chan();
        let mut env = fx.env();
        assert!(mgr.allocate_session(&mut env, Some(chan), None).is_none());
        assert_eq!(FAILURES.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failure_cause_reaches_transient_session() {
        use crate::pipeline::{Context, EventHandler};
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        static TIMEOUTS: AtomicUsize = AtomicUsize::new(0);

        struct TimeoutProbe;

        impl EventHandler for TimeoutProbe {
            fn on_cause(&mut self, ctx: &mut Context<'_, '_>, cause: &Error) {
                if matches!(cause, Error::ConnectTimeout(_)) {
                    TIMEOUTS.fetch_add(1, Ordering::SeqCst);
                }
                ctx.fire_cause(cause);
            }
        }

        let init: Arc<dyn SessionInitializer> =
            Arc::new(|session: &mut Session| session.add_handler(TimeoutProbe));
        let mut fx = Fixture::new();
        let mut mgr = SessionManager::new("client", 2, 4, Some(init));

        let remote = "127.0.0.1:9".parse().unwrap();
        let mut env = fx.env();
        mgr.fire_failure(&mut env, &Error::ConnectTimeout(remote));
        assert_eq!(TIMEOUTS.load(Ordering::SeqCst), 1);
        assert!(mgr.is_completed());
    }
}
