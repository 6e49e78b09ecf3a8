// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The connection pool and request manager.
//!
//! The pool hands out connections keyed by [`Target`] with one extra
//! restriction on top of `max_connections`: each thread gets at most one
//! connection per target.  Requests from the same thread to the same target
//! share that connection and ride HTTP/1.1 pipelining; to talk to one server
//! over several sockets at once you must use several threads.
//!
//! A connection lives in exactly one of two sets — active, keyed by
//! `(thread, target)`, or idle, keyed by target — or it is gone.  All set
//! transitions happen under one mutex paired with a condvar on which
//! [`Pool::queue_request`] waits when the pool is saturated.  Teardown work
//! (closing or killing sockets) always happens outside that lock.

use std::{
    collections::HashMap,
    net::{SocketAddr, ToSocketAddrs},
    sync::{Arc, Condvar, Mutex, Weak, atomic::AtomicU64, atomic::Ordering},
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use crate::{
    cfg::config::Config,
    client::{
        common::{Target, lock, now_millis},
        connection::Connection,
        sock,
    },
    handlers::auth::{Challenge, Credentials},
    models::{error::Error, message::SharedRequest},
};

#[derive(Default)]
struct PoolState {
    /// Active connections, unique per `(thread, target)`.
    active_by_thread_target: HashMap<(ThreadId, Target), Arc<Connection>>,
    /// The same connections indexed per thread for the driver.
    active_by_thread: HashMap<ThreadId, HashMap<u64, Arc<Connection>>>,
    /// Idle connections per target.
    idle_by_target: HashMap<Target, HashMap<u64, Arc<Connection>>>,
    /// Every idle connection, for counting and eviction.
    idle_by_id: HashMap<u64, Arc<Connection>>,
    /// Latched by [`Pool::close`]; queueing fails from then on.
    closing: bool,
}

impl PoolState {
    fn total(&self) -> usize {
        self.active_by_thread_target.len() + self.idle_by_id.len()
    }
}

/// Manages the sending of HTTP/1.1 requests and the receiving of responses.
pub struct Pool {
    cfg: Config,
    state: Mutex<PoolState>,
    cond: Condvar,
    next_id: AtomicU64,
    credentials: Mutex<Vec<Arc<dyn Credentials>>>,
    /// Cached resolver results keyed on `(host, port)`.
    dns_cache: DashMap<(String, u16), Vec<SocketAddr>>,
    self_weak: Weak<Pool>,
}

impl Pool {
    pub fn new(cfg: Config) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            cfg,
            state: Mutex::new(PoolState::default()),
            cond: Condvar::new(),
            next_id: AtomicU64::new(1),
            credentials: Mutex::new(Vec::new()),
            dns_cache: DashMap::new(),
            self_weak: self_weak.clone(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Instructs the manager to start processing `request`.
    ///
    /// `timeout` bounds the wait for a free connection slot: `None` waits
    /// forever, zero fails immediately.  Saturation surfaces as
    /// [`Error::ManagerBusy`], a closing pool as [`Error::ConnectionClosed`].
    pub fn queue_request(
        &self,
        request: &SharedRequest,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        let mut req = lock(request);
        self.queue_request_locked(&mut *req, request.clone(), timeout)
    }

    /// The re-entrant flavor used by request policy code that already holds
    /// the request lock (redirect and authentication resends).
    pub(crate) fn queue_request_locked(
        &self,
        req: &mut (dyn crate::models::message::HttpRequest + Send),
        handle: SharedRequest,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        let user_agent = self.cfg.http.effective_user_agent();
        if !user_agent.is_empty() && !req.has_header("User-Agent") {
            req.set_header("User-Agent", &user_agent);
        }
        let target = req.target()?;
        let thread_id = thread::current().id();
        let start = Instant::now();
        let mut st = lock(&self.state);
        if st.closing {
            return Err(Error::ConnectionClosed);
        }
        let connection = loop {
            // Step 1: an active connection to the same target already bound
            // to this thread.
            if let Some(connection) =
                st.active_by_thread_target.get(&(thread_id, target.clone()))
            {
                break connection.clone();
            }
            // Step 2: the youngest idle connection to the same target.
            let youngest = st.idle_by_target.get(&target).and_then(|idle| {
                idle.values()
                    .max_by_key(|c| c.last_active.load(Ordering::Relaxed))
                    .cloned()
            });
            if let Some(connection) = youngest {
                Self::activate(&mut st, &connection, thread_id);
                break connection;
            }
            // Step 3: room for a new connection.
            if st.total() < self.cfg.pool.max_connections as usize {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let connection = Connection::new(
                    self.self_weak.clone(),
                    id,
                    target.clone(),
                    &self.cfg,
                );
                Self::activate(&mut st, &connection, thread_id);
                break connection;
            }
            // Step 4: evict the oldest idle connection and go round again.
            let oldest = st
                .idle_by_id
                .values()
                .min_by_key(|c| c.last_active.load(Ordering::Relaxed))
                .cloned();
            if let Some(oldest) = oldest {
                Self::remove_idle(&mut st, &oldest);
                // Close outside the pool lock.
                drop(st);
                info!(connection = ?oldest, "evicting idle connection");
                oldest.close(None);
                st = lock(&self.state);
                continue;
            }
            // Step 5: wait for something to change.
            match timeout {
                Some(t) if t.is_zero() => {
                    warn!(
                        "non-blocking call to queue_request failed to obtain \
                         an HTTP connection"
                    );
                    return Err(Error::ManagerBusy);
                },
                Some(t) if start.elapsed() >= t => {
                    warn!(
                        "queue_request timed out while waiting for an HTTP \
                         connection"
                    );
                    return Err(Error::ManagerBusy);
                },
                Some(t) => {
                    debug!("queue_request forced to wait for an HTTP connection");
                    let remaining = t - start.elapsed();
                    st = self
                        .cond
                        .wait_timeout(st, remaining)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                },
                None => {
                    debug!("queue_request forced to wait for an HTTP connection");
                    st = self
                        .cond
                        .wait(st)
                        .unwrap_or_else(|e| e.into_inner());
                },
            }
        };
        connection.push_request(handle);
        drop(st);
        req.set_client(self.self_weak.clone());
        Ok(())
    }

    /// Moves a connection into the active maps, pulling it out of the idle
    /// maps if it was resting there.
    fn activate(
        st: &mut PoolState,
        connection: &Arc<Connection>,
        thread_id: ThreadId,
    ) {
        *lock(&connection.owner) = Some(thread_id);
        let target = connection.target().clone();
        st.active_by_thread_target
            .insert((thread_id, target.clone()), connection.clone());
        st.active_by_thread
            .entry(thread_id)
            .or_default()
            .insert(connection.id(), connection.clone());
        if st.idle_by_id.remove(&connection.id()).is_some()
            && let Some(idle) = st.idle_by_target.get_mut(&target)
        {
            idle.remove(&connection.id());
            if idle.is_empty() {
                st.idle_by_target.remove(&target);
            }
        }
    }

    fn remove_idle(st: &mut PoolState, connection: &Arc<Connection>) {
        if st.idle_by_id.remove(&connection.id()).is_some() {
            let target = connection.target();
            if let Some(idle) = st.idle_by_target.get_mut(target) {
                idle.remove(&connection.id());
                if idle.is_empty() {
                    st.idle_by_target.remove(target);
                }
            }
        }
    }

    /// Returns a connection that went idle to the pool.  It is possible the
    /// connection was killed behind our back, so it moves to the idle set
    /// only if it was still accounted active.
    pub(crate) fn deactivate_connection(&self, connection: &Arc<Connection>) {
        let mut st = lock(&self.state);
        let owner = *lock(&connection.owner);
        if let Some(thread_id) = owner {
            let key = (thread_id, connection.target().clone());
            if st.active_by_thread_target.remove(&key).is_some() {
                st.idle_by_id
                    .insert(connection.id(), connection.clone());
                st.idle_by_target
                    .entry(connection.target().clone())
                    .or_default()
                    .insert(connection.id(), connection.clone());
                // Tell a thread waiting for a connection slot.
                self.cond.notify_one();
            }
            if let Some(active) = st.active_by_thread.get_mut(&thread_id) {
                active.remove(&connection.id());
                if active.is_empty() {
                    st.active_by_thread.remove(&thread_id);
                }
            }
        }
        *lock(&connection.owner) = None;
    }

    /// Total number of active connections.
    pub fn active_count(&self) -> usize {
        lock(&self.state).active_by_thread_target.len()
    }

    /// Number of active connections bound to the calling thread.
    pub fn thread_active_count(&self) -> usize {
        let thread_id = thread::current().id();
        lock(&self.state)
            .active_by_thread
            .get(&thread_id)
            .map_or(0, HashMap::len)
    }

    /// Total number of idle connections.
    pub fn idle_count(&self) -> usize {
        lock(&self.state).idle_by_id.len()
    }

    /// Processes all connections bound to the current thread, then blocks
    /// for at most `timeout` waiting for any of their sockets to become
    /// ready.  Returns whether at least one connection was active.
    ///
    /// Every error a step raises is routed to that connection's close path;
    /// readiness-wait errors are ignored because they surface again
    /// per-connection on the next pass.
    pub fn thread_task(&self, timeout: Option<Duration>) -> bool {
        let thread_id = thread::current().id();
        let connections: Vec<Arc<Connection>> = {
            let st = lock(&self.state);
            st.active_by_thread
                .get(&thread_id)
                .map(|m| m.values().cloned().collect())
                .unwrap_or_default()
        };
        if connections.is_empty() {
            return false;
        }
        let mut readers = Vec::new();
        let mut writers = Vec::new();
        for connection in &connections {
            match connection.connection_task() {
                Ok((read_fd, write_fd)) => {
                    readers.extend(read_fd);
                    writers.extend(write_fd);
                },
                Err(err) => connection.close(Some(err)),
            }
        }
        let skip_wait = timeout.is_some_and(|t| t.is_zero());
        if !skip_wait && !(readers.is_empty() && writers.is_empty()) {
            debug!(
                readers = readers.len(),
                writers = writers.len(),
                "thread_task waiting for readiness"
            );
            if let Err(err) = sock::wait_ready(&readers, &writers, timeout) {
                error!("socket error from readiness wait: {err}");
            }
        }
        true
    }

    /// Repeatedly calls [`Pool::thread_task`] until it returns `false`.
    pub fn thread_loop(&self, timeout: Option<Duration>) {
        while self.thread_task(timeout) {}
    }

    /// Queues `request` and drives [`Pool::thread_loop`] until all HTTP
    /// activity initiated by the current thread is exhausted.
    pub fn process_request(
        &self,
        request: &SharedRequest,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        self.queue_request(request, timeout)?;
        self.thread_loop(timeout);
        Ok(())
    }

    /// Closes idle connections that have been inactive for more than
    /// `max_inactive`.
    pub fn idle_cleanup(&self, max_inactive: Duration) {
        let cutoff =
            now_millis().saturating_sub(max_inactive.as_millis() as u64);
        let mut stale = Vec::new();
        {
            let mut st = lock(&self.state);
            let old: Vec<Arc<Connection>> = st
                .idle_by_id
                .values()
                .filter(|c| c.last_active.load(Ordering::Relaxed) <= cutoff)
                .cloned()
                .collect();
            for connection in old {
                Self::remove_idle(&mut st, &connection);
                stale.push(connection);
            }
        }
        // The sockets can be torn down in a more leisurely fashion now.
        if !stale.is_empty() {
            debug!(count = stale.len(), "idle_cleanup closing connections");
            for connection in stale {
                connection.close(None);
            }
        }
    }

    /// Kills active connections that have been inactive for more than
    /// `max_inactive` — typically connections abandoned by a thread that
    /// stopped calling [`Pool::thread_task`].  Safe to call from any thread.
    pub fn active_cleanup(&self, max_inactive: Duration) {
        let cutoff =
            now_millis().saturating_sub(max_inactive.as_millis() as u64);
        let mut stale = Vec::new();
        {
            let mut st = lock(&self.state);
            let old: Vec<Arc<Connection>> = st
                .active_by_thread_target
                .values()
                .filter(|c| c.last_active.load(Ordering::Relaxed) <= cutoff)
                .cloned()
                .collect();
            for connection in old {
                let owner = *lock(&connection.owner);
                if let Some(thread_id) = owner {
                    st.active_by_thread_target
                        .remove(&(thread_id, connection.target().clone()));
                    if let Some(active) = st.active_by_thread.get_mut(&thread_id)
                    {
                        active.remove(&connection.id());
                        if active.is_empty() {
                            st.active_by_thread.remove(&thread_id);
                        }
                    }
                }
                stale.push(connection);
            }
            // Threads stuck waiting for a slot can wake up, one per
            // connection killed.
            for _ in &stale {
                self.cond.notify_one();
            }
        }
        if !stale.is_empty() {
            debug!(count = stale.len(), "active_cleanup killing connections");
            for connection in stale {
                connection.kill();
            }
        }
    }

    /// Closes all connections and refuses new requests from now on.  Active
    /// connections are killed, idle connections are closed.  Idempotent.
    pub fn close(&self) {
        loop {
            {
                let mut st = lock(&self.state);
                st.closing = true;
                if st.total() == 0 {
                    break;
                }
            }
            self.active_cleanup(Duration::ZERO);
            self.idle_cleanup(Duration::ZERO);
        }
    }

    /// Registers credentials for use in response to 401 challenges.
    pub fn add_credentials(&self, credentials: Arc<dyn Credentials>) {
        lock(&self.credentials).push(credentials);
    }

    /// Removes previously added credentials.  Unknown entries are silently
    /// ignored: two threads may race to remove the same failed credentials.
    pub fn remove_credentials(&self, credentials: &Arc<dyn Credentials>) {
        lock(&self.credentials)
            .retain(|known| !Arc::ptr_eq(known, credentials));
    }

    /// Searches for credentials matching `challenge`.
    pub fn find_credentials(
        &self,
        challenge: &Challenge,
    ) -> Option<Arc<dyn Credentials>> {
        debug!(
            space = ?challenge.protection_space,
            scheme = %challenge.scheme,
            "searching for matching credentials"
        );
        lock(&self.credentials)
            .iter()
            .find(|c| c.match_challenge(challenge))
            .cloned()
    }

    /// Searches for credentials that already proved themselves for `url`.
    pub fn find_credentials_by_url(
        &self,
        url: &url::Url,
    ) -> Option<Arc<dyn Credentials>> {
        lock(&self.credentials)
            .iter()
            .find(|c| c.test_url(url))
            .cloned()
    }

    /// Resolves `host:port`, caching the result.  The lookup itself runs
    /// without any lock held; racing threads may duplicate the work, which
    /// is better than a complete block.
    pub fn dnslookup(
        &self,
        host: &str,
        port: u16,
    ) -> Result<Vec<SocketAddr>, Error> {
        let key = (host.to_string(), port);
        if let Some(cached) = self.dns_cache.get(&key) {
            return Ok(cached.clone());
        }
        debug!(host, port, "looking up");
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| {
                Error::Http(format!("failed to resolve {host}: {e}"))
            })?
            .collect();
        if addrs.is_empty() {
            return Err(Error::Http(format!("no addresses for {host}")));
        }
        // Blindly populate the cache.
        self.dns_cache.insert(key, addrs.clone());
        Ok(addrs)
    }

    /// Flushes the DNS cache.
    pub fn flush_dns(&self) {
        self.dns_cache.clear();
    }
}
