//! The replication client: owns the session state machine and drives
//! connect → authenticate → register → dump, feeding decoded events through
//! the dispatcher and committing positions at transaction boundaries.
//!
//! Lifecycle: build a [`Replica`], register subscribers, call
//! [`Replica::init`] once, then [`Replica::run`] with a stop predicate. The
//! predicate is consulted at every I/O boundary and between reconnect
//! attempts; a controller that needs `run` to return promptly additionally
//! calls [`Replica::close_connection`] to unblock a pending read.

use crate::decoder::{BinlogEvent, ChecksumAlgorithm, Decoder, EventType, TableDescriptor};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::position::{BinlogPosition, PositionTracker};
use crate::protocol::{Connection, Frame};
use crate::record::{EventKindMask, RowChange};
use crate::retry::ExponentialBackoff;
use crate::schema::SchemaResolver;
use crate::state::StateSink;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Connection parameters for the primary, plus the identity this client
/// presents as a replica.
#[derive(Clone)]
pub struct MasterInfo {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    /// Server id reported in `COM_REGISTER_SLAVE`; must be unique among the
    /// primary's replicas.
    pub server_id: u32,
    /// Explicit start position. Overrides whatever the state sink has
    /// saved; `None` resumes from the sink, falling back to the primary's
    /// current position.
    pub position: Option<BinlogPosition>,
}

impl MasterInfo {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 3306,
            user: user.into(),
            password: None,
            server_id: 4001,
            position: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = server_id;
        self
    }

    pub fn with_position(mut self, position: BinlogPosition) -> Self {
        self.position = Some(position);
        self
    }
}

impl std::fmt::Debug for MasterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterInfo")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("server_id", &self.server_id)
            .field("position", &self.position)
            .finish()
    }
}

/// How a dump session ended, when it ended without an error.
enum SessionEnd {
    /// The stop predicate asked us to finish.
    Stop,
    /// The stream ended or the connection was closed; reconnect.
    Disconnected,
}

/// A MySQL replication client delivering row changes to subscribers.
pub struct Replica {
    master: Mutex<MasterInfo>,
    sink: Arc<dyn StateSink>,
    dispatcher: Dispatcher,
    resolver: OnceLock<SchemaResolver>,
    position: Arc<PositionTracker>,
    shutdown: Notify,
    running: AtomicBool,
}

impl Replica {
    pub fn new(master: MasterInfo, sink: Arc<dyn StateSink>) -> Self {
        Self {
            master: Mutex::new(master),
            sink,
            dispatcher: Dispatcher::new(),
            resolver: OnceLock::new(),
            position: Arc::new(PositionTracker::new(BinlogPosition::new("", 4))),
            shutdown: Notify::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Register a callback for `(database, table)` filtered by `mask`.
    /// Registration happens before [`Replica::run`]; a second registration
    /// for the same table replaces the first.
    pub fn subscribe(
        &mut self,
        database: impl Into<String>,
        table: impl Into<String>,
        mask: EventKindMask,
        callback: impl Fn(&RowChange) + Send + Sync + 'static,
    ) {
        self.dispatcher.subscribe(database, table, mask, callback);
    }

    /// Drop UPDATE changes whose images are identical instead of delivering
    /// them. The default is to deliver.
    pub fn suppress_unchanged_updates(&mut self, suppress: bool) {
        self.dispatcher.set_suppress_unchanged_updates(suppress);
    }

    /// Bind the schema resolver, verify connectivity, and establish the
    /// start position: explicit configuration first, then the state sink,
    /// then the primary's current position.
    pub async fn init(&self) -> Result<()> {
        if self.resolver.get().is_some() {
            return Err(Error::InvalidState("already initialized".into()));
        }

        let master = self.master.lock().unwrap().clone();
        let resolver = SchemaResolver::connect(&master);
        resolver.ping().await?;

        let start = match master.position {
            Some(position) => position,
            None => match self.sink.load().await? {
                Some(position) => position,
                None => resolver.current_master_position().await?,
            },
        };
        info!("replication will start from {start}");
        self.position.set(start);

        // A racing second init loses and must not leak its pool.
        if let Err(resolver) = self.resolver.set(resolver) {
            resolver.close().await.ok();
            return Err(Error::InvalidState("already initialized".into()));
        }
        Ok(())
    }

    /// Drive replication until the stop predicate returns true or a fatal
    /// error occurs. Transient failures reconnect with exponential backoff
    /// and resume from the last committed position.
    pub async fn run<F>(&self, mut stop: F) -> Result<()>
    where
        F: FnMut() -> bool + Send,
    {
        let resolver = self
            .resolver
            .get()
            .ok_or_else(|| Error::InvalidState("run() before init()".into()))?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::InvalidState("already running".into()));
        }
        let _guard = RunningGuard(&self.running);

        let mut backoff = ExponentialBackoff::for_reconnect();
        loop {
            if stop() {
                return Ok(());
            }

            match self.session(resolver, &mut backoff, &mut stop).await {
                Ok(SessionEnd::Stop) => return Ok(()),
                Ok(SessionEnd::Disconnected) => {
                    debug!("session ended, will reconnect");
                }
                Err(e) if e.is_transient() => {
                    warn!("session failed: {e}; will reconnect");
                }
                Err(e) => {
                    error!("fatal replication error: {e}");
                    return Err(e);
                }
            }

            // Entering DISCONNECTED discards all in-transaction state; the
            // primary replays the aborted transaction after reconnect.
            self.position.reset_shadow();
            resolver.clear_cache();

            if stop() {
                return Ok(());
            }
            let delay = backoff.next_backoff();
            debug!("reconnecting in {delay:?}");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.shutdown.notified() => {}
            }
        }
    }

    /// One connect → dump session.
    async fn session<F>(
        &self,
        resolver: &SchemaResolver,
        backoff: &mut ExponentialBackoff,
        stop: &mut F,
    ) -> Result<SessionEnd>
    where
        F: FnMut() -> bool + Send,
    {
        self.sink.on_connecting().await;
        let master = self.master.lock().unwrap().clone();
        let mut conn = Connection::connect(&master).await?;
        self.sink.on_connected().await;

        // Checksum negotiation: tell the primary we understand checksummed
        // events, and learn the algorithm for frames that precede the
        // format description.
        if let Err(e) = conn
            .query("SET @master_binlog_checksum = @@global.binlog_checksum")
            .await
        {
            debug!("checksum negotiation failed (pre-5.6 primary?): {e}");
        }
        let assumed_checksum = resolver.binlog_checksum().await.unwrap_or_else(|e| {
            debug!("could not read @@global.binlog_checksum: {e}");
            ChecksumAlgorithm::Off
        });

        conn.register_slave(master.server_id).await?;

        let start = self.position.committed();
        conn.binlog_dump(master.server_id, &start).await?;

        // A successful dump setup resets the reconnect schedule.
        backoff.reset();

        let mut decoder = Decoder::new();
        decoder.set_assumed_checksum(assumed_checksum);
        let mut current_file = start.file.clone();
        let mut pending: Vec<RowChange> = Vec::new();

        loop {
            if stop() {
                return Ok(SessionEnd::Stop);
            }

            let frame = tokio::select! {
                frame = conn.next_frame() => frame?,
                _ = self.shutdown.notified() => {
                    if stop() {
                        return Ok(SessionEnd::Stop);
                    }
                    info!("connection closed by controller");
                    return Ok(SessionEnd::Disconnected);
                }
            };

            let event_bytes = match frame {
                Frame::Event(bytes) => bytes,
                Frame::Eof => {
                    debug!("binlog dump reached EOF");
                    return Ok(SessionEnd::Disconnected);
                }
            };

            let (header, event) = decoder.decode(&event_bytes)?;

            if header.timestamp != 0 {
                self.sink.on_last_event_time(header.timestamp as u64).await;
            }
            // The format description re-sent on resume sits near the start
            // of the file; advancing the shadow offset from it would move
            // the position backwards.
            let advances_position = !header.is_artificial()
                && header.next_position != 0
                && header.event_type != EventType::FormatDescription;
            if advances_position {
                self.position.note_event(header.next_position as u64);
            }

            match event {
                BinlogEvent::FormatDescription(_) => {
                    // Start of stream: publish the resume position so
                    // observers see the session is live.
                    let p = self.position.commit();
                    self.sink.on_position(&p.file, p.offset).await;
                    self.sink.save().await?;
                }
                BinlogEvent::Rotate { file, position } => {
                    let p = self.position.rotate(file, position);
                    current_file = p.file.clone();
                    resolver.clear_cache();
                    self.sink.on_position(&p.file, p.offset).await;
                    self.sink.save().await?;
                }
                BinlogEvent::TableMap(map) => {
                    let schema = resolver.describe(&map.database, &map.table).await?;
                    let descriptor = TableDescriptor::from_parts(&map, &schema)?;
                    decoder.install_table(descriptor);
                }
                BinlogEvent::Rows(rows) => {
                    let descriptor = decoder.table(rows.table_map_id).ok_or_else(|| {
                        Error::invariant("decoded rows event lost its table descriptor")
                    })?;
                    let at_position =
                        BinlogPosition::new(current_file.clone(), header.next_position as u64);
                    for pair in rows.rows {
                        pending.push(RowChange {
                            kind: rows.kind,
                            database: descriptor.database.clone(),
                            table: descriptor.table.clone(),
                            before: pair.before,
                            after: pair.after,
                            at_position: at_position.clone(),
                            is_transaction_boundary: false,
                        });
                    }
                }
                BinlogEvent::Query(query) => {
                    if query.is_ddl() {
                        match query.ddl_table() {
                            Some((db, table)) => {
                                debug!("DDL observed, invalidating schema for {db}.{table}");
                                resolver.invalidate(&db, &table);
                            }
                            None => {
                                debug!("unparseable DDL, clearing schema cache: {}", query.sql);
                                resolver.clear_cache();
                            }
                        }
                    }
                }
                BinlogEvent::Xid(_) => {
                    if let Some(last) = pending.last_mut() {
                        last.is_transaction_boundary = true;
                    }
                    for change in pending.drain(..) {
                        self.dispatcher.dispatch(&change)?;
                    }
                    let p = self.position.commit();
                    self.sink.on_position(&p.file, p.offset).await;
                    self.sink.save().await?;
                }
                BinlogEvent::Heartbeat | BinlogEvent::Skipped(_) => {}
            }
        }
    }

    /// Unblock a pending read. The supported way to make [`Replica::run`]
    /// return promptly: set the stop flag, then call this. Without the stop
    /// flag it forces a disconnect/reconnect cycle.
    pub fn close_connection(&self) {
        self.shutdown.notify_waiters();
    }

    /// Replace the connection parameters and/or the start position.
    /// Rejected while the loop is running.
    pub fn set_master_info(&self, info: MasterInfo) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(Error::InvalidState(
                "cannot change master info while running".into(),
            ));
        }
        if let Some(position) = &info.position {
            self.position.set(position.clone());
        }
        *self.master.lock().unwrap() = info;
        Ok(())
    }

    /// Current connection parameters, with the committed position folded in.
    pub fn master_info(&self) -> MasterInfo {
        let mut info = self.master.lock().unwrap().clone();
        if let Some(position) = self.last_binlog() {
            info.position = Some(position);
        }
        info
    }

    /// Last committed binlog position, if a start position is known yet.
    pub fn last_binlog(&self) -> Option<BinlogPosition> {
        let committed = self.position.committed();
        if committed.file.is_empty() {
            None
        } else {
            Some(committed)
        }
    }

    /// Block the calling thread until `target` has been committed. Intended
    /// for observer threads outside the replication runtime.
    pub fn wait_for_position(&self, target: &BinlogPosition, timeout: Duration) -> bool {
        self.position.wait_for(target, timeout)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Tear down the schema resolver's connection pool.
    pub async fn dispose(&self) -> Result<()> {
        if let Some(resolver) = self.resolver.get() {
            resolver.close().await?;
        }
        Ok(())
    }
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
