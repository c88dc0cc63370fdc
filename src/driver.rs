//! Connection state machine and query pipeline.
//!
//! A connection moves Disconnected → Connecting → Idle ⇄ Busy, driven
//! entirely by socket readiness events. Exactly one query is in flight at a
//! time; each pipeline phase returns to the event loop and resumes from a
//! readiness or timer callback.

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use tracing::{error, warn};

use crate::api::{self, DbState, SqlDriverDef, SQL_CONNECT_TIMEOUT_SECS, SQL_QUERY_TIMEOUT_SECS};
use crate::event::{EventLoop, IoDir, IoWatch, Timer};
use crate::pq::client::PqClient;
use crate::pq::{escape, ConnStatus, FlushStatus, PgClient, PollingStatus, ResultStatus};
use crate::result::{not_connected_result, ResultInner, SqlResult};

/// Warn when name resolution inside the vendor connect starter takes
/// longer than this.
const DNS_WARN: Duration = Duration::from_millis(500);

/// Factory producing vendor handles from a connect string. The default
/// builds the real protocol engine; tests substitute scripted clients.
pub type ClientFactory = Rc<dyn Fn(&str) -> Box<dyn PgClient>>;

pub(crate) struct DbInner {
    pub(crate) connect_string: String,
    pub(crate) host: Option<String>,
    pub(crate) client: Option<Box<dyn PgClient>>,
    pub(crate) state: DbState,
    pub(crate) connect_state: &'static str,
    pub(crate) fatal_error: bool,
    /// Cached last error text, also fed by `SqlResult::error`.
    pub(crate) error: Option<String>,
    /// The in-flight result. The driver's strong handles live in the phase
    /// callbacks; this weak back-pointer identifies it.
    pub(crate) cur_result: Weak<RefCell<ResultInner>>,
    pub(crate) sync_result: Option<SqlResult>,
    /// Private loop while a synchronous call is in progress.
    pub(crate) ioloop: Option<Rc<EventLoop>>,
    pub(crate) orig_ioloop: Option<Rc<EventLoop>>,
    /// Single-slot continuation, consumed when the FSM would return to
    /// Idle. Returns true when it kept the connection busy.
    pub(crate) next_callback: Option<Box<dyn FnOnce() -> bool>>,
    pub(crate) io: Option<IoWatch>,
    pub(crate) io_dir: Option<IoDir>,
    pub(crate) to_connect: Option<Timer>,
    pub(crate) last_connect_try: Option<Instant>,
    pub(crate) no_reconnect: bool,
    pub(crate) state_change_cb: Option<Rc<dyn Fn(DbState)>>,
    pub(crate) connect_timeout_secs: u64,
    pub(crate) query_timeout_secs: u64,
    pub(crate) client_factory: ClientFactory,
}

pub(crate) fn prefix(inner: &DbInner) -> String {
    match &inner.host {
        Some(host) => format!("pgsql({})", host),
        None => "pgsql".to_string(),
    }
}

fn last_error(client: &dyn PgClient) -> String {
    let msg = client.error_message();
    if msg.is_empty() {
        return "(no error set)".to_string();
    }
    match msg.strip_suffix('\n') {
        Some(stripped) => stripped.to_string(),
        None => msg,
    }
}

/// Publish a state change to the generic layer's listener.
///
/// While a private loop is active the outer loop is restored as current
/// around the listener call, so the caller can add and remove timers on
/// the loop it knows about.
pub(crate) fn set_state(db: &Rc<RefCell<DbInner>>, state: DbState) {
    let (listener, private, orig, changed) = {
        let mut inner = db.borrow_mut();
        debug_assert!(state == DbState::Busy || inner.cur_result.upgrade().is_none());
        let changed = inner.state != state;
        inner.state = state;
        (
            inner.state_change_cb.clone(),
            inner.ioloop.clone(),
            inner.orig_ioloop.clone(),
            changed,
        )
    };
    if !changed {
        return;
    }
    if private.is_some() {
        if let Some(orig) = &orig {
            EventLoop::set_current(orig);
        }
    }
    if let Some(listener) = listener {
        listener(state);
    }
    if let Some(private) = &private {
        EventLoop::set_current(private);
    }
}

pub(crate) fn run_next_callback(db: &Rc<RefCell<DbInner>>) -> bool {
    let callback = db.borrow_mut().next_callback.take();
    match callback {
        Some(callback) => callback(),
        None => false,
    }
}

fn stop_io(db: &Rc<RefCell<DbInner>>) {
    let watch = {
        let mut inner = db.borrow_mut();
        inner.io_dir = None;
        inner.io.take()
    };
    // The watch closure and its captures die here, outside the borrow.
    drop(watch);
}

pub(crate) fn close(db: &Rc<RefCell<DbInner>>) {
    stop_io(db);
    let (client, timer) = {
        let mut inner = db.borrow_mut();
        inner.fatal_error = false;
        (inner.client.take(), inner.to_connect.take())
    };
    drop(timer);
    drop(client);
    set_state(db, DbState::Disconnected);

    let private = db.borrow().ioloop.clone();
    if let Some(private) = private {
        // A synchronous call is waiting inside the private loop; stop it.
        private.stop();
    }
    run_next_callback(db);
}

/// The FSM's return-to-idle point: a fatal error forces close, a deferred
/// continuation keeps the connection busy, otherwise the state drops to
/// Idle.
pub(crate) fn set_idle(db: &Rc<RefCell<DbInner>>) {
    debug_assert_eq!(db.borrow().state, DbState::Busy);
    if db.borrow().fatal_error {
        close(db);
    } else if !run_next_callback(db) {
        set_state(db, DbState::Idle);
    }
}

enum DrainStep {
    Wait(RawFd),
    Again,
    Done,
}

/// Read and discard the remaining server responses after the caller
/// released its result, then return to idle.
pub(crate) fn consume_results(db: &Rc<RefCell<DbInner>>) {
    stop_io(db);

    loop {
        let step = {
            let mut inner = db.borrow_mut();
            match inner.client.as_mut() {
                None => DrainStep::Done,
                Some(client) => {
                    if !client.consume_input() {
                        DrainStep::Done
                    } else if client.is_busy() {
                        DrainStep::Wait(client.socket_fd())
                    } else {
                        match client.get_result() {
                            Some(_extra) => DrainStep::Again,
                            None => DrainStep::Done,
                        }
                    }
                }
            }
        };
        match step {
            DrainStep::Again => continue,
            DrainStep::Done => break,
            DrainStep::Wait(fd) => {
                let db2 = db.clone();
                let watch = EventLoop::current().watch_io(
                    fd,
                    IoDir::Read,
                    Box::new(move || consume_results(&db2)),
                );
                let mut inner = db.borrow_mut();
                inner.io = Some(watch);
                inner.io_dir = Some(IoDir::Read);
                return;
            }
        }
    }

    let bad = {
        let inner = db.borrow();
        match inner.client.as_ref() {
            None => true,
            Some(client) => client.status() == ConnStatus::Bad,
        }
    };
    if bad {
        close(db);
    } else {
        set_idle(db);
    }
}

pub(crate) fn result_finish(db: &Rc<RefCell<DbInner>>, result: &SqlResult) {
    let timer = result.inner.borrow_mut().timer.take();
    drop(timer);

    {
        let mut inner = db.borrow_mut();
        debug_assert!(inner.io.is_none());
        // A lost connection may not be visible in the connection status
        // yet; an absent or fatal server result means the same thing.
        let bad = match inner.client.as_ref() {
            None => true,
            Some(client) => client.status() == ConnStatus::Bad,
        };
        let fatal = {
            let r = result.inner.borrow();
            bad || r.pgres.is_none()
                || r.pgres
                    .as_ref()
                    .map(|p| p.status() == ResultStatus::FatalError)
                    .unwrap_or(false)
        };
        if fatal {
            inner.fatal_error = true;
        }
        if inner.fatal_error {
            let mut r = result.inner.borrow_mut();
            r.failed = true;
            r.try_retry = true;
        }
    }

    let callback = result.inner.borrow_mut().callback.take();
    if let Some(callback) = callback {
        result.inner.borrow_mut().callback_running = true;
        callback(result);
        result.inner.borrow_mut().callback_running = false;
    }

    let private = db.borrow().ioloop.clone();
    if let Some(private) = private {
        private.stop();
    }
}

fn watch_write(db: &Rc<RefCell<DbInner>>, result: SqlResult) {
    let fd = db
        .borrow()
        .client
        .as_ref()
        .map(|c| c.socket_fd())
        .unwrap_or(-1);
    let db2 = db.clone();
    let r2 = result.clone();
    let watch = EventLoop::current().watch_io(
        fd,
        IoDir::Write,
        Box::new(move || flush_callback(&db2, r2.clone())),
    );
    let mut inner = db.borrow_mut();
    inner.io = Some(watch);
    inner.io_dir = Some(IoDir::Write);
}

fn flush_callback(db: &Rc<RefCell<DbInner>>, result: SqlResult) {
    stop_io(db);

    let status = {
        let mut inner = db.borrow_mut();
        match inner.client.as_mut() {
            Some(client) => client.flush(),
            None => FlushStatus::Failed,
        }
    };
    match status {
        FlushStatus::Pending => watch_write(db, result),
        FlushStatus::Failed => result_finish(db, &result),
        FlushStatus::Done => fetch_result(db, result),
    }
}

enum FetchStep {
    Wait(RawFd),
    Finish,
}

fn fetch_result(db: &Rc<RefCell<DbInner>>, result: SqlResult) {
    stop_io(db);

    let step = {
        let mut inner = db.borrow_mut();
        match inner.client.as_mut() {
            None => FetchStep::Finish,
            Some(client) => {
                if !client.consume_input() {
                    FetchStep::Finish
                } else if client.is_busy() {
                    FetchStep::Wait(client.socket_fd())
                } else {
                    let pgres = client.get_result();
                    result.inner.borrow_mut().pgres = pgres;
                    FetchStep::Finish
                }
            }
        }
    };
    match step {
        FetchStep::Finish => result_finish(db, &result),
        FetchStep::Wait(fd) => {
            let db2 = db.clone();
            let r2 = result.clone();
            let watch = EventLoop::current().watch_io(
                fd,
                IoDir::Read,
                Box::new(move || fetch_result(&db2, r2.clone())),
            );
            let mut inner = db.borrow_mut();
            inner.io = Some(watch);
            inner.io_dir = Some(IoDir::Read);
        }
    }
}

fn query_timeout(db: &Rc<RefCell<DbInner>>, result: &SqlResult) {
    stop_io(db);

    let pfx = prefix(&db.borrow());
    error!("{}: Query timed out, aborting", pfx);
    result.inner.borrow_mut().timeout = true;
    result_finish(db, result);
}

enum SendStep {
    Fail,
    Write,
    Fetch,
}

fn do_query(db: &Rc<RefCell<DbInner>>, result: SqlResult, query: &str) {
    {
        let inner = db.borrow();
        assert!(
            inner.state.is_ready(),
            "pgsql: query dispatched while not connected"
        );
        assert!(
            inner.cur_result.upgrade().is_none(),
            "pgsql: a query is already in flight"
        );
        assert!(inner.io.is_none());
    }
    set_state(db, DbState::Busy);
    db.borrow_mut().cur_result = result.downgrade();

    let timeout = Duration::from_secs(db.borrow().query_timeout_secs);
    let timer = {
        let db2 = db.clone();
        let r2 = result.clone();
        EventLoop::current().add_timer(timeout, Box::new(move || query_timeout(&db2, &r2)))
    };
    result.inner.borrow_mut().timer = Some(timer);

    let step = {
        let mut inner = db.borrow_mut();
        match inner.client.as_mut() {
            None => SendStep::Fail,
            Some(client) => {
                if !client.send_query(query) {
                    SendStep::Fail
                } else {
                    match client.flush() {
                        FlushStatus::Failed => SendStep::Fail,
                        FlushStatus::Pending => SendStep::Write,
                        FlushStatus::Done => SendStep::Fetch,
                    }
                }
            }
        }
    };
    match step {
        SendStep::Fail => result_finish(db, &result),
        SendStep::Write => watch_write(db, result),
        SendStep::Fetch => fetch_result(db, result),
    }
}

fn connect_callback(db: &Rc<RefCell<DbInner>>) {
    stop_io(db);

    let polled = {
        let mut inner = db.borrow_mut();
        match inner.client.as_mut() {
            Some(client) => client.connect_poll(),
            None => PollingStatus::Failed,
        }
    };

    let dir = match polled {
        PollingStatus::Reading => {
            db.borrow_mut().connect_state = "wait for input";
            Some(IoDir::Read)
        }
        PollingStatus::Writing => {
            db.borrow_mut().connect_state = "wait for output";
            Some(IoDir::Write)
        }
        PollingStatus::Ok => None,
        PollingStatus::Failed => {
            let (pfx, dbname, err, state) = {
                let inner = db.borrow();
                (
                    prefix(&inner),
                    inner
                        .client
                        .as_ref()
                        .map(|c| c.db_name().to_string())
                        .unwrap_or_default(),
                    inner
                        .client
                        .as_ref()
                        .map(|c| last_error(c.as_ref()))
                        .unwrap_or_default(),
                    inner.connect_state,
                )
            };
            error!(
                "{}: Connect failed to database {}: {} (state: {})",
                pfx, dbname, err, state
            );
            close(db);
            return;
        }
    };

    match dir {
        Some(dir) => {
            let fd = db
                .borrow()
                .client
                .as_ref()
                .map(|c| c.socket_fd())
                .unwrap_or(-1);
            let db2 = db.clone();
            let watch =
                EventLoop::current().watch_io(fd, dir, Box::new(move || connect_callback(&db2)));
            let mut inner = db.borrow_mut();
            inner.io = Some(watch);
            inner.io_dir = Some(dir);
        }
        None => {
            let timer = {
                let mut inner = db.borrow_mut();
                inner.connect_state = "connected";
                inner.to_connect.take()
            };
            drop(timer);
            set_state(db, DbState::Idle);

            let private = db.borrow().ioloop.clone();
            if let Some(private) = private {
                // A sync caller is waiting for the connect to finish.
                private.stop();
            }
        }
    }
}

fn connect_timeout(db: &Rc<RefCell<DbInner>>) {
    let (pfx, secs, state) = {
        let inner = db.borrow();
        (
            prefix(&inner),
            inner
                .last_connect_try
                .map(|t| t.elapsed().as_secs())
                .unwrap_or(0),
            inner.connect_state,
        )
    };
    error!(
        "{}: Connect failed: Timeout after {} seconds (state: {})",
        pfx, secs, state
    );
    close(db);
}

pub(crate) fn sync_init(db: &Rc<RefCell<DbInner>>) {
    let orig = EventLoop::current();
    db.borrow_mut().orig_ioloop = Some(orig);

    if db.borrow().io.is_none() {
        let private = EventLoop::new();
        db.borrow_mut().ioloop = Some(private.clone());
        EventLoop::set_current(&private);
        return;
    }

    debug_assert_eq!(db.borrow().state, DbState::Connecting);

    // Move the existing connect watch and timeout onto the private loop.
    let dir = db.borrow().io_dir;
    let had_timer = db.borrow().to_connect.is_some();
    stop_io(db);
    let timer = db.borrow_mut().to_connect.take();
    drop(timer);

    let private = EventLoop::new();
    db.borrow_mut().ioloop = Some(private.clone());
    EventLoop::set_current(&private);

    if had_timer {
        let timeout = Duration::from_secs(db.borrow().connect_timeout_secs);
        let db2 = db.clone();
        let timer = private.add_timer(timeout, Box::new(move || connect_timeout(&db2)));
        db.borrow_mut().to_connect = Some(timer);
    }
    let fd = db
        .borrow()
        .client
        .as_ref()
        .map(|c| c.socket_fd())
        .unwrap_or(-1);
    let dir = dir.unwrap_or(IoDir::Write);
    let db2 = db.clone();
    let watch = private.watch_io(fd, dir, Box::new(move || connect_callback(&db2)));
    {
        let mut inner = db.borrow_mut();
        inner.io = Some(watch);
        inner.io_dir = Some(dir);
    }

    // Wait for the connect to settle before the caller issues its query.
    private.run();
}

pub(crate) fn sync_deinit(db: &Rc<RefCell<DbInner>>) {
    let (private, orig) = {
        let mut inner = db.borrow_mut();
        (inner.ioloop.take(), inner.orig_ioloop.take())
    };
    drop(private);
    if let Some(orig) = orig {
        EventLoop::set_current(&orig);
    }
}

pub(crate) fn sync_query(db: &Rc<RefCell<DbInner>>, query: &str) -> SqlResult {
    debug_assert!(db.borrow().sync_result.is_none());

    let state = db.borrow().state;
    match state {
        DbState::Connecting | DbState::Busy => {
            unreachable!("pgsql: synchronous query in state {:?}", state)
        }
        DbState::Disconnected => return not_connected_result(),
        DbState::Idle => {}
    }

    let db2 = db.clone();
    let result = SqlResult::new(
        Rc::downgrade(db),
        Box::new(move |result: &SqlResult| {
            db2.borrow_mut().sync_result = Some(result.clone());
        }),
    );
    do_query(db, result, query);

    let pending = db.borrow().sync_result.is_none();
    if pending {
        let private = db.borrow().ioloop.clone();
        if let Some(private) = private {
            private.run();
        }
    }
    debug_assert!(db.borrow().io.is_none());

    db.borrow_mut()
        .sync_result
        .take()
        .unwrap_or_else(not_connected_result)
}

/// Handle to a driver instance. Cloning shares the same connection.
pub struct PgsqlDb {
    pub(crate) inner: Rc<RefCell<DbInner>>,
}

impl Clone for PgsqlDb {
    fn clone(&self) -> Self {
        PgsqlDb {
            inner: self.inner.clone(),
        }
    }
}

impl PgsqlDb {
    /// Create a driver instance. Only the `host=` token of the connect
    /// string is interpreted here, for log prefixes; the rest is passed to
    /// the vendor engine verbatim. Performs no I/O.
    pub fn init(connect_string: &str) -> PgsqlDb {
        PgsqlDb::init_with_client_factory(
            connect_string,
            Rc::new(|cs: &str| Box::new(PqClient::connect_start(cs)) as Box<dyn PgClient>),
        )
    }

    /// Create a driver instance with a custom vendor-handle factory.
    pub fn init_with_client_factory(connect_string: &str, factory: ClientFactory) -> PgsqlDb {
        let host = connect_string
            .split_whitespace()
            .filter_map(|token| token.strip_prefix("host="))
            .last()
            .map(str::to_string);

        PgsqlDb {
            inner: Rc::new(RefCell::new(DbInner {
                connect_string: connect_string.to_string(),
                host,
                client: None,
                state: DbState::Disconnected,
                connect_state: "not connected",
                fatal_error: false,
                error: None,
                cur_result: Weak::new(),
                sync_result: None,
                ioloop: None,
                orig_ioloop: None,
                next_callback: None,
                io: None,
                io_dir: None,
                to_connect: None,
                last_connect_try: None,
                no_reconnect: false,
                state_change_cb: None,
                connect_timeout_secs: SQL_CONNECT_TIMEOUT_SECS,
                query_timeout_secs: SQL_QUERY_TIMEOUT_SECS,
                client_factory: factory,
            })),
        }
    }

    /// Disconnect and release the instance.
    pub fn deinit(self) {
        self.disconnect();
    }

    /// Current FSM state.
    pub fn state(&self) -> DbState {
        self.inner.borrow().state
    }

    /// Host parsed from the connect string, if any.
    pub fn host(&self) -> Option<String> {
        self.inner.borrow().host.clone()
    }

    /// Install a listener for state changes.
    pub fn set_state_change_callback(&self, callback: impl Fn(DbState) + 'static) {
        self.inner.borrow_mut().state_change_cb = Some(Rc::new(callback));
    }

    /// Override the connect timeout (mainly for tests).
    pub fn set_connect_timeout_secs(&self, secs: u64) {
        self.inner.borrow_mut().connect_timeout_secs = secs;
    }

    /// Override the per-query timeout (mainly for tests).
    pub fn set_query_timeout_secs(&self, secs: u64) {
        self.inner.borrow_mut().query_timeout_secs = secs;
    }

    /// Begin an asynchronous connect. Returns -1 when the vendor handle
    /// immediately reports a bad status, 0 otherwise.
    pub fn connect(&self) -> i32 {
        let db = &self.inner;
        assert_eq!(db.borrow().state, DbState::Disconnected);

        let factory = db.borrow().client_factory.clone();
        let connect_string = db.borrow().connect_string.clone();

        // The connect starter blocks on name resolution; don't count that
        // time against the connect timeout.
        let start = Instant::now();
        let mut client = factory(&connect_string);
        let elapsed = start.elapsed();

        if client.status() == ConnStatus::Bad {
            let pfx = prefix(&db.borrow());
            error!(
                "{}: Connect failed to database {}: {}",
                pfx,
                client.db_name(),
                last_error(client.as_ref())
            );
            db.borrow_mut().client = Some(client);
            close(db);
            return -1;
        }
        if elapsed > DNS_WARN {
            let pfx = prefix(&db.borrow());
            let ms = elapsed.as_millis();
            warn!("{}: DNS lookup took {}.{:03} s", pfx, ms / 1000, ms % 1000);
        }

        if client.set_nonblocking().is_err() {
            let pfx = prefix(&db.borrow());
            error!("{}: setting socket non-blocking failed", pfx);
        }
        let fd = client.socket_fd();

        {
            let mut inner = db.borrow_mut();
            debug_assert!(inner.to_connect.is_none());
            inner.client = Some(client);
            inner.last_connect_try = Some(Instant::now());
            inner.connect_state = "connecting";
        }

        let timeout = Duration::from_secs(db.borrow().connect_timeout_secs);
        let db2 = db.clone();
        let timer = EventLoop::current().add_timer(timeout, Box::new(move || connect_timeout(&db2)));
        let db3 = db.clone();
        let watch =
            EventLoop::current().watch_io(fd, IoDir::Write, Box::new(move || connect_callback(&db3)));
        {
            let mut inner = db.borrow_mut();
            inner.to_connect = Some(timer);
            inner.io = Some(watch);
            inner.io_dir = Some(IoDir::Write);
        }
        set_state(db, DbState::Connecting);
        0
    }

    /// Disconnect. Idempotent; an in-flight result is finished first so its
    /// callback is not lost. Reconnect logic in the upper layer is
    /// suppressed while the close runs.
    pub fn disconnect(&self) {
        let db = &self.inner;

        let inflight = {
            let inner = db.borrow();
            inner
                .cur_result
                .upgrade()
                .map(SqlResult::from_inner)
                .filter(|r| r.inner.borrow().timer.is_some())
        };
        if let Some(result) = inflight {
            stop_io(db);
            result_finish(db, &result);
        }

        db.borrow_mut().no_reconnect = true;
        close(db);
        db.borrow_mut().no_reconnect = false;
    }

    /// True while a disconnect is forcing the connection down; the upper
    /// layer must not schedule a reconnect.
    pub fn no_reconnect(&self) -> bool {
        self.inner.borrow().no_reconnect
    }

    /// Escape a string. Uses the connection-aware escape when a connection
    /// is available, triggering an implicit connect when disconnected;
    /// falls back to the legacy escape otherwise.
    pub fn escape_string(&self, s: &str) -> String {
        let state = self.inner.borrow().state;
        if state == DbState::Disconnected {
            // try connecting again
            let _ = self.connect();
        }
        let inner = self.inner.borrow();
        if inner.state != DbState::Disconnected {
            if let Some(client) = inner.client.as_ref() {
                return client.escape_string_conn(s);
            }
        }
        escape::escape_string(s)
    }

    /// Hex-encode binary data as a PostgreSQL escape-string literal.
    pub fn escape_blob(&self, data: &[u8]) -> String {
        escape::escape_blob(data)
    }

    /// Fire-and-forget query; failures are only logged.
    pub fn exec(&self, query: &str) {
        let db = self.inner.clone();
        let result = SqlResult::new(
            Rc::downgrade(&self.inner),
            Box::new(move |result: &SqlResult| {
                if result.is_failed() {
                    let err = result.error();
                    let pfx = prefix(&db.borrow());
                    error!("{}: sql_exec() failed: {}", pfx, err);
                }
            }),
        );
        do_query(&self.inner, result, query);
    }

    /// Dispatch a query. The callback is invoked exactly once, with a
    /// possibly-failed result. The connection must be idle.
    pub fn query(&self, query: &str, callback: impl FnOnce(&SqlResult) + 'static) {
        let result = SqlResult::new(Rc::downgrade(&self.inner), Box::new(callback));
        do_query(&self.inner, result, query);
    }

    /// Blocking query: spins a private event loop until the result is in.
    /// Returns the shared "not connected" sentinel when disconnected.
    pub fn query_s(&self, query: &str) -> SqlResult {
        sync_init(&self.inner);
        let result = sync_query(&self.inner, query);
        sync_deinit(&self.inner);
        result
    }
}

/// Registry record for the generic layer.
pub static DRIVER_PGSQL: SqlDriverDef = SqlDriverDef {
    name: "pgsql",
    pooled: true,
    init: PgsqlDb::init,
};

/// Register the driver under the name `"pgsql"`.
pub fn driver_pgsql_init() {
    api::sql_driver_register(&DRIVER_PGSQL);
}

/// Remove the driver from the registry.
pub fn driver_pgsql_deinit() {
    api::sql_driver_unregister("pgsql");
}
