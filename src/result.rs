//! The shared result object handed to query callbacks.
//!
//! A result is reference counted: the driver holds strong handles while the
//! query is in flight, the caller may keep its own clones. Dropping the last
//! handle tells the connection to drain any remaining server responses
//! before the next query is accepted.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::api::{DbState, QueryCallback};
use crate::driver::{self, DbInner};
use crate::event::Timer;
use crate::pq::{escape, PgServerResult, ResultStatus};

pub(crate) struct ResultInner {
    /// Back-reference to the owning connection. The connection outlives
    /// every result it produces; a dead weak means the driver is gone.
    pub(crate) db: Weak<RefCell<DbInner>>,
    pub(crate) pgres: Option<Box<dyn PgServerResult>>,
    pub(crate) rownum: usize,
    pub(crate) rows: usize,
    fields: Option<Vec<String>>,
    binary_values: Vec<Option<Vec<u8>>>,
    pub(crate) timeout: bool,
    pub(crate) failed: bool,
    pub(crate) try_retry: bool,
    pub(crate) callback: Option<QueryCallback>,
    pub(crate) callback_running: bool,
    pub(crate) timer: Option<Timer>,
    sentinel: bool,
}

/// Handle to a query result. Cloning shares the same underlying result.
pub struct SqlResult {
    pub(crate) inner: Rc<RefCell<ResultInner>>,
}

impl Clone for SqlResult {
    fn clone(&self) -> Self {
        SqlResult {
            inner: self.inner.clone(),
        }
    }
}

impl SqlResult {
    pub(crate) fn new(db: Weak<RefCell<DbInner>>, callback: QueryCallback) -> SqlResult {
        SqlResult {
            inner: Rc::new(RefCell::new(ResultInner {
                db,
                pgres: None,
                rownum: 0,
                rows: 0,
                fields: None,
                binary_values: Vec::new(),
                timeout: false,
                failed: false,
                try_retry: false,
                callback: Some(callback),
                callback_running: false,
                timer: None,
                sentinel: false,
            })),
        }
    }

    fn new_sentinel() -> SqlResult {
        SqlResult {
            inner: Rc::new(RefCell::new(ResultInner {
                db: Weak::new(),
                pgres: None,
                rownum: 0,
                rows: 0,
                fields: None,
                binary_values: Vec::new(),
                timeout: false,
                failed: true,
                try_retry: false,
                callback: None,
                callback_running: false,
                timer: None,
                sentinel: true,
            })),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<RefCell<ResultInner>> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn from_inner(inner: Rc<RefCell<ResultInner>>) -> SqlResult {
        SqlResult { inner }
    }

    /// True when both handles refer to the same underlying result.
    pub fn ptr_eq(&self, other: &SqlResult) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// True when the query failed (error, timeout or lost connection).
    pub fn is_failed(&self) -> bool {
        self.inner.borrow().failed
    }

    /// Advisory: retrying the same query on a fresh connection is likely
    /// to succeed.
    pub fn try_retry(&self) -> bool {
        self.inner.borrow().try_retry
    }

    /// True when the query was aborted by the per-query timeout.
    pub fn timed_out(&self) -> bool {
        self.inner.borrow().timeout
    }

    /// Advance the row cursor.
    ///
    /// Returns 1 when a row is available, 0 at the end of the result and
    /// -1 on failure. Iterating past the last row of a packet fetches the
    /// next packet from the server, which may block; the protocol offers
    /// no nonblocking way to continue at that point.
    pub fn next_row(&self) -> i32 {
        let mut borrow = self.inner.borrow_mut();
        let inner = &mut *borrow;

        if inner.rows != 0 {
            inner.rownum += 1;
            if inner.rownum < inner.rows {
                return 1;
            }

            let next = match inner.db.upgrade() {
                Some(db) => db
                    .borrow_mut()
                    .client
                    .as_mut()
                    .and_then(|client| client.get_result()),
                None => None,
            };
            inner.pgres = next;
            inner.rownum = 0;
            inner.rows = 0;
            inner.fields = None;
            inner.binary_values.clear();
            if inner.pgres.is_none() {
                return 0;
            }
        }

        let Some(pgres) = inner.pgres.as_ref() else {
            inner.failed = true;
            return -1;
        };
        match pgres.status() {
            ResultStatus::CommandOk => 0,
            ResultStatus::TuplesOk => {
                inner.rows = pgres.ntuples();
                if inner.rows > 0 {
                    1
                } else {
                    0
                }
            }
            ResultStatus::EmptyQuery | ResultStatus::NonfatalError => {
                inner.failed = true;
                -1
            }
            _ => {
                // Treat as fatal; the connection closes on return to idle.
                inner.failed = true;
                if let Some(db) = inner.db.upgrade() {
                    db.borrow_mut().fatal_error = true;
                }
                -1
            }
        }
    }

    fn fetch_fields(inner: &mut ResultInner) {
        if inner.fields.is_some() {
            return;
        }
        let fields = match inner.pgres.as_ref() {
            Some(pgres) => (0..pgres.nfields())
                .map(|i| pgres.field_name(i).to_string())
                .collect(),
            None => Vec::new(),
        };
        inner.fields = Some(fields);
    }

    /// Number of fields per row.
    pub fn fields_count(&self) -> usize {
        let mut borrow = self.inner.borrow_mut();
        let inner = &mut *borrow;
        Self::fetch_fields(inner);
        inner.fields.as_ref().map(Vec::len).unwrap_or(0)
    }

    /// Name of field `idx`. Panics when out of range.
    pub fn field_name(&self, idx: usize) -> String {
        let mut borrow = self.inner.borrow_mut();
        let inner = &mut *borrow;
        Self::fetch_fields(inner);
        inner.fields.as_ref().expect("fields just fetched")[idx].clone()
    }

    /// Index of the named field, if present.
    pub fn find_field(&self, name: &str) -> Option<usize> {
        let mut borrow = self.inner.borrow_mut();
        let inner = &mut *borrow;
        Self::fetch_fields(inner);
        inner
            .fields
            .as_ref()
            .expect("fields just fetched")
            .iter()
            .position(|f| f == name)
    }

    /// Text value of field `idx` in the current row; `None` for SQL NULL.
    pub fn field_value(&self, idx: usize) -> Option<String> {
        let borrow = self.inner.borrow();
        let pgres = borrow.pgres.as_ref()?;
        pgres.value(borrow.rownum, idx).map(str::to_string)
    }

    /// Value of the named field in the current row.
    pub fn find_field_value(&self, name: &str) -> Option<String> {
        let idx = self.find_field(name)?;
        self.field_value(idx)
    }

    /// Binary value of field `idx`: the bytea representation unescaped.
    /// The decoded bytes are cached on the result and freed with it.
    pub fn field_value_binary(&self, idx: usize) -> Option<Vec<u8>> {
        let mut borrow = self.inner.borrow_mut();
        let inner = &mut *borrow;

        if inner.binary_values.len() <= idx {
            inner.binary_values.resize(idx + 1, None);
        }
        if let Some(cached) = &inner.binary_values[idx] {
            return Some(cached.clone());
        }

        let pgres = inner.pgres.as_ref()?;
        let value = pgres.value(inner.rownum, idx)?;
        let decoded = escape::unescape_bytea(value.as_bytes()).ok()?;
        inner.binary_values[idx] = Some(decoded.clone());
        Some(decoded)
    }

    /// All values of the current row, one per field.
    pub fn values(&self) -> Vec<Option<String>> {
        let mut borrow = self.inner.borrow_mut();
        let inner = &mut *borrow;
        Self::fetch_fields(inner);

        let count = inner.fields.as_ref().map(Vec::len).unwrap_or(0);
        let mut values = Vec::with_capacity(count);
        for idx in 0..count {
            values.push(
                inner
                    .pgres
                    .as_ref()
                    .and_then(|pgres| pgres.value(inner.rownum, idx))
                    .map(str::to_string),
            );
        }
        values
    }

    /// Error text for a failed result.
    ///
    /// Composed from, in order: the timeout text, the connection's last
    /// error when no server result is attached, or the server result's own
    /// message with a trailing newline stripped. The text is also cached on
    /// the connection.
    pub fn error(&self) -> String {
        let borrow = self.inner.borrow();
        let msg = if borrow.timeout {
            "Query timed out".to_string()
        } else if borrow.pgres.is_none() {
            match borrow.db.upgrade() {
                Some(db) => {
                    let dbi = db.borrow();
                    match dbi.client.as_ref() {
                        Some(client) => strip_trailing_newline(client.error_message()),
                        None => dbi
                            .error
                            .clone()
                            .unwrap_or_else(|| "(no error set)".to_string()),
                    }
                }
                None => "Not connected".to_string(),
            }
        } else {
            let raw = borrow
                .pgres
                .as_ref()
                .map(|pgres| pgres.error_message().to_string())
                .unwrap_or_default();
            strip_trailing_newline(raw)
        };

        if let Some(db) = borrow.db.upgrade() {
            db.borrow_mut().error = Some(msg.clone());
        }
        msg
    }

    /// Affected-row digits from the server's command tag.
    pub(crate) fn cmd_tuples(&self) -> Option<String> {
        let borrow = self.inner.borrow();
        borrow
            .pgres
            .as_ref()
            .map(|pgres| pgres.cmd_tuples().to_string())
    }
}

fn strip_trailing_newline(mut s: String) -> String {
    if s.ends_with('\n') {
        s.pop();
    }
    s
}

impl Drop for ResultInner {
    fn drop(&mut self) {
        debug_assert!(!self.callback_running);
        if self.sentinel {
            return;
        }
        let Some(db) = self.db.upgrade() else {
            return;
        };
        // A disconnect may have moved the connection on already; only the
        // in-flight result of a busy connection triggers the drain.
        if db.borrow().state != DbState::Busy {
            return;
        }
        let success = self.pgres.is_some() && !db.borrow().fatal_error;
        self.pgres = None;
        db.borrow_mut().cur_result = Weak::new();
        if success {
            // Read the rest of the server's responses before going idle.
            driver::consume_results(&db);
        } else {
            driver::set_idle(&db);
        }
    }
}

thread_local! {
    static NOT_CONNECTED: SqlResult = SqlResult::new_sentinel();
}

/// The shared "not connected" sentinel result. Handing it out bumps the
/// reference count of a singleton instead of allocating.
pub fn not_connected_result() -> SqlResult {
    NOT_CONNECTED.with(|r| r.clone())
}
