//! Multi-statement transaction coordinator.
//!
//! Statements are buffered in memory until commit time. A single-statement
//! transaction is sent as-is; anything larger is serialized as `BEGIN`, the
//! statements in FIFO order, then `COMMIT`, chained through the
//! connection's deferred continuation so each statement is dispatched the
//! moment the pipeline would otherwise go idle.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::info;

use crate::api::{CommitCallback, CommitResult, DbState};
use crate::driver::{self, PgsqlDb};
use crate::result::SqlResult;

struct TxQuery {
    query: String,
    affected_rows: Option<Rc<Cell<u64>>>,
}

struct TxInner {
    db: PgsqlDb,
    queries: Vec<TxQuery>,
    /// Next statement to dispatch on the async commit path.
    send_idx: usize,
    failed: bool,
    error: Option<String>,
    callback: Option<CommitCallback>,
    commit_started: bool,
}

/// An open transaction. Consumed by commit or rollback.
pub struct SqlTransaction {
    inner: Rc<RefCell<TxInner>>,
}

impl PgsqlDb {
    /// Open a transaction. Statements are buffered until commit.
    pub fn transaction_begin(&self) -> SqlTransaction {
        SqlTransaction {
            inner: Rc::new(RefCell::new(TxInner {
                db: self.clone(),
                queries: Vec::new(),
                send_idx: 0,
                failed: false,
                error: None,
                callback: None,
                commit_started: false,
            })),
        }
    }
}

impl SqlTransaction {
    /// Append a statement. `affected_rows`, when given, receives the
    /// statement's affected-row count after a successful commit.
    pub fn update(&self, query: &str, affected_rows: Option<Rc<Cell<u64>>>) {
        let mut inner = self.inner.borrow_mut();
        assert!(!inner.commit_started, "pgsql: update after commit");
        inner.queries.push(TxQuery {
            query: query.to_string(),
            affected_rows,
        });
    }

    /// Commit asynchronously. The callback is invoked exactly once.
    pub fn commit(self, callback: impl FnOnce(&CommitResult) + 'static) {
        let tx = self.inner;
        {
            let mut inner = tx.borrow_mut();
            inner.commit_started = true;
            inner.callback = Some(Box::new(callback));
        }

        let (failed, len) = {
            let inner = tx.borrow();
            (inner.failed, inner.queries.len())
        };
        if failed || len == 0 {
            let error = if failed {
                tx.borrow_mut().error.take()
            } else {
                None
            };
            invoke_commit_callback(&tx, CommitResult { error });
        } else if len == 1 {
            let db = tx.borrow().db.clone();
            let query = tx.borrow().queries[0].query.clone();
            let tx2 = tx.clone();
            db.query(&query, move |result| single_query_callback(&tx2, result));
        } else {
            let db = tx.borrow().db.clone();
            let tx2 = tx.clone();
            db.query("BEGIN", move |result| begin_callback(&tx2, result));
        }
    }

    /// Commit synchronously. On a connection that dropped during the
    /// attempt, reconnects and retries exactly once.
    pub fn commit_s(self) -> Result<(), String> {
        let tx = self.inner;
        tx.borrow_mut().commit_started = true;

        let mut error: Option<String> = None;
        if !tx.borrow().queries.is_empty() {
            try_commit_s(&tx, &mut error);

            let db = tx.borrow().db.clone();
            if db.state() == DbState::Disconnected {
                let pfx = driver::prefix(&db.inner.borrow());
                info!("{}: Disconnected from database, retrying commit", pfx);
                if db.connect() >= 0 {
                    {
                        let mut inner = tx.borrow_mut();
                        inner.failed = false;
                        inner.error = None;
                    }
                    error = None;
                    try_commit_s(&tx, &mut error);
                }
            }
        }

        match error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    /// Discard the transaction. No statements have been sent, so nothing
    /// goes over the wire.
    pub fn rollback(self) {}
}

fn invoke_commit_callback(tx: &Rc<RefCell<TxInner>>, commit_result: CommitResult) {
    let callback = tx.borrow_mut().callback.take();
    if let Some(callback) = callback {
        callback(&commit_result);
    }
}

fn commit_error(tx: &Rc<RefCell<TxInner>>, error: String) {
    invoke_commit_callback(
        tx,
        CommitResult {
            error: Some(error),
        },
    );
}

fn store_affected(query: &TxQuery, result: &SqlResult) {
    let Some(slot) = &query.affected_rows else {
        return;
    };
    let tuples = result.cmd_tuples().unwrap_or_default();
    match tuples.parse::<u64>() {
        Ok(n) => slot.set(n),
        // No valid server response yields non-numeric text here.
        Err(_) => unreachable!("pgsql: non-numeric affected-rows tag"),
    }
}

fn single_query_callback(tx: &Rc<RefCell<TxInner>>, result: &SqlResult) {
    if result.next_row() < 0 {
        commit_error(tx, result.error());
        return;
    }
    store_affected(&tx.borrow().queries[0], result);
    invoke_commit_callback(tx, CommitResult { error: None });
}

fn begin_callback(tx: &Rc<RefCell<TxInner>>, result: &SqlResult) {
    if result.next_row() < 0 {
        commit_error(tx, result.error());
        return;
    }
    install_send_next(tx);
}

fn statement_callback(tx: &Rc<RefCell<TxInner>>, idx: usize, result: &SqlResult) {
    if result.next_row() < 0 {
        let query = tx.borrow().queries[idx].query.clone();
        let error = format!("{} (query: {})", result.error(), query);
        tx.borrow_mut().failed = true;
        // Release the server-side transaction if the connection survived;
        // a closed connection aborts it anyway.
        abort_transaction(tx);
        commit_error(tx, error);
        return;
    }
    store_affected(&tx.borrow().queries[idx], result);
    install_send_next(tx);
}

fn commit_query_callback(tx: &Rc<RefCell<TxInner>>, result: &SqlResult) {
    let error = if result.next_row() < 0 {
        Some(result.error())
    } else {
        None
    };
    invoke_commit_callback(tx, CommitResult { error });
}

fn install_send_next(tx: &Rc<RefCell<TxInner>>) {
    let db = tx.borrow().db.clone();
    let tx2 = tx.clone();
    let mut inner = db.inner.borrow_mut();
    assert!(
        inner.next_callback.is_none(),
        "pgsql: deferred continuation already occupied"
    );
    inner.next_callback = Some(Box::new(move || send_next(&tx2)));
}

fn send_next(tx: &Rc<RefCell<TxInner>>) -> bool {
    debug_assert!(!tx.borrow().failed);
    let db = tx.borrow().db.clone();

    let not_ready = {
        let mut inner = db.inner.borrow_mut();
        if inner.state == DbState::Busy {
            // The FSM has not dropped back to idle yet; step it by hand
            // before re-dispatching.
            inner.state = DbState::Idle;
            false
        } else {
            !inner.state.is_ready()
        }
    };
    if not_ready {
        commit_error(tx, "Not connected".to_string());
        return false;
    }

    let next = {
        let mut inner = tx.borrow_mut();
        if inner.send_idx < inner.queries.len() {
            let idx = inner.send_idx;
            inner.send_idx += 1;
            Some((inner.queries[idx].query.clone(), idx))
        } else {
            None
        }
    };
    match next {
        Some((query, idx)) => {
            let tx2 = tx.clone();
            db.query(&query, move |result| statement_callback(&tx2, idx, result));
        }
        None => {
            let tx2 = tx.clone();
            db.query("COMMIT", move |result| commit_query_callback(&tx2, result));
        }
    }
    true
}

fn abort_transaction(tx: &Rc<RefCell<TxInner>>) {
    let db = tx.borrow().db.clone();
    let mut inner = db.inner.borrow_mut();
    if inner.next_callback.is_some() {
        return;
    }
    let db2 = db.clone();
    inner.next_callback = Some(Box::new(move || {
        let ready = {
            let mut inner = db2.inner.borrow_mut();
            if inner.state == DbState::Busy {
                inner.state = DbState::Idle;
            }
            inner.state == DbState::Idle
        };
        if !ready {
            return false;
        }
        db2.exec("ROLLBACK");
        true
    }));
}

fn fail_multi(tx: &Rc<RefCell<TxInner>>, result: &SqlResult, query: &str) {
    let error = format!("{} (query: {})", result.error(), query);
    let mut inner = tx.borrow_mut();
    inner.failed = true;
    inner.error = Some(error);
}

fn commit_multi(tx: &Rc<RefCell<TxInner>>, db: &PgsqlDb) -> Option<SqlResult> {
    let result = driver::sync_query(&db.inner, "BEGIN");
    if result.next_row() < 0 {
        fail_multi(tx, &result, "BEGIN");
        return None;
    }
    drop(result);

    let count = tx.borrow().queries.len();
    for idx in 0..count {
        let query = tx.borrow().queries[idx].query.clone();
        let result = driver::sync_query(&db.inner, &query);
        if result.next_row() < 0 {
            fail_multi(tx, &result, &query);
            break;
        }
        store_affected(&tx.borrow().queries[idx], &result);
    }

    let failed = tx.borrow().failed;
    Some(driver::sync_query(
        &db.inner,
        if failed { "ROLLBACK" } else { "COMMIT" },
    ))
}

fn try_commit_s(tx: &Rc<RefCell<TxInner>>, error: &mut Option<String>) {
    let db = tx.borrow().db.clone();
    let single = tx.borrow().queries.len() == 1;

    let result = if single {
        let query = tx.borrow().queries[0].query.clone();
        Some(db.query_s(&query))
    } else {
        driver::sync_init(&db.inner);
        let result = commit_multi(tx, &db);
        driver::sync_deinit(&db.inner);
        result
    };

    if tx.borrow().failed {
        *error = tx.borrow().error.clone();
        debug_assert!(error.is_some());
    } else if let Some(result) = &result {
        if result.next_row() < 0 {
            *error = Some(result.error());
        } else if single {
            store_affected(&tx.borrow().queries[0], result);
        }
    }
}
