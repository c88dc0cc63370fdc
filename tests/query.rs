//! Async query pipeline scenarios against the scripted vendor.

mod common;

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use pgsql_driver::{DbState, EventLoop, FlushStatus, PgsqlDb, SqlResult};

use common::{capture_logs, connect_ready, new_mock, MockResult};

fn setup(ev: &Rc<EventLoop>) -> (Rc<RefCell<common::MockState>>, PgsqlDb) {
    let (state, factory) = new_mock();
    let db = PgsqlDb::init_with_client_factory("host=localhost dbname=mails", factory);
    connect_ready(ev, &db);
    (state, db)
}

#[test]
fn query_delivers_result_after_flush_drain() {
    let ev = EventLoop::new();
    EventLoop::set_current(&ev);
    let (state, db) = setup(&ev);
    {
        let mut st = state.borrow_mut();
        st.flushes = [
            FlushStatus::Pending,
            FlushStatus::Pending,
            FlushStatus::Done,
        ]
        .into();
        st.busy = [true, false].into();
        st.results
            .push_back(vec![MockResult::tuples(&["?column?"], &[&[Some("1")]])]);
    }

    let calls = Rc::new(Cell::new(0));
    let held: Rc<RefCell<Option<SqlResult>>> = Rc::new(RefCell::new(None));
    let calls2 = calls.clone();
    let held2 = held.clone();
    let ev2 = ev.clone();
    db.query("SELECT 1", move |result| {
        calls2.set(calls2.get() + 1);
        *held2.borrow_mut() = Some(result.clone());
        ev2.stop();
    });
    ev.run();

    assert_eq!(calls.get(), 1);
    let result = held.borrow_mut().take().expect("result delivered");
    assert!(!result.is_failed());
    assert_eq!(result.next_row(), 1);
    assert_eq!(result.fields_count(), 1);
    assert_eq!(result.field_name(0), "?column?");
    assert_eq!(result.field_value(0).as_deref(), Some("1"));
    assert_eq!(result.next_row(), 0);

    // The mock saw the whole phase sequence in order.
    let calls_seen = state.borrow().calls.clone();
    let start = calls_seen
        .iter()
        .position(|c| c == "send_query")
        .expect("query sent");
    let phases: Vec<&str> = calls_seen[start..start + 8]
        .iter()
        .map(String::as_str)
        .collect();
    assert_eq!(
        phases,
        vec![
            "send_query",
            "flush:Pending",
            "flush:Pending",
            "flush:Done",
            "consume_input",
            "is_busy:true",
            "consume_input",
            "is_busy:false",
        ]
    );

    drop(result);
    assert_eq!(db.state(), DbState::Idle);
    assert_eq!(state.borrow().max_in_flight, 1);
}

#[test]
fn zero_row_select_ends_immediately() {
    let ev = EventLoop::new();
    EventLoop::set_current(&ev);
    let (state, db) = setup(&ev);
    state
        .borrow_mut()
        .results
        .push_back(vec![MockResult::tuples(&["userid"], &[])]);

    let rows = Rc::new(Cell::new(-2));
    let rows2 = rows.clone();
    db.query("SELECT userid FROM users WHERE false", move |result| {
        rows2.set(result.next_row());
    });

    assert_eq!(rows.get(), 0);
}

#[test]
fn null_field_value_is_absent() {
    let ev = EventLoop::new();
    EventLoop::set_current(&ev);
    let (state, db) = setup(&ev);
    state.borrow_mut().results.push_back(vec![MockResult::tuples(
        &["userid", "quota"],
        &[&[Some("alice"), None]],
    )]);

    let seen = Rc::new(RefCell::new(None));
    let seen2 = seen.clone();
    db.query("SELECT userid, quota FROM users", move |result| {
        assert_eq!(result.next_row(), 1);
        let values = result.values();
        *seen2.borrow_mut() = Some((result.field_value(1), values));
    });

    let (value, values) = seen.borrow_mut().take().expect("callback ran");
    assert_eq!(value, None);
    assert_eq!(
        values,
        vec![Some("alice".to_string()), None]
    );
}

#[test]
fn query_timeout_during_flush() {
    let ev = EventLoop::new();
    EventLoop::set_current(&ev);
    let (state, db) = setup(&ev);
    {
        let mut st = state.borrow_mut();
        st.flushes = [FlushStatus::Pending].into();
        st.flush_default = FlushStatus::Pending;
        st.silent_writes = true;
    }
    db.set_query_timeout_secs(1);

    let outcome = Rc::new(RefCell::new(None));
    let outcome2 = outcome.clone();
    let ev2 = ev.clone();
    let start = Instant::now();
    db.query("INSERT INTO log VALUES (1)", move |result| {
        *outcome2.borrow_mut() = Some((result.is_failed(), result.timed_out(), result.error()));
        ev2.stop();
    });
    let (_, logs) = capture_logs(|| ev.run());

    let (failed, timed_out, error) = outcome.borrow_mut().take().expect("callback ran");
    assert!(failed);
    assert!(timed_out);
    assert_eq!(error, "Query timed out");
    assert!(start.elapsed().as_millis() >= 900);
    assert!(
        logs.contains("pgsql(localhost): Query timed out, aborting"),
        "logs: {}",
        logs
    );
}

#[test]
fn lost_connection_mid_query_sets_try_retry() {
    let ev = EventLoop::new();
    EventLoop::set_current(&ev);
    let (state, db) = setup(&ev);
    // The fetch phase's consume_input hits the injected EOF.
    state.borrow_mut().consume_fail_at = Some(1);

    let outcome = Rc::new(RefCell::new(None));
    let outcome2 = outcome.clone();
    db.query("SELECT 1", move |result| {
        *outcome2.borrow_mut() = Some((result.is_failed(), result.try_retry()));
    });

    let (failed, try_retry) = outcome.borrow_mut().take().expect("callback ran");
    assert!(failed);
    assert!(try_retry);
    // The fatal error forces the connection closed on return to idle.
    assert_eq!(db.state(), DbState::Disconnected);
}

#[test]
fn send_failure_fails_the_result() {
    let ev = EventLoop::new();
    EventLoop::set_current(&ev);
    let (state, db) = setup(&ev);
    state.borrow_mut().fail_send = true;

    let outcome = Rc::new(RefCell::new(None));
    let outcome2 = outcome.clone();
    db.query("SELECT 1", move |result| {
        *outcome2.borrow_mut() = Some((result.is_failed(), result.error()));
    });

    let (failed, error) = outcome.borrow_mut().take().expect("callback ran");
    assert!(failed);
    assert_eq!(error, "could not send query");
    assert_eq!(db.state(), DbState::Disconnected);
}

#[test]
fn exec_is_fire_and_forget() {
    let ev = EventLoop::new();
    EventLoop::set_current(&ev);
    let (state, db) = setup(&ev);
    state
        .borrow_mut()
        .results
        .push_back(vec![MockResult::command_ok("1")]);

    db.exec("INSERT INTO log VALUES (1)");

    assert_eq!(state.borrow().queries, vec!["INSERT INTO log VALUES (1)"]);
    assert_eq!(db.state(), DbState::Idle);
}

#[test]
fn field_cache_is_order_independent() {
    let ev = EventLoop::new();
    EventLoop::set_current(&ev);
    let (state, db) = setup(&ev);
    for _ in 0..2 {
        state.borrow_mut().results.push_back(vec![MockResult::tuples(
            &["userid", "domain"],
            &[&[Some("alice"), Some("example.org")]],
        )]);
    }

    let answers = Rc::new(RefCell::new(Vec::new()));

    let a2 = answers.clone();
    db.query("SELECT userid, domain FROM users", move |result| {
        assert_eq!(result.next_row(), 1);
        a2.borrow_mut().push((
            result.fields_count(),
            result.field_name(1),
            result.find_field("domain"),
        ));
    });
    let a3 = answers.clone();
    db.query("SELECT userid, domain FROM users", move |result| {
        assert_eq!(result.next_row(), 1);
        let found = result.find_field("domain");
        let name = result.field_name(1);
        let count = result.fields_count();
        a3.borrow_mut().push((count, name, found));
    });

    let answers = answers.borrow();
    assert_eq!(answers.len(), 2);
    assert_eq!(answers[0], answers[1]);
    assert_eq!(answers[0], (2, "domain".to_string(), Some(1)));
}

#[test]
fn callback_fires_exactly_once_per_query() {
    let ev = EventLoop::new();
    EventLoop::set_current(&ev);
    let (state, db) = setup(&ev);
    for _ in 0..3 {
        state
            .borrow_mut()
            .results
            .push_back(vec![MockResult::command_ok("1")]);
    }

    let fired = Rc::new(Cell::new(0));
    for _ in 0..3 {
        let fired2 = fired.clone();
        db.query("INSERT INTO log VALUES (1)", move |_result| {
            fired2.set(fired2.get() + 1);
        });
    }

    assert_eq!(fired.get(), 3);
    assert_eq!(state.borrow().max_in_flight, 1);
}
