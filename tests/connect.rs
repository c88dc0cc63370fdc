//! Connect FSM end-to-end scenarios against the scripted vendor.

mod common;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use pgsql_driver::{DbState, EventLoop, PgsqlDb, PollingStatus};

use common::{capture_logs, connect_ready, new_mock};

#[test]
fn connect_polls_through_both_directions() {
    let ev = EventLoop::new();
    EventLoop::set_current(&ev);

    let (state, factory) = new_mock();
    state.borrow_mut().connect_polls = [
        PollingStatus::Writing,
        PollingStatus::Reading,
        PollingStatus::Ok,
    ]
    .into();

    let db = PgsqlDb::init_with_client_factory("host=localhost dbname=mails", factory);
    assert_eq!(db.host().as_deref(), Some("localhost"));
    assert_eq!(db.state(), DbState::Disconnected);

    let states = Rc::new(RefCell::new(Vec::new()));
    let states2 = states.clone();
    let ev2 = ev.clone();
    db.set_state_change_callback(move |s| {
        states2.borrow_mut().push(s);
        if s == DbState::Idle || s == DbState::Disconnected {
            ev2.stop();
        }
    });

    assert_eq!(db.connect(), 0);
    assert_eq!(db.state(), DbState::Connecting);
    ev.run();

    assert_eq!(db.state(), DbState::Idle);
    assert_eq!(&*states.borrow(), &[DbState::Connecting, DbState::Idle]);
    let polls: Vec<String> = state
        .borrow()
        .calls
        .iter()
        .filter(|c| c.starts_with("connect_poll"))
        .cloned()
        .collect();
    assert_eq!(
        polls,
        vec![
            "connect_poll:Writing",
            "connect_poll:Reading",
            "connect_poll:Ok"
        ]
    );
}

#[test]
fn connect_fails_when_handle_starts_bad() {
    let ev = EventLoop::new();
    EventLoop::set_current(&ev);

    let (state, factory) = new_mock();
    state.borrow_mut().start_bad = true;

    let db = PgsqlDb::init_with_client_factory("host=h dbname=x", factory);
    let (ret, logs) = capture_logs(|| db.connect());
    assert_eq!(ret, -1);
    assert_eq!(db.state(), DbState::Disconnected);
    assert!(
        logs.contains("pgsql(h): Connect failed to database mails:"),
        "logs: {}",
        logs
    );
}

#[test]
fn connect_poll_failure_disconnects() {
    let ev = EventLoop::new();
    EventLoop::set_current(&ev);

    let (state, factory) = new_mock();
    state.borrow_mut().connect_polls = [PollingStatus::Writing, PollingStatus::Failed].into();

    let db = PgsqlDb::init_with_client_factory("host=h dbname=x", factory);
    let ev2 = ev.clone();
    db.set_state_change_callback(move |s| {
        if s == DbState::Disconnected {
            ev2.stop();
        }
    });
    assert_eq!(db.connect(), 0);
    ev.run();

    assert_eq!(db.state(), DbState::Disconnected);
}

#[test]
fn connect_timeout_fires() {
    let ev = EventLoop::new();
    EventLoop::set_current(&ev);

    let (state, factory) = new_mock();
    {
        let mut st = state.borrow_mut();
        // First poll asks for input that never arrives.
        st.connect_polls = [PollingStatus::Reading].into();
        st.readable = false;
    }

    let db = PgsqlDb::init_with_client_factory("host=h dbname=x", factory);
    db.set_connect_timeout_secs(1);
    let ev2 = ev.clone();
    db.set_state_change_callback(move |s| {
        if s == DbState::Disconnected {
            ev2.stop();
        }
    });

    let start = Instant::now();
    assert_eq!(db.connect(), 0);
    let (_, logs) = capture_logs(|| ev.run());

    assert_eq!(db.state(), DbState::Disconnected);
    assert!(start.elapsed().as_millis() >= 900);
    assert!(
        logs.contains("pgsql(h): Connect failed: Timeout after"),
        "logs: {}",
        logs
    );
    assert!(logs.contains("(state: wait for input)"), "logs: {}", logs);
}

#[test]
fn disconnect_is_idempotent() {
    let ev = EventLoop::new();
    EventLoop::set_current(&ev);

    let (_state, factory) = new_mock();
    let db = PgsqlDb::init_with_client_factory("host=h dbname=x", factory);
    connect_ready(&ev, &db);

    let disconnects = Rc::new(RefCell::new(0));
    let d2 = disconnects.clone();
    db.set_state_change_callback(move |s| {
        if s == DbState::Disconnected {
            *d2.borrow_mut() += 1;
        }
    });

    db.disconnect();
    db.disconnect();

    assert_eq!(db.state(), DbState::Disconnected);
    assert_eq!(*disconnects.borrow(), 1);
}
