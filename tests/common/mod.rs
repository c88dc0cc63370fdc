//! Scripted vendor client for driving the pipeline without a server.
//!
//! The mock implements [`PgClient`] over one end of a socketpair so the
//! real event loop has a descriptor to poll. Return values are scripted
//! per call; the shared state doubles as a call and wire trace.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use pgsql_driver::{
    ClientFactory, ConnStatus, DbState, EventLoop, FlushStatus, PgClient, PgServerResult, PgsqlDb,
    PollingStatus, ResultStatus,
};

/// Collects formatted log output so tests can assert on the stable log
/// lines.
#[derive(Clone, Default)]
pub struct LogBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl LogBuffer {
    pub fn contents(&self) -> String {
        let inner = self.inner.lock().expect("log buffer poisoned");
        String::from_utf8_lossy(&inner).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .lock()
            .expect("log buffer poisoned")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> LogBuffer {
        self.clone()
    }
}

/// Run `f` with a scoped subscriber and return its result together with
/// the log lines emitted on this thread while it ran.
pub fn capture_logs<R>(f: impl FnOnce() -> R) -> (R, String) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .without_time()
        .with_writer(buffer.clone())
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, buffer.contents())
}

/// A scripted server response.
pub struct MockResult {
    status: ResultStatus,
    fields: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
    error: String,
    cmd_tuples: String,
}

impl MockResult {
    pub fn tuples(fields: &[&str], rows: &[&[Option<&str>]]) -> MockResult {
        MockResult {
            status: ResultStatus::TuplesOk,
            fields: fields.iter().map(|f| f.to_string()).collect(),
            rows: rows
                .iter()
                .map(|row| row.iter().map(|v| v.map(str::to_string)).collect())
                .collect(),
            error: String::new(),
            cmd_tuples: rows.len().to_string(),
        }
    }

    pub fn command_ok(cmd_tuples: &str) -> MockResult {
        MockResult {
            status: ResultStatus::CommandOk,
            fields: Vec::new(),
            rows: Vec::new(),
            error: String::new(),
            cmd_tuples: cmd_tuples.to_string(),
        }
    }

    pub fn server_error(message: &str) -> MockResult {
        MockResult {
            status: ResultStatus::FatalError,
            fields: Vec::new(),
            rows: Vec::new(),
            error: format!("{}\n", message),
            cmd_tuples: String::new(),
        }
    }

    pub fn nonfatal_error(message: &str) -> MockResult {
        MockResult {
            status: ResultStatus::NonfatalError,
            fields: Vec::new(),
            rows: Vec::new(),
            error: message.to_string(),
            cmd_tuples: String::new(),
        }
    }
}

impl PgServerResult for MockResult {
    fn status(&self) -> ResultStatus {
        self.status
    }

    fn ntuples(&self) -> usize {
        self.rows.len()
    }

    fn nfields(&self) -> usize {
        self.fields.len()
    }

    fn field_name(&self, idx: usize) -> &str {
        &self.fields[idx]
    }

    fn value(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row)?.get(col)?.as_deref()
    }

    fn error_message(&self) -> &str {
        &self.error
    }

    fn cmd_tuples(&self) -> &str {
        &self.cmd_tuples
    }
}

/// Shared script and trace for all connections a factory produces.
pub struct MockState {
    // script
    pub connect_polls: VecDeque<PollingStatus>,
    pub flushes: VecDeque<FlushStatus>,
    pub flush_default: FlushStatus,
    pub busy: VecDeque<bool>,
    /// Result packets handed out per query, FIFO.
    pub results: VecDeque<Vec<MockResult>>,
    pub fail_send: bool,
    /// Fail consume_input on exactly this (1-based) call.
    pub consume_fail_at: Option<usize>,
    pub start_bad: bool,
    /// Write a byte into the socketpair so read watches fire.
    pub readable: bool,
    /// Plug the socket when flush returns Pending so write watches stay
    /// quiet and timers can win.
    pub silent_writes: bool,
    pub dbname: String,

    // trace
    pub calls: Vec<String>,
    pub queries: Vec<String>,
    pub connects: usize,
    pub in_flight: u32,
    pub max_in_flight: u32,

    // per-connection
    consume_calls: usize,
    cur_results: VecDeque<MockResult>,
    in_query: bool,
    bad: bool,
    last_error: String,
    peers: Vec<UnixStream>,
}

impl Default for MockState {
    fn default() -> Self {
        MockState {
            connect_polls: VecDeque::new(),
            flushes: VecDeque::new(),
            flush_default: FlushStatus::Done,
            busy: VecDeque::new(),
            results: VecDeque::new(),
            fail_send: false,
            consume_fail_at: None,
            start_bad: false,
            readable: true,
            silent_writes: false,
            dbname: "mails".to_string(),
            calls: Vec::new(),
            queries: Vec::new(),
            connects: 0,
            in_flight: 0,
            max_in_flight: 0,
            consume_calls: 0,
            cur_results: VecDeque::new(),
            in_query: false,
            bad: false,
            last_error: String::new(),
            peers: Vec::new(),
        }
    }
}

pub struct MockClient {
    state: Rc<RefCell<MockState>>,
    sock: UnixStream,
    dbname: String,
}

impl PgClient for MockClient {
    fn socket_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    fn set_nonblocking(&mut self) -> pgsql_driver::Result<()> {
        Ok(())
    }

    fn connect_poll(&mut self) -> PollingStatus {
        let mut st = self.state.borrow_mut();
        let status = st.connect_polls.pop_front().unwrap_or(PollingStatus::Ok);
        st.calls.push(format!("connect_poll:{:?}", status));
        if status == PollingStatus::Failed {
            st.bad = true;
            st.last_error = "connection refused".to_string();
        }
        status
    }

    fn status(&self) -> ConnStatus {
        if self.state.borrow().bad {
            ConnStatus::Bad
        } else {
            ConnStatus::Ok
        }
    }

    fn db_name(&self) -> &str {
        &self.dbname
    }

    fn error_message(&self) -> String {
        self.state.borrow().last_error.clone()
    }

    fn send_query(&mut self, query: &str) -> bool {
        let mut st = self.state.borrow_mut();
        st.calls.push("send_query".to_string());
        st.queries.push(query.to_string());
        if st.fail_send {
            st.last_error = "could not send query".to_string();
            st.bad = true;
            return false;
        }
        st.in_flight += 1;
        st.max_in_flight = st.max_in_flight.max(st.in_flight);
        st.in_query = true;
        let packets = st.results.pop_front().unwrap_or_default();
        st.cur_results = packets.into();
        true
    }

    fn flush(&mut self) -> FlushStatus {
        let (status, plug) = {
            let mut st = self.state.borrow_mut();
            let status = st.flushes.pop_front().unwrap_or(st.flush_default);
            st.calls.push(format!("flush:{:?}", status));
            (status, st.silent_writes)
        };
        if status == FlushStatus::Pending && plug {
            // Fill the send buffer so POLLOUT stays clear.
            let chunk = [0u8; 4096];
            loop {
                match self.sock.write(&chunk) {
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        }
        status
    }

    fn consume_input(&mut self) -> bool {
        let mut st = self.state.borrow_mut();
        st.consume_calls += 1;
        st.calls.push("consume_input".to_string());
        if st.consume_fail_at == Some(st.consume_calls) {
            st.bad = true;
            st.last_error = "server closed the connection unexpectedly".to_string();
            return false;
        }
        true
    }

    fn is_busy(&self) -> bool {
        let mut st = self.state.borrow_mut();
        let busy = st.busy.pop_front().unwrap_or(false);
        st.calls.push(format!("is_busy:{}", busy));
        busy
    }

    fn get_result(&mut self) -> Option<Box<dyn PgServerResult>> {
        let mut st = self.state.borrow_mut();
        st.calls.push("get_result".to_string());
        match st.cur_results.pop_front() {
            Some(result) => Some(Box::new(result)),
            None => {
                if st.in_query {
                    st.in_query = false;
                    st.in_flight -= 1;
                }
                None
            }
        }
    }

    fn escape_string_conn(&self, s: &str) -> String {
        s.replace('\'', "''")
    }
}

/// Build a mock state and a factory producing connections backed by it.
/// The factory may be invoked repeatedly (reconnects); the script and
/// trace carry across connections.
pub fn new_mock() -> (Rc<RefCell<MockState>>, ClientFactory) {
    let state = Rc::new(RefCell::new(MockState::default()));
    let factory_state = state.clone();
    let factory: ClientFactory = Rc::new(move |_connect_string: &str| {
        let (sock, mut peer) = UnixStream::pair().expect("socketpair");
        sock.set_nonblocking(true).expect("nonblocking");
        peer.set_nonblocking(true).expect("nonblocking");
        let mut st = factory_state.borrow_mut();
        if st.readable {
            let _ = peer.write(b"r");
        }
        st.peers.push(peer);
        st.connects += 1;
        st.bad = st.start_bad;
        st.cur_results.clear();
        st.in_query = false;
        let dbname = st.dbname.clone();
        drop(st);
        Box::new(MockClient {
            state: factory_state.clone(),
            sock,
            dbname,
        }) as Box<dyn PgClient>
    });
    (state, factory)
}

/// Connect the instance and run the loop until it reaches Idle.
pub fn connect_ready(ev: &Rc<EventLoop>, db: &PgsqlDb) {
    assert_eq!(db.connect(), 0);
    let ev2 = ev.clone();
    db.set_state_change_callback(move |state| {
        if state == DbState::Idle || state == DbState::Disconnected {
            ev2.stop();
        }
    });
    ev.run();
    assert_eq!(db.state(), DbState::Idle);
}
