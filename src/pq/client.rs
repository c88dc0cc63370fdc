//! Nonblocking PostgreSQL protocol engine.
//!
//! Implements the [`PgClient`] contract over a nonblocking TCP socket:
//! connection establishment is advanced by [`PqClient::connect_poll`] after
//! socket readiness, queries go out through a buffered write that
//! [`PqClient::flush`] drains without blocking, and responses are assembled
//! frame by frame from [`PqClient::consume_input`].

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{self, sockopt, AddressFamily, SockFlag, SockType, SockaddrIn, SockaddrIn6};

use crate::error::{Error, ErrorFields, Result};

use super::codec::read_i32;
use super::escape;
use super::message::{
    self, msg_type, AuthenticationMessage, CommandComplete, DataRow, ParameterStatus,
    ReadyForQuery, RowDescription,
};
use super::{ConnInfo, ConnStatus, FlushStatus, PgClient, PgServerResult, PollingStatus,
    ResultStatus};

/// A completed server response.
#[derive(Debug)]
pub struct PqResult {
    status: ResultStatus,
    fields: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
    error: String,
    cmd_tuples: String,
}

impl PqResult {
    fn tuples(fields: Vec<String>, rows: Vec<Vec<Option<String>>>, tag: &str) -> PqResult {
        PqResult {
            status: ResultStatus::TuplesOk,
            fields,
            rows,
            error: String::new(),
            cmd_tuples: cmd_tuples_from_tag(tag),
        }
    }

    fn command_ok(tag: &str) -> PqResult {
        PqResult {
            status: ResultStatus::CommandOk,
            fields: Vec::new(),
            rows: Vec::new(),
            error: String::new(),
            cmd_tuples: cmd_tuples_from_tag(tag),
        }
    }

    fn empty_query() -> PqResult {
        PqResult {
            status: ResultStatus::EmptyQuery,
            fields: Vec::new(),
            rows: Vec::new(),
            error: String::new(),
            cmd_tuples: String::new(),
        }
    }

    fn server_error(fields: &ErrorFields) -> PqResult {
        PqResult {
            status: ResultStatus::FatalError,
            fields: Vec::new(),
            rows: Vec::new(),
            // libpq keeps the trailing newline; the result object strips it
            error: format!("{}\n", fields),
            cmd_tuples: String::new(),
        }
    }
}

impl PgServerResult for PqResult {
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

/// Extract the affected-row digits from a command tag.
fn cmd_tuples_from_tag(tag: &str) -> String {
    let parts: Vec<&str> = tag.split_whitespace().collect();
    match parts.as_slice() {
        ["SELECT", n] | ["UPDATE", n] | ["DELETE", n] | ["COPY", n] | ["MOVE", n]
        | ["FETCH", n] => n.to_string(),
        ["INSERT", _oid, n] => n.to_string(),
        _ => String::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartupPhase {
    TcpConnect,
    AwaitAuth,
    AwaitReady,
    Done,
}

struct ResultBuilder {
    fields: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

/// The vendor connection handle backed by a real socket.
pub struct PqClient {
    info: ConnInfo,
    stream: Option<TcpStream>,
    phase: StartupPhase,
    standard_conforming: bool,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    write_pos: usize,
    results: VecDeque<PqResult>,
    building: Option<ResultBuilder>,
    ready_seen: bool,
    bad: bool,
    last_error: String,
}

impl PqClient {
    /// Begin an asynchronous connect. Name resolution happens here and may
    /// block; everything after is nonblocking. Failures are recorded on the
    /// handle rather than returned, so the caller can read the error text.
    pub fn connect_start(connect_string: &str) -> PqClient {
        let info = match ConnInfo::parse(connect_string) {
            Ok(info) => info,
            Err(e) => {
                let mut client = PqClient::empty(ConnInfo {
                    host: String::new(),
                    port: 0,
                    user: String::new(),
                    password: None,
                    dbname: String::new(),
                });
                client.fail(&e.to_string());
                return client;
            }
        };
        let mut client = PqClient::empty(info);
        if let Err(e) = client.begin_connect() {
            client.fail(&e.to_string());
        }
        client
    }

    fn empty(info: ConnInfo) -> PqClient {
        PqClient {
            info,
            stream: None,
            phase: StartupPhase::TcpConnect,
            standard_conforming: true,
            read_buf: Vec::with_capacity(8192),
            write_buf: Vec::with_capacity(1024),
            write_pos: 0,
            results: VecDeque::new(),
            building: None,
            ready_seen: false,
            bad: false,
            last_error: String::new(),
        }
    }

    fn begin_connect(&mut self) -> Result<()> {
        let addrs = (self.info.host.as_str(), self.info.port).to_socket_addrs()?;
        let addr = addrs.into_iter().next().ok_or_else(|| {
            Error::InvalidUsage(format!("no addresses for host \"{}\"", self.info.host))
        })?;

        let family = match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        };
        let fd = socket::socket(
            family,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )?;

        let connected = match addr {
            SocketAddr::V4(a) => socket::connect(fd.as_raw_fd(), &SockaddrIn::from(a)),
            SocketAddr::V6(a) => socket::connect(fd.as_raw_fd(), &SockaddrIn6::from(a)),
        };
        match connected {
            Ok(()) | Err(Errno::EINPROGRESS) => {}
            Err(e) => return Err(e.into()),
        }

        self.stream = Some(TcpStream::from(fd));
        Ok(())
    }

    fn fail(&mut self, msg: &str) {
        self.bad = true;
        self.last_error = msg.to_string();
    }

    /// Drain as much of the write buffer as the socket accepts.
    fn flush_write(&mut self) -> FlushStatus {
        while self.write_pos < self.write_buf.len() {
            let written = match self.stream.as_mut() {
                Some(stream) => stream.write(&self.write_buf[self.write_pos..]),
                None => return FlushStatus::Failed,
            };
            match written {
                Ok(0) => {
                    self.fail("socket write returned 0");
                    return FlushStatus::Failed;
                }
                Ok(n) => self.write_pos += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return FlushStatus::Pending,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail(&format!("write failed: {}", e));
                    return FlushStatus::Failed;
                }
            }
        }
        self.write_buf.clear();
        self.write_pos = 0;
        FlushStatus::Done
    }

    /// Read everything currently available without blocking.
    fn fill_read_buf(&mut self) -> bool {
        let mut chunk = [0u8; 8192];
        loop {
            let read = match self.stream.as_mut() {
                Some(stream) => stream.read(&mut chunk),
                None => return false,
            };
            match read {
                Ok(0) => {
                    self.fail("server closed the connection unexpectedly");
                    return false;
                }
                Ok(n) => self.read_buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.fail(&format!("read failed: {}", e));
                    return false;
                }
            }
        }
    }

    /// Pop one complete frame from the read buffer, if present.
    fn take_frame(&mut self) -> Result<Option<(u8, Vec<u8>)>> {
        if self.read_buf.len() < 5 {
            return Ok(None);
        }
        let type_byte = self.read_buf[0];
        let (len, _) = read_i32(&self.read_buf[1..5])?;
        if len < 4 {
            return Err(Error::Protocol(format!("invalid message length {}", len)));
        }
        let total = 1 + len as usize;
        if self.read_buf.len() < total {
            return Ok(None);
        }
        let payload = self.read_buf[5..total].to_vec();
        self.read_buf.drain(..total);
        Ok(Some((type_byte, payload)))
    }

    /// Process all complete frames in the read buffer.
    fn drain_frames(&mut self) -> Result<()> {
        while let Some((type_byte, payload)) = self.take_frame()? {
            self.process_frame(type_byte, &payload)?;
        }
        Ok(())
    }

    fn process_frame(&mut self, type_byte: u8, payload: &[u8]) -> Result<()> {
        match type_byte {
            msg_type::ROW_DESCRIPTION => {
                let desc = RowDescription::parse(payload)?;
                self.building = Some(ResultBuilder {
                    fields: desc.into_field_names(),
                    rows: Vec::new(),
                });
            }
            msg_type::DATA_ROW => {
                // Rows after an error response have no builder; drop them.
                if let Some(builder) = self.building.as_mut() {
                    let row = DataRow::parse(payload)?;
                    let mut values = Vec::with_capacity(row.len());
                    for value in row.iter() {
                        let value = match value {
                            None => None,
                            Some(bytes) => Some(
                                simdutf8::compat::from_utf8(bytes)
                                    .map_err(|e| {
                                        Error::Protocol(format!("row value: invalid UTF-8: {e}"))
                                    })?
                                    .to_string(),
                            ),
                        };
                        values.push(value);
                    }
                    builder.rows.push(values);
                }
            }
            msg_type::COMMAND_COMPLETE => {
                let complete = CommandComplete::parse(payload)?;
                let result = match self.building.take() {
                    Some(builder) => PqResult::tuples(builder.fields, builder.rows, complete.tag),
                    None => PqResult::command_ok(complete.tag),
                };
                self.results.push_back(result);
            }
            msg_type::EMPTY_QUERY_RESPONSE => {
                self.building = None;
                self.results.push_back(PqResult::empty_query());
            }
            msg_type::ERROR_RESPONSE => {
                let fields = message::parse_error_fields(payload)?;
                self.building = None;
                self.last_error = fields.to_string();
                self.results.push_back(PqResult::server_error(&fields));
            }
            msg_type::READY_FOR_QUERY => {
                ReadyForQuery::parse(payload)?;
                self.ready_seen = true;
            }
            msg_type::NOTICE_RESPONSE => {
                let fields = message::parse_error_fields(payload)?;
                tracing::debug!("pgsql notice: {}", fields);
            }
            msg_type::PARAMETER_STATUS => {
                self.apply_parameter_status(payload)?;
            }
            msg_type::NOTIFICATION_RESPONSE | msg_type::BACKEND_KEY_DATA => {}
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected message type '{}'",
                    other as char
                )));
            }
        }
        Ok(())
    }

    fn apply_parameter_status(&mut self, payload: &[u8]) -> Result<()> {
        let param = ParameterStatus::parse(payload)?;
        if param.name == "standard_conforming_strings" {
            self.standard_conforming = param.value == "on";
        }
        Ok(())
    }

    /// Block until the socket is readable. The one place the engine waits.
    fn wait_readable(&mut self) -> bool {
        let fd = match self.stream.as_ref() {
            Some(stream) => stream.as_raw_fd(),
            None => return false,
        };
        loop {
            // Safety: the stream stays open for the duration of the call.
            let mut fds = [PollFd::new(
                unsafe { BorrowedFd::borrow_raw(fd) },
                PollFlags::POLLIN,
            )];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => return true,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    self.fail(&format!("poll failed: {}", e));
                    return false;
                }
            }
        }
    }
}

impl PgClient for PqClient {
    fn socket_fd(&self) -> RawFd {
        self.stream.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1)
    }

    fn set_nonblocking(&mut self) -> Result<()> {
        match self.stream.as_ref() {
            Some(stream) => Ok(stream.set_nonblocking(true)?),
            None => Err(Error::ConnectionBroken),
        }
    }

    fn connect_poll(&mut self) -> PollingStatus {
        if self.bad {
            return PollingStatus::Failed;
        }
        if self.phase == StartupPhase::Done {
            return PollingStatus::Ok;
        }

        if self.phase == StartupPhase::TcpConnect {
            let sock_err = match self.stream.as_ref() {
                Some(stream) => socket::getsockopt(stream, sockopt::SocketError),
                None => {
                    self.fail("no socket");
                    return PollingStatus::Failed;
                }
            };
            match sock_err {
                Ok(0) => {}
                Ok(errno) => {
                    let e = std::io::Error::from_raw_os_error(errno);
                    self.fail(&format!("could not connect to server: {}", e));
                    return PollingStatus::Failed;
                }
                Err(e) => {
                    self.fail(&format!("getsockopt failed: {}", e));
                    return PollingStatus::Failed;
                }
            }
            let params = [
                ("user", self.info.user.clone()),
                ("database", self.info.dbname.clone()),
                ("client_encoding", "UTF8".to_string()),
            ];
            let params_ref: Vec<(&str, &str)> =
                params.iter().map(|(k, v)| (*k, v.as_str())).collect();
            message::write_startup(&mut self.write_buf, &params_ref);
            self.phase = StartupPhase::AwaitAuth;
        }

        // Push out whatever is queued (startup or password message).
        match self.flush_write() {
            FlushStatus::Pending => return PollingStatus::Writing,
            FlushStatus::Failed => return PollingStatus::Failed,
            FlushStatus::Done => {}
        }

        if !self.fill_read_buf() {
            return PollingStatus::Failed;
        }

        loop {
            let frame = match self.take_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    self.fail(&e.to_string());
                    return PollingStatus::Failed;
                }
            };
            let Some((type_byte, payload)) = frame else {
                break;
            };
            if let Err(e) = self.process_startup_frame(type_byte, &payload) {
                self.fail(&e.to_string());
                return PollingStatus::Failed;
            }
            if self.phase == StartupPhase::Done {
                break;
            }
        }

        match self.flush_write() {
            FlushStatus::Pending => return PollingStatus::Writing,
            FlushStatus::Failed => return PollingStatus::Failed,
            FlushStatus::Done => {}
        }

        if self.phase == StartupPhase::Done {
            PollingStatus::Ok
        } else {
            PollingStatus::Reading
        }
    }

    fn status(&self) -> ConnStatus {
        if self.bad || self.stream.is_none() {
            ConnStatus::Bad
        } else {
            ConnStatus::Ok
        }
    }

    fn db_name(&self) -> &str {
        &self.info.dbname
    }

    fn error_message(&self) -> String {
        self.last_error.clone()
    }

    fn send_query(&mut self, query: &str) -> bool {
        if self.bad || self.stream.is_none() || self.phase != StartupPhase::Done {
            return false;
        }
        self.ready_seen = false;
        self.results.clear();
        self.building = None;
        message::write_query(&mut self.write_buf, query);
        true
    }

    fn flush(&mut self) -> FlushStatus {
        if self.bad {
            return FlushStatus::Failed;
        }
        self.flush_write()
    }

    fn consume_input(&mut self) -> bool {
        if self.bad {
            return false;
        }
        if !self.fill_read_buf() {
            return false;
        }
        if let Err(e) = self.drain_frames() {
            self.fail(&e.to_string());
            return false;
        }
        true
    }

    fn is_busy(&self) -> bool {
        !self.bad && self.results.is_empty() && !self.ready_seen
    }

    fn get_result(&mut self) -> Option<Box<dyn PgServerResult>> {
        loop {
            if let Some(result) = self.results.pop_front() {
                return Some(Box::new(result));
            }
            if self.ready_seen || self.bad {
                return None;
            }
            if !self.wait_readable() {
                return None;
            }
            if !self.consume_input() {
                return None;
            }
        }
    }

    fn escape_string_conn(&self, s: &str) -> String {
        escape::escape_string_with(s, self.standard_conforming)
    }
}

impl Drop for PqClient {
    fn drop(&mut self) {
        // Try to say goodbye; a failure here is irrelevant.
        if self.phase == StartupPhase::Done && !self.bad {
            self.write_buf.clear();
            self.write_pos = 0;
            message::write_terminate(&mut self.write_buf);
            let _ = self.flush_write();
        }
    }
}

impl PqClient {
    fn process_startup_frame(&mut self, type_byte: u8, payload: &[u8]) -> Result<()> {
        match type_byte {
            msg_type::AUTHENTICATION => match AuthenticationMessage::parse(payload)? {
                AuthenticationMessage::Ok => {
                    self.phase = StartupPhase::AwaitReady;
                }
                AuthenticationMessage::CleartextPassword => {
                    let password = self.require_password()?;
                    message::write_password(&mut self.write_buf, &password);
                }
                AuthenticationMessage::Md5Password { salt } => {
                    let password = self.require_password()?;
                    let hashed = message::md5_password(&self.info.user, &password, &salt);
                    message::write_password(&mut self.write_buf, &hashed);
                }
                AuthenticationMessage::Sasl { .. } => {
                    return Err(Error::Unsupported(
                        "SASL authentication not supported".into(),
                    ));
                }
                AuthenticationMessage::Other(code) => {
                    return Err(Error::Unsupported(format!(
                        "authentication method {} not supported",
                        code
                    )));
                }
            },
            msg_type::ERROR_RESPONSE => {
                let fields = message::parse_error_fields(payload)?;
                return Err(Error::Server(fields));
            }
            msg_type::PARAMETER_STATUS => {
                self.apply_parameter_status(payload)?;
            }
            msg_type::READY_FOR_QUERY => {
                ReadyForQuery::parse(payload)?;
                self.phase = StartupPhase::Done;
            }
            msg_type::BACKEND_KEY_DATA => {}
            msg_type::NOTICE_RESPONSE => {
                let fields = message::parse_error_fields(payload)?;
                tracing::debug!("pgsql notice: {}", fields);
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected message '{}' during startup",
                    other as char
                )));
            }
        }
        Ok(())
    }

    fn require_password(&self) -> Result<String> {
        self.info
            .password
            .clone()
            .ok_or_else(|| Error::Auth("password required but none supplied".into()))
    }
}
