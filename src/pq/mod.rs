//! Vendor client layer: the nonblocking PostgreSQL protocol engine and the
//! trait seam the driver core consumes it through.
//!
//! The driver never touches sockets or wire bytes itself; it drives a
//! [`PgClient`] through readiness events and reads completed responses as
//! [`PgServerResult`] objects. Tests substitute a scripted implementation.

pub mod client;
pub mod codec;
pub mod escape;
pub mod message;

use std::os::fd::RawFd;

use crate::error::{Error, Result};

/// Answer from [`PgClient::connect_poll`]: what the engine needs next to
/// make progress on connection establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingStatus {
    /// Wait for the socket to become readable, then poll again.
    Reading,
    /// Wait for the socket to become writable, then poll again.
    Writing,
    /// Connection established and authenticated.
    Ok,
    /// Connection failed; see [`PgClient::error_message`].
    Failed,
}

/// Answer from [`PgClient::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// All buffered data written.
    Done,
    /// The socket would block; wait for writability and flush again.
    Pending,
    /// Write failed; the connection is broken.
    Failed,
}

/// Coarse connection health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Ok,
    Bad,
}

/// Status of a completed server response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// Command completed, no rows (INSERT, UPDATE, ...).
    CommandOk,
    /// Rows returned (possibly zero).
    TuplesOk,
    /// The query string was empty.
    EmptyQuery,
    /// Notice-level failure; the connection is still usable.
    NonfatalError,
    /// Error response; the driver treats this as connection-fatal.
    FatalError,
    /// The server sent something the engine could not understand.
    BadResponse,
}

/// A single completed server response.
pub trait PgServerResult {
    /// Response status.
    fn status(&self) -> ResultStatus;
    /// Number of rows in the response.
    fn ntuples(&self) -> usize;
    /// Number of fields per row.
    fn nfields(&self) -> usize;
    /// Name of field `idx`. Panics if out of range.
    fn field_name(&self, idx: usize) -> &str;
    /// Text value at (`row`, `col`); `None` for SQL NULL.
    fn value(&self, row: usize, col: usize) -> Option<&str>;
    /// Error text for failed responses, empty otherwise.
    fn error_message(&self) -> &str;
    /// Affected-row count digits from the command tag, empty when the
    /// command reports none.
    fn cmd_tuples(&self) -> &str;
}

/// The vendor connection handle in asynchronous mode.
///
/// Contracts follow the libpq entry points the driver is built around:
/// `connect_poll` after readiness, `send_query` + `flush` to submit,
/// `consume_input` + `is_busy` + `get_result` to collect. `get_result` may
/// block between response packets; the driver only calls it either after
/// `is_busy` returned false or at the one acknowledged blocking site.
pub trait PgClient {
    /// Socket descriptor for readiness watches.
    fn socket_fd(&self) -> RawFd;
    /// Switch the handle to non-blocking mode.
    fn set_nonblocking(&mut self) -> Result<()>;
    /// Advance connection establishment after socket readiness.
    fn connect_poll(&mut self) -> PollingStatus;
    /// Connection health.
    fn status(&self) -> ConnStatus;
    /// Database name this handle connects to, for diagnostics.
    fn db_name(&self) -> &str;
    /// Last error text recorded on the handle.
    fn error_message(&self) -> String;
    /// Submit a query. Returns false if submission failed outright.
    fn send_query(&mut self, query: &str) -> bool;
    /// Write buffered output without blocking.
    fn flush(&mut self) -> FlushStatus;
    /// Read available input without blocking. Returns false when the
    /// connection failed.
    fn consume_input(&mut self) -> bool;
    /// True if `get_result` would have to wait for more input.
    fn is_busy(&self) -> bool;
    /// Fetch the next completed response, or `None` when the current query
    /// has produced all of its responses.
    fn get_result(&mut self) -> Option<Box<dyn PgServerResult>>;
    /// Connection-aware string escaping.
    fn escape_string_conn(&self, s: &str) -> String;
}

/// Parsed `key=value` connection parameters.
///
/// The connect string is opaque to the driver core; only the engine
/// interprets it. Unknown keys are ignored.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub dbname: String,
}

impl ConnInfo {
    /// Parse a space-separated `key=value` connect string. Values may be
    /// single-quoted.
    pub fn parse(connect_string: &str) -> Result<ConnInfo> {
        let mut host = String::from("localhost");
        let mut port = 5432u16;
        let mut user = String::from("postgres");
        let mut password = None;
        let mut dbname = None;

        for token in connect_string.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                return Err(Error::InvalidUsage(format!(
                    "connect string: expected key=value, got \"{}\"",
                    token
                )));
            };
            let value = value.trim_matches('\'');
            match key {
                "host" => host = value.to_string(),
                "port" => {
                    port = value.parse().map_err(|_| {
                        Error::InvalidUsage(format!("connect string: bad port \"{}\"", value))
                    })?;
                }
                "user" => user = value.to_string(),
                "password" => password = Some(value.to_string()),
                "dbname" => dbname = Some(value.to_string()),
                _ => {}
            }
        }

        let dbname = dbname.unwrap_or_else(|| user.clone());
        Ok(ConnInfo {
            host,
            port,
            user,
            password,
            dbname,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conninfo_defaults() {
        let info = ConnInfo::parse("").unwrap();
        assert_eq!(info.host, "localhost");
        assert_eq!(info.port, 5432);
        assert_eq!(info.dbname, info.user);
    }

    #[test]
    fn conninfo_full() {
        let info =
            ConnInfo::parse("host=db.example.org port=5433 user=mail password='secret' dbname=mails")
                .unwrap();
        assert_eq!(info.host, "db.example.org");
        assert_eq!(info.port, 5433);
        assert_eq!(info.user, "mail");
        // quoted values lose their quotes, not their content
        assert_eq!(info.password.as_deref(), Some("secret"));
        assert_eq!(info.dbname, "mails");
    }

    #[test]
    fn conninfo_unknown_keys_ignored() {
        let info = ConnInfo::parse("host=x sslmode=require application_name=imap").unwrap();
        assert_eq!(info.host, "x");
    }

    #[test]
    fn conninfo_rejects_bare_words() {
        assert!(ConnInfo::parse("hostlocalhost").is_err());
        assert!(ConnInfo::parse("port=notanumber").is_err());
    }
}
