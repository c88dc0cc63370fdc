//! PostgreSQL frontend and backend protocol messages.
//!
//! Only the subset the simple-query protocol needs: startup and password
//! authentication on the frontend side, query responses on the backend side.

use zerocopy::FromBytes;

use crate::error::{Error, ErrorFields, Result};

use super::codec::{read_cstr, read_cstring, read_u16, read_u32, MessageBuilder};

/// Backend message type bytes.
pub mod msg_type {
    /// Authentication message
    pub const AUTHENTICATION: u8 = b'R';
    /// BackendKeyData
    pub const BACKEND_KEY_DATA: u8 = b'K';
    /// ParameterStatus
    pub const PARAMETER_STATUS: u8 = b'S';
    /// ReadyForQuery
    pub const READY_FOR_QUERY: u8 = b'Z';
    /// RowDescription
    pub const ROW_DESCRIPTION: u8 = b'T';
    /// DataRow
    pub const DATA_ROW: u8 = b'D';
    /// CommandComplete
    pub const COMMAND_COMPLETE: u8 = b'C';
    /// EmptyQueryResponse
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    /// ErrorResponse
    pub const ERROR_RESPONSE: u8 = b'E';
    /// NoticeResponse
    pub const NOTICE_RESPONSE: u8 = b'N';
    /// NotificationResponse
    pub const NOTIFICATION_RESPONSE: u8 = b'A';
}

/// Protocol version 3.0.
const PROTOCOL_VERSION: i32 = 196_608;

// === Frontend writers ===

/// Write a StartupMessage with the given parameters.
pub fn write_startup(buf: &mut Vec<u8>, params: &[(&str, &str)]) {
    let mut msg = MessageBuilder::new_startup(buf);
    msg.write_i32(PROTOCOL_VERSION);
    for (name, value) in params {
        msg.write_cstr(name);
        msg.write_cstr(value);
    }
    msg.write_bytes(&[0]);
    msg.finish();
}

/// Write a PasswordMessage (cleartext or MD5-hashed).
pub fn write_password(buf: &mut Vec<u8>, password: &str) {
    let mut msg = MessageBuilder::new(buf, b'p');
    msg.write_cstr(password);
    msg.finish();
}

/// Write a Query message.
pub fn write_query(buf: &mut Vec<u8>, query: &str) {
    let mut msg = MessageBuilder::new(buf, b'Q');
    msg.write_cstr(query);
    msg.finish();
}

/// Write a Terminate message.
pub fn write_terminate(buf: &mut Vec<u8>) {
    let msg = MessageBuilder::new(buf, b'X');
    msg.finish();
}

/// Derive the MD5 password response: `"md5" + md5(md5(password + user) + salt)`.
pub fn md5_password(username: &str, password: &str, salt: &[u8; 4]) -> String {
    use md5::{Digest, Md5};

    fn hex(digest: &[u8]) -> String {
        let mut out = String::with_capacity(digest.len() * 2);
        for b in digest {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }

    let mut hasher = Md5::new();
    hasher.update(password.as_bytes());
    hasher.update(username.as_bytes());
    let inner = hex(&hasher.finalize());

    let mut hasher = Md5::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);
    format!("md5{}", hex(&hasher.finalize()))
}

// === Backend parsers ===

/// Authentication message variants.
#[derive(Debug)]
pub enum AuthenticationMessage {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    Sasl { mechanisms: Vec<String> },
    Other(u32),
}

impl AuthenticationMessage {
    /// Parse an Authentication message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (code, rest) = read_u32(payload)?;
        match code {
            0 => Ok(AuthenticationMessage::Ok),
            3 => Ok(AuthenticationMessage::CleartextPassword),
            5 => {
                if rest.len() < 4 {
                    return Err(Error::Protocol("MD5 salt missing".into()));
                }
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&rest[..4]);
                Ok(AuthenticationMessage::Md5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                let mut data = rest;
                while !data.is_empty() && data[0] != 0 {
                    let (mech, next) = read_cstr(data)?;
                    mechanisms.push(mech.to_string());
                    data = next;
                }
                Ok(AuthenticationMessage::Sasl { mechanisms })
            }
            other => Ok(AuthenticationMessage::Other(other)),
        }
    }
}

/// RowDescription message header.
#[derive(Debug, Clone, Copy, FromBytes, zerocopy::KnownLayout, zerocopy::Immutable)]
#[repr(C, packed)]
struct RowDescriptionHead {
    num_fields: zerocopy::byteorder::big_endian::U16,
}

/// RowDescription message - the columns of a result set.
#[derive(Debug)]
pub struct RowDescription {
    field_names: Vec<String>,
}

impl RowDescription {
    /// Parse a RowDescription message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 2 {
            return Err(Error::Protocol("RowDescription too short".into()));
        }
        let head = RowDescriptionHead::ref_from_bytes(&payload[..2])
            .map_err(|e| Error::Protocol(format!("RowDescription header: {e:?}")))?;

        let num_fields = head.num_fields.get() as usize;
        let mut field_names = Vec::with_capacity(num_fields);
        let mut data = &payload[2..];

        for _ in 0..num_fields {
            let (name, rest) = read_cstr(data)?;
            field_names.push(name.to_string());
            // table oid (4), column id (2), type oid (4), type size (2),
            // type modifier (4), format code (2)
            if rest.len() < 18 {
                return Err(Error::Protocol("RowDescription field truncated".into()));
            }
            data = &rest[18..];
        }

        Ok(Self { field_names })
    }

    /// Field names in column order.
    pub fn field_names(&self) -> &[String] {
        &self.field_names
    }

    /// Take the field names.
    pub fn into_field_names(self) -> Vec<String> {
        self.field_names
    }
}

/// DataRow message - a single row of data.
#[derive(Debug, Clone, Copy)]
pub struct DataRow<'a> {
    num_columns: u16,
    columns_data: &'a [u8],
}

impl<'a> DataRow<'a> {
    /// Parse a DataRow message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (num_columns, rest) = read_u16(payload)?;
        Ok(Self {
            num_columns,
            columns_data: rest,
        })
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.num_columns as usize
    }

    /// True if the row carries no columns.
    pub fn is_empty(&self) -> bool {
        self.num_columns == 0
    }

    /// Iterate over column values. `None` represents SQL NULL.
    pub fn iter(&self) -> DataRowIter<'a> {
        DataRowIter {
            remaining: self.columns_data,
        }
    }
}

/// Iterator over column values in a DataRow.
#[derive(Debug, Clone)]
pub struct DataRowIter<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for DataRowIter<'a> {
    type Item = Option<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.len() < 4 {
            return None;
        }

        let len = i32::from_be_bytes([
            self.remaining[0],
            self.remaining[1],
            self.remaining[2],
            self.remaining[3],
        ]);
        self.remaining = &self.remaining[4..];

        if len == -1 {
            Some(None)
        } else {
            let len = len as usize;
            if self.remaining.len() < len {
                return None;
            }
            let value = &self.remaining[..len];
            self.remaining = &self.remaining[len..];
            Some(Some(value))
        }
    }
}

/// CommandComplete message - successful completion of a command.
#[derive(Debug, Clone, Copy)]
pub struct CommandComplete<'a> {
    /// Command tag (e.g., "SELECT 5", "INSERT 0 1", "UPDATE 10")
    pub tag: &'a str,
}

impl<'a> CommandComplete<'a> {
    /// Parse a CommandComplete message from payload bytes.
    pub fn parse(payload: &'a [u8]) -> Result<Self> {
        let (tag, _) = read_cstr(payload)?;
        Ok(Self { tag })
    }
}

/// ReadyForQuery message - the backend is ready for the next query.
#[derive(Debug, Clone, Copy)]
pub struct ReadyForQuery {
    /// Transaction status indicator: b'I', b'T' or b'E'.
    pub status: u8,
}

impl ReadyForQuery {
    /// Parse a ReadyForQuery message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Err(Error::Protocol("ReadyForQuery too short".into()));
        }
        Ok(Self { status: payload[0] })
    }
}

/// ParameterStatus message - a server parameter value.
#[derive(Debug)]
pub struct ParameterStatus {
    pub name: String,
    pub value: String,
}

impl ParameterStatus {
    /// Parse a ParameterStatus message from payload bytes.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (name, rest) = read_cstr(payload)?;
        let (value, _) = read_cstr(rest)?;
        Ok(Self {
            name: name.to_string(),
            value: value.to_string(),
        })
    }
}

/// Parse ErrorResponse/NoticeResponse fields into [`ErrorFields`].
pub fn parse_error_fields(payload: &[u8]) -> Result<ErrorFields> {
    let mut fields = ErrorFields::default();
    let mut data = payload;

    while !data.is_empty() && data[0] != 0 {
        let field_type = data[0];
        let (value, rest) = read_cstring(&data[1..])?;
        let value = String::from_utf8_lossy(value).into_owned();
        match field_type {
            b'S' => fields.severity = Some(value),
            b'C' => fields.code = Some(value),
            b'M' => fields.message = Some(value),
            b'D' => fields.detail = Some(value),
            b'H' => fields.hint = Some(value),
            _ => {}
        }
        data = rest;
    }

    Ok(fields)
}
