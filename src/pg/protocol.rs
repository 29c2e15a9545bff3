//! PostgreSQL wire protocol (v3) message encoding and decoding.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html
//!
//! Outbound messages write themselves into a shared buffer through
//! [`Outbound::write`]; the frame length is patched in after the body is
//! known. Inbound messages are decoded from a complete frame by
//! [`Inbound::decode`].

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{TransportError, TransportResult};
use super::types::Oid;

/// Protocol version 3.0.
pub const PROTOCOL_VERSION: i32 = 196608;

/// Wire format codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

/// Transaction status carried by ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    InTransaction,
    Failed,
}

impl From<u8> for TransactionStatus {
    fn from(b: u8) -> Self {
        match b {
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::Failed,
            _ => TransactionStatus::Idle,
        }
    }
}

// ============================================================================
// Outbound (client -> server)
// ============================================================================

/// A message the client sends.
pub trait Outbound {
    fn write(&self, buf: &mut BytesMut);
}

/// Write a tagged frame: tag byte, length placeholder, body, patched length.
fn frame(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    let len_at = buf.len();
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - len_at) as i32;
    buf[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Startup packet. The only untagged frame.
#[derive(Debug, Clone)]
pub struct Startup {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl Outbound for Startup {
    fn write(&self, buf: &mut BytesMut) {
        let len_at = buf.len();
        buf.put_i32(0);
        buf.put_i32(PROTOCOL_VERSION);
        put_cstr(buf, "user");
        put_cstr(buf, &self.user);
        if let Some(db) = &self.database {
            put_cstr(buf, "database");
            put_cstr(buf, db);
        }
        for (key, value) in &self.options {
            put_cstr(buf, key);
            put_cstr(buf, value);
        }
        buf.put_u8(0);
        let len = (buf.len() - len_at) as i32;
        buf[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
    }
}

/// Password response for cleartext and MD5 authentication.
#[derive(Debug, Clone)]
pub struct Password {
    pub password: String,
}

impl Outbound for Password {
    fn write(&self, buf: &mut BytesMut) {
        frame(buf, b'p', |b| put_cstr(b, &self.password));
    }
}

/// First SCRAM message, naming the mechanism.
#[derive(Debug, Clone)]
pub struct SaslInitial {
    pub mechanism: String,
    pub data: Vec<u8>,
}

impl Outbound for SaslInitial {
    fn write(&self, buf: &mut BytesMut) {
        frame(buf, b'p', |b| {
            put_cstr(b, &self.mechanism);
            b.put_i32(self.data.len() as i32);
            b.put_slice(&self.data);
        });
    }
}

/// Subsequent SCRAM messages.
#[derive(Debug, Clone)]
pub struct SaslResponse {
    pub data: Vec<u8>,
}

impl Outbound for SaslResponse {
    fn write(&self, buf: &mut BytesMut) {
        frame(buf, b'p', |b| b.put_slice(&self.data));
    }
}

/// Simple query protocol: one SQL string, text results.
#[derive(Debug, Clone)]
pub struct SimpleQuery {
    pub sql: String,
}

impl Outbound for SimpleQuery {
    fn write(&self, buf: &mut BytesMut) {
        frame(buf, b'Q', |b| put_cstr(b, &self.sql));
    }
}

/// Create a prepared statement.
#[derive(Debug, Clone)]
pub struct Parse {
    pub name: String,
    pub sql: String,
    pub param_oids: Vec<Oid>,
}

impl Outbound for Parse {
    fn write(&self, buf: &mut BytesMut) {
        frame(buf, b'P', |b| {
            put_cstr(b, &self.name);
            put_cstr(b, &self.sql);
            b.put_i16(self.param_oids.len() as i16);
            for oid in &self.param_oids {
                b.put_i32(oid.as_i32());
            }
        });
    }
}

/// One bound parameter: its payload (None = NULL) and wire format.
#[derive(Debug, Clone)]
pub struct BindParam {
    pub data: Option<Vec<u8>>,
    pub format: Format,
}

/// Bind parameters to a prepared statement, producing a portal.
#[derive(Debug, Clone)]
pub struct Bind {
    pub portal: String,
    pub statement: String,
    pub params: Vec<BindParam>,
    pub result_format: Format,
}

impl Outbound for Bind {
    fn write(&self, buf: &mut BytesMut) {
        frame(buf, b'B', |b| {
            put_cstr(b, &self.portal);
            put_cstr(b, &self.statement);
            b.put_i16(self.params.len() as i16);
            for p in &self.params {
                b.put_i16(p.format as i16);
            }
            b.put_i16(self.params.len() as i16);
            for p in &self.params {
                match &p.data {
                    None => b.put_i32(-1),
                    Some(data) => {
                        b.put_i32(data.len() as i32);
                        b.put_slice(data);
                    }
                }
            }
            b.put_i16(1);
            b.put_i16(self.result_format as i16);
        });
    }
}

/// Request the description of a statement (`'S'`) or portal (`'P'`).
#[derive(Debug, Clone)]
pub struct Describe {
    pub target: u8,
    pub name: String,
}

impl Outbound for Describe {
    fn write(&self, buf: &mut BytesMut) {
        frame(buf, b'D', |b| {
            b.put_u8(self.target);
            put_cstr(b, &self.name);
        });
    }
}

/// Execute a bound portal.
#[derive(Debug, Clone)]
pub struct Execute {
    pub portal: String,
    pub max_rows: i32,
}

impl Outbound for Execute {
    fn write(&self, buf: &mut BytesMut) {
        frame(buf, b'E', |b| {
            put_cstr(b, &self.portal);
            b.put_i32(self.max_rows);
        });
    }
}

/// Close a statement (`'S'`) or portal (`'P'`).
#[derive(Debug, Clone)]
pub struct Close {
    pub target: u8,
    pub name: String,
}

impl Outbound for Close {
    fn write(&self, buf: &mut BytesMut) {
        frame(buf, b'C', |b| {
            b.put_u8(self.target);
            put_cstr(b, &self.name);
        });
    }
}

/// End of an extended-protocol cycle.
#[derive(Debug, Clone, Copy)]
pub struct Sync;

impl Outbound for Sync {
    fn write(&self, buf: &mut BytesMut) {
        frame(buf, b'S', |_| {});
    }
}

/// Close the connection.
#[derive(Debug, Clone, Copy)]
pub struct Terminate;

impl Outbound for Terminate {
    fn write(&self, buf: &mut BytesMut) {
        frame(buf, b'X', |_| {});
    }
}

/// A chunk of COPY FROM STDIN payload.
#[derive(Debug)]
pub struct CopyData<'a> {
    pub data: &'a [u8],
}

impl Outbound for CopyData<'_> {
    fn write(&self, buf: &mut BytesMut) {
        frame(buf, b'd', |b| b.put_slice(self.data));
    }
}

/// End of the COPY payload.
#[derive(Debug, Clone, Copy)]
pub struct CopyDone;

impl Outbound for CopyDone {
    fn write(&self, buf: &mut BytesMut) {
        frame(buf, b'c', |_| {});
    }
}

/// Abort an in-progress COPY.
#[derive(Debug, Clone)]
pub struct CopyFail {
    pub message: String,
}

impl Outbound for CopyFail {
    fn write(&self, buf: &mut BytesMut) {
        frame(buf, b'f', |b| put_cstr(b, &self.message));
    }
}

// ============================================================================
// Inbound (server -> client)
// ============================================================================

/// One column of a RowDescription.
#[derive(Debug, Clone)]
pub struct ColumnDesc {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// A message the server sends.
#[derive(Debug, Clone)]
pub enum Inbound {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMd5Password { salt: [u8; 4] },
    AuthenticationSasl { mechanisms: Vec<String> },
    AuthenticationSaslContinue { data: Bytes },
    AuthenticationSaslFinal { data: Bytes },

    RowDescription { columns: Vec<ColumnDesc> },
    DataRow { cells: Vec<Option<Bytes>> },
    CommandComplete { tag: String },
    EmptyQueryResponse,

    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,

    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },
    ParameterDescription { type_oids: Vec<Oid> },

    ErrorResponse { fields: HashMap<u8, String> },
    NoticeResponse { fields: HashMap<u8, String> },
    NotificationResponse { process_id: i32, channel: String, payload: String },

    CopyInResponse { overall_format: i8, column_formats: Vec<i16> },
    CopyOutResponse { overall_format: i8, column_formats: Vec<i16> },
    CopyBothResponse { overall_format: i8, column_formats: Vec<i16> },
    CopyDataOut { data: Bytes },
    CopyDoneOut,
}

impl Inbound {
    /// Decode one message. The buffer must hold the complete frame,
    /// starting at the tag byte.
    pub fn decode(buf: &mut Bytes) -> TransportResult<Inbound> {
        if buf.remaining() < 5 {
            return Err(TransportError::Protocol(
                "incomplete message header".to_string(),
            ));
        }
        let tag = buf.get_u8();
        let len = buf.get_i32() as usize;
        if len < 4 || buf.remaining() < len - 4 {
            return Err(TransportError::Protocol(
                "incomplete message body".to_string(),
            ));
        }
        let mut body = buf.split_to(len - 4);

        match tag {
            b'R' => decode_auth(body),
            b'T' => decode_row_description(body),
            b'D' => decode_data_row(body),
            b'C' => Ok(Inbound::CommandComplete {
                tag: read_cstr(&mut body)?,
            }),
            b'I' => Ok(Inbound::EmptyQueryResponse),
            b'1' => Ok(Inbound::ParseComplete),
            b'2' => Ok(Inbound::BindComplete),
            b'3' => Ok(Inbound::CloseComplete),
            b'n' => Ok(Inbound::NoData),
            b's' => Ok(Inbound::PortalSuspended),
            b'Z' => Ok(Inbound::ReadyForQuery {
                status: TransactionStatus::from(body.get_u8()),
            }),
            b'S' => Ok(Inbound::ParameterStatus {
                name: read_cstr(&mut body)?,
                value: read_cstr(&mut body)?,
            }),
            b'K' => Ok(Inbound::BackendKeyData {
                process_id: body.get_i32(),
                secret_key: body.get_i32(),
            }),
            b't' => {
                let n = body.get_i16() as usize;
                let mut type_oids = Vec::with_capacity(n);
                for _ in 0..n {
                    type_oids.push(Oid::from_i32(body.get_i32()));
                }
                Ok(Inbound::ParameterDescription { type_oids })
            }
            b'E' => Ok(Inbound::ErrorResponse {
                fields: read_notice_fields(body)?,
            }),
            b'N' => Ok(Inbound::NoticeResponse {
                fields: read_notice_fields(body)?,
            }),
            b'A' => Ok(Inbound::NotificationResponse {
                process_id: body.get_i32(),
                channel: read_cstr(&mut body)?,
                payload: read_cstr(&mut body)?,
            }),
            b'G' => decode_copy_response(body, CopyKind::In),
            b'H' => decode_copy_response(body, CopyKind::Out),
            b'W' => decode_copy_response(body, CopyKind::Both),
            b'd' => Ok(Inbound::CopyDataOut { data: body }),
            b'c' => Ok(Inbound::CopyDoneOut),
            other => Err(TransportError::Protocol(format!(
                "unknown message tag {:?}",
                other as char
            ))),
        }
    }
}

enum CopyKind {
    In,
    Out,
    Both,
}

fn decode_copy_response(mut body: Bytes, kind: CopyKind) -> TransportResult<Inbound> {
    let overall_format = body.get_i8();
    let n = body.get_i16() as usize;
    let mut column_formats = Vec::with_capacity(n);
    for _ in 0..n {
        column_formats.push(body.get_i16());
    }
    Ok(match kind {
        CopyKind::In => Inbound::CopyInResponse {
            overall_format,
            column_formats,
        },
        CopyKind::Out => Inbound::CopyOutResponse {
            overall_format,
            column_formats,
        },
        CopyKind::Both => Inbound::CopyBothResponse {
            overall_format,
            column_formats,
        },
    })
}

fn decode_auth(mut body: Bytes) -> TransportResult<Inbound> {
    match body.get_i32() {
        0 => Ok(Inbound::AuthenticationOk),
        3 => Ok(Inbound::AuthenticationCleartextPassword),
        5 => {
            if body.remaining() < 4 {
                return Err(TransportError::Protocol("short MD5 salt".to_string()));
            }
            let mut salt = [0u8; 4];
            salt.copy_from_slice(&body[..4]);
            Ok(Inbound::AuthenticationMd5Password { salt })
        }
        10 => {
            let mut mechanisms = Vec::new();
            while body.remaining() > 0 && body[0] != 0 {
                mechanisms.push(read_cstr(&mut body)?);
            }
            Ok(Inbound::AuthenticationSasl { mechanisms })
        }
        11 => Ok(Inbound::AuthenticationSaslContinue { data: body }),
        12 => Ok(Inbound::AuthenticationSaslFinal { data: body }),
        other => Err(TransportError::Protocol(format!(
            "unsupported authentication request {}",
            other
        ))),
    }
}

fn decode_row_description(mut body: Bytes) -> TransportResult<Inbound> {
    let n = body.get_i16() as usize;
    let mut columns = Vec::with_capacity(n);
    for _ in 0..n {
        let name = read_cstr(&mut body)?;
        let table_oid = body.get_i32();
        let column_attr = body.get_i16();
        let type_oid = Oid::from_i32(body.get_i32());
        let type_size = body.get_i16();
        let type_modifier = body.get_i32();
        let format = if body.get_i16() == 0 {
            Format::Text
        } else {
            Format::Binary
        };
        columns.push(ColumnDesc {
            name,
            table_oid,
            column_attr,
            type_oid,
            type_size,
            type_modifier,
            format,
        });
    }
    Ok(Inbound::RowDescription { columns })
}

fn decode_data_row(mut body: Bytes) -> TransportResult<Inbound> {
    let n = body.get_i16() as usize;
    let mut cells = Vec::with_capacity(n);
    for _ in 0..n {
        let len = body.get_i32();
        if len < 0 {
            cells.push(None);
        } else {
            cells.push(Some(body.split_to(len as usize)));
        }
    }
    Ok(Inbound::DataRow { cells })
}

fn read_cstr(buf: &mut Bytes) -> TransportResult<String> {
    let mut end = 0;
    while end < buf.remaining() && buf[end] != 0 {
        end += 1;
    }
    if end >= buf.remaining() {
        return Err(TransportError::Protocol(
            "missing string terminator".to_string(),
        ));
    }
    let s = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.advance(end + 1);
    Ok(s)
}

fn read_notice_fields(mut body: Bytes) -> TransportResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();
    while body.remaining() > 0 {
        let kind = body.get_u8();
        if kind == 0 {
            break;
        }
        fields.insert(kind, read_cstr(&mut body)?);
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode<M: Outbound>(msg: &M) -> BytesMut {
        let mut buf = BytesMut::new();
        msg.write(&mut buf);
        buf
    }

    #[test]
    fn test_startup_frame() {
        let buf = encode(&Startup {
            user: "alice".to_string(),
            database: Some("app".to_string()),
            options: vec![("application_name".to_string(), "dbkit".to_string())],
        });
        let len = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(len as usize, buf.len());
        let version = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        assert_eq!(version, PROTOCOL_VERSION);
    }

    #[test]
    fn test_simple_query_frame() {
        let buf = encode(&SimpleQuery {
            sql: "SELECT 1".to_string(),
        });
        assert_eq!(buf[0], b'Q');
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        // Length covers itself plus the NUL-terminated query.
        assert_eq!(len, 4 + 8 + 1);
        assert_eq!(len as usize, buf.len() - 1);
    }

    #[test]
    fn test_parse_frame_carries_oids() {
        let buf = encode(&Parse {
            name: "_caq7".to_string(),
            sql: "SELECT $1".to_string(),
            param_oids: vec![Oid::INT8],
        });
        assert_eq!(buf[0], b'P');
        let tail = &buf[buf.len() - 6..];
        assert_eq!(i16::from_be_bytes([tail[0], tail[1]]), 1);
        assert_eq!(
            i32::from_be_bytes([tail[2], tail[3], tail[4], tail[5]]),
            Oid::INT8.as_i32()
        );
    }

    #[test]
    fn test_bind_encodes_null_and_binary_flags() {
        let buf = encode(&Bind {
            portal: String::new(),
            statement: "_caq0".to_string(),
            params: vec![
                BindParam {
                    data: Some(b"42".to_vec()),
                    format: Format::Text,
                },
                BindParam {
                    data: None,
                    format: Format::Binary,
                },
            ],
            result_format: Format::Text,
        });
        assert_eq!(buf[0], b'B');
        let s = buf.as_ref();
        // format codes: text then binary
        let formats_at = 1 + 4 + 1 + 6;
        assert_eq!(&s[formats_at..formats_at + 6], &[0, 2, 0, 0, 0, 1]);
        // first value length 2, then "42", then -1 for NULL
        let values_at = formats_at + 6 + 2;
        assert_eq!(&s[values_at..values_at + 6], &[0, 0, 0, 2, b'4', b'2']);
        assert_eq!(
            &s[values_at + 6..values_at + 10],
            &(-1i32).to_be_bytes()
        );
    }

    #[test]
    fn test_zero_body_frames() {
        assert_eq!(encode(&Sync).as_ref(), &[b'S', 0, 0, 0, 4]);
        assert_eq!(encode(&Terminate).as_ref(), &[b'X', 0, 0, 0, 4]);
        assert_eq!(encode(&CopyDone).as_ref(), &[b'c', 0, 0, 0, 4]);
    }

    #[test]
    fn test_copy_data_frame() {
        let buf = encode(&CopyData { data: b"a\tb\n" });
        assert_eq!(buf[0], b'd');
        assert_eq!(&buf[5..], b"a\tb\n");
    }

    #[test]
    fn test_decode_ready_for_query() {
        let mut data = Bytes::from_static(&[b'Z', 0, 0, 0, 5, b'T']);
        match Inbound::decode(&mut data).unwrap() {
            Inbound::ReadyForQuery { status } => {
                assert_eq!(status, TransactionStatus::InTransaction)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_data_row_with_null() {
        let mut frame = vec![b'D'];
        let mut body = Vec::new();
        body.extend_from_slice(&2i16.to_be_bytes());
        body.extend_from_slice(&2i32.to_be_bytes());
        body.extend_from_slice(b"42");
        body.extend_from_slice(&(-1i32).to_be_bytes());
        frame.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        frame.extend_from_slice(&body);

        let mut data = Bytes::from(frame);
        match Inbound::decode(&mut data).unwrap() {
            Inbound::DataRow { cells } => {
                assert_eq!(cells.len(), 2);
                assert_eq!(cells[0].as_deref(), Some(b"42".as_ref()));
                assert!(cells[1].is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_copy_in_response() {
        let mut frame = vec![b'G'];
        let body: &[u8] = &[0, 0, 2, 0, 0, 0, 0];
        frame.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        frame.extend_from_slice(body);

        let mut data = Bytes::from(frame);
        match Inbound::decode(&mut data).unwrap() {
            Inbound::CopyInResponse {
                overall_format,
                column_formats,
            } => {
                assert_eq!(overall_format, 0);
                assert_eq!(column_formats, vec![0, 0]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_error_fields() {
        let mut frame = vec![b'E'];
        let mut body = Vec::new();
        body.extend_from_slice(b"SERROR\0C23505\0Mduplicate key\0\0");
        frame.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
        frame.extend_from_slice(&body);

        let mut data = Bytes::from(frame);
        match Inbound::decode(&mut data).unwrap() {
            Inbound::ErrorResponse { fields } => {
                assert_eq!(fields.get(&b'C').map(String::as_str), Some("23505"));
                assert_eq!(fields.get(&b'S').map(String::as_str), Some("ERROR"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
