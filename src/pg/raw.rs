//! Low-level PostgreSQL client.
//!
//! This sits where a libpq binding would: it owns the socket, drives the
//! startup/authentication handshake, sends extended-protocol cycles, and
//! assembles server messages into discrete results. A result cycle is
//! consumed by calling [`RawConnection::get_result`] until it yields `None`.
//!
//! In single-row mode each data row is delivered as its own
//! [`ResultStatus::SingleTuple`] result, terminated by an empty
//! [`ResultStatus::TuplesOk`].

use std::collections::{BTreeMap, HashMap};

use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;

use super::error::{TransportError, TransportResult};
use super::protocol::{
    Bind, BindParam, CopyData, CopyDone, CopyFail, Describe, Execute, Format, Inbound, Outbound,
    Parse, Password, SaslInitial, SaslResponse, SimpleQuery, Startup, Sync, Terminate,
};
use super::scram::ScramFlow;
use super::types::Oid;
use crate::config::NoticeHandler;
use crate::driver::RawRow;
use crate::error::{Msg, ServerMsg};
use crate::request::Mult;

// ============================================================================
// Connect parameters
// ============================================================================

/// The connection address, extracted from the merged conninfo settings.
#[derive(Debug, Clone)]
pub(crate) struct ConnectSpec {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub dbname: Option<String>,
    pub application_name: String,
}

impl ConnectSpec {
    pub fn from_settings(
        settings: &BTreeMap<String, String>,
    ) -> std::result::Result<ConnectSpec, String> {
        // Multi-valued keys are CSV-joined; connecting uses the first entry.
        let first = |key: &str| {
            settings
                .get(key)
                .and_then(|v| v.split(',').next())
                .map(str::to_string)
        };
        let port = match first("port") {
            None => 5432,
            Some(p) => p.parse::<u16>().map_err(|_| format!("Invalid port: {}", p))?,
        };
        Ok(ConnectSpec {
            host: first("host").unwrap_or_else(|| "localhost".to_string()),
            port,
            user: first("user").unwrap_or_else(|| "postgres".to_string()),
            password: first("password"),
            dbname: first("dbname"),
            application_name: first("application_name")
                .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string()),
        })
    }
}

// ============================================================================
// Results
// ============================================================================

/// Classification of one assembled result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResultStatus {
    CommandOk,
    TuplesOk,
    SingleTuple,
    EmptyQuery,
    BadResponse,
    NonfatalError,
    FatalError,
    CopyIn,
    CopyOut,
    CopyBoth,
}

/// One result of a query cycle.
#[derive(Debug, Clone)]
pub(crate) struct RawResult {
    pub status: ResultStatus,
    pub rows: Vec<RawRow>,
    pub command_tag: String,
    pub error: Option<ServerMsg>,
}

impl RawResult {
    pub(crate) fn status_only(status: ResultStatus) -> RawResult {
        RawResult {
            status,
            rows: Vec::new(),
            command_tag: String::new(),
            error: None,
        }
    }

    pub fn ntuples(&self) -> usize {
        self.rows.len()
    }

    /// Affected-row count parsed from the command tag; 0 when the tag
    /// carries none.
    pub fn cmd_tuples(&self) -> u64 {
        let parts: Vec<&str> = self.command_tag.split_whitespace().collect();
        match parts.as_slice() {
            ["INSERT", _, n]
            | ["UPDATE", n]
            | ["DELETE", n]
            | ["SELECT", n]
            | ["COPY", n]
            | ["FETCH", n]
            | ["MOVE", n] => n.parse().unwrap_or(0),
            _ => 0,
        }
    }
}

fn server_msg_of_fields(fields: &HashMap<u8, String>) -> ServerMsg {
    ServerMsg {
        severity: fields.get(&b'S').cloned().unwrap_or_default(),
        sqlstate: fields.get(&b'C').cloned().unwrap_or_default(),
        message: fields.get(&b'M').cloned().unwrap_or_default(),
        detail: fields.get(&b'D').cloned(),
        hint: fields.get(&b'H').cloned(),
    }
}

// ============================================================================
// Result classification
// ============================================================================

/// What the dispatcher should do with a result.
#[derive(Debug, Clone)]
pub(crate) enum Verdict {
    Accept,
    /// The response violated the request contract.
    Reject(Msg),
    /// The request itself failed.
    Fail(Msg),
}

/// Check a result against the request's row multiplicity and delivery mode.
pub(crate) fn check_query_result(result: &RawResult, mult: Mult, single_row: bool) -> Verdict {
    let n = result.ntuples();
    match result.status {
        ResultStatus::CommandOk => match mult {
            Mult::Zero => Verdict::Accept,
            _ => Verdict::Reject(Msg::plain("Tuples expected.")),
        },
        ResultStatus::TuplesOk if single_row => {
            if n == 0 {
                Verdict::Accept
            } else {
                Verdict::Reject(Msg::plain(format!(
                    "Received {} tuples where single-row delivery was requested.",
                    n
                )))
            }
        }
        ResultStatus::TuplesOk => match mult {
            Mult::Zero if n == 0 => Verdict::Accept,
            Mult::Zero => Verdict::Reject(Msg::plain(format!(
                "Received {} tuples, expected none.",
                n
            ))),
            Mult::One if n == 1 => Verdict::Accept,
            Mult::One => Verdict::Reject(Msg::plain(format!(
                "Received {} tuples, expected one.",
                n
            ))),
            Mult::ZeroOrOne if n <= 1 => Verdict::Accept,
            Mult::ZeroOrOne => Verdict::Reject(Msg::plain(format!(
                "Received {} tuples, expected at most one.",
                n
            ))),
            Mult::ZeroOrMore => Verdict::Accept,
        },
        ResultStatus::SingleTuple => {
            if single_row && n == 1 {
                Verdict::Accept
            } else {
                Verdict::Reject(Msg::plain("Unexpected single-tuple response."))
            }
        }
        ResultStatus::EmptyQuery => Verdict::Fail(Msg::plain("The query was empty.")),
        ResultStatus::BadResponse => Verdict::Reject(result_msg(result, "Bad response.")),
        ResultStatus::FatalError => Verdict::Fail(result_msg(result, "Fatal error.")),
        // Warnings pass; the notice handler has already seen the details.
        ResultStatus::NonfatalError => Verdict::Accept,
        ResultStatus::CopyIn | ResultStatus::CopyOut | ResultStatus::CopyBoth => {
            Verdict::Reject(Msg::plain("Unexpected copy response."))
        }
    }
}

fn result_msg(result: &RawResult, fallback: &str) -> Msg {
    match &result.error {
        Some(m) => Msg::Result(m.clone()),
        None => Msg::plain(fallback),
    }
}

// ============================================================================
// Raw connection
// ============================================================================

pub(crate) struct RawConnection {
    reader: BufReader<tokio::io::ReadHalf<TcpStream>>,
    writer: BufWriter<tokio::io::WriteHalf<TcpStream>>,
    read_buffer: BytesMut,
    parameters: HashMap<String, String>,
    backend_pid: i32,
    closed: bool,
    notice: Option<NoticeHandler>,
    // State of the result cycle in flight.
    single_row: bool,
    cycle_done: bool,
    prepare_cycle: bool,
    // True between the row description and the end of a tuple-bearing
    // result; persists across the per-row returns of single-row mode.
    tuples_in_progress: bool,
}

impl RawConnection {
    /// Open a connection and run the startup/authentication handshake.
    pub async fn connect(
        spec: &ConnectSpec,
        notice: Option<NoticeHandler>,
    ) -> TransportResult<RawConnection> {
        let addr = format!("{}:{}", spec.host, spec.port);
        let stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = tokio::io::split(stream);

        let mut conn = RawConnection {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            read_buffer: BytesMut::with_capacity(32 * 1024),
            parameters: HashMap::new(),
            backend_pid: 0,
            closed: false,
            notice,
            single_row: false,
            cycle_done: true,
            prepare_cycle: false,
            tuples_in_progress: false,
        };
        conn.startup(spec).await?;
        Ok(conn)
    }

    async fn startup(&mut self, spec: &ConnectSpec) -> TransportResult<()> {
        self.send(&Startup {
            user: spec.user.clone(),
            database: spec.dbname.clone(),
            options: vec![(
                "application_name".to_string(),
                spec.application_name.clone(),
            )],
        })
        .await?;

        loop {
            match self.receive().await? {
                Inbound::AuthenticationOk => {}
                Inbound::AuthenticationCleartextPassword => {
                    let password = required_password(spec)?;
                    self.send(&Password {
                        password: password.to_string(),
                    })
                    .await?;
                }
                Inbound::AuthenticationMd5Password { salt } => {
                    let password = required_password(spec)?;
                    self.send(&Password {
                        password: md5_password(&spec.user, password, &salt),
                    })
                    .await?;
                }
                Inbound::AuthenticationSasl { mechanisms } => {
                    if !mechanisms.iter().any(|m| m == "SCRAM-SHA-256") {
                        return Err(TransportError::Auth(format!(
                            "no supported SASL mechanism among {:?}",
                            mechanisms
                        )));
                    }
                    let password = required_password(spec)?.to_string();
                    self.sasl_handshake(&spec.user, &password).await?;
                }
                Inbound::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                Inbound::BackendKeyData { process_id, .. } => {
                    self.backend_pid = process_id;
                }
                Inbound::NoticeResponse { fields } => self.dispatch_notice(&fields),
                Inbound::ReadyForQuery { .. } => return Ok(()),
                Inbound::ErrorResponse { fields } => {
                    return Err(TransportError::Server(server_msg_of_fields(&fields)));
                }
                _ => {}
            }
        }
    }

    async fn sasl_handshake(&mut self, user: &str, password: &str) -> TransportResult<()> {
        let mut flow = ScramFlow::new(user, password);
        self.send(&SaslInitial {
            mechanism: "SCRAM-SHA-256".to_string(),
            data: flow.first_message(),
        })
        .await?;

        loop {
            match self.receive().await? {
                Inbound::AuthenticationSaslContinue { data } => {
                    let reply = flow.continue_with(&data).map_err(TransportError::Auth)?;
                    self.send(&SaslResponse { data: reply }).await?;
                }
                Inbound::AuthenticationSaslFinal { data } => {
                    flow.finish(&data).map_err(TransportError::Auth)?;
                    return Ok(());
                }
                Inbound::ErrorResponse { fields } => {
                    return Err(TransportError::Server(server_msg_of_fields(&fields)));
                }
                Inbound::NoticeResponse { fields } => self.dispatch_notice(&fields),
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Connection state
    // ------------------------------------------------------------------

    pub fn status_ok(&self) -> bool {
        !self.closed
    }

    /// Whether a result cycle is still open on the wire. A pending cycle at
    /// the start of a request means the previous one was abandoned.
    pub fn cycle_pending(&self) -> bool {
        !self.cycle_done
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    fn begin_cycle(&mut self, single_row: bool) {
        self.cycle_done = false;
        self.single_row = single_row;
        self.prepare_cycle = false;
        self.tuples_in_progress = false;
    }

    /// Send `PREPARE`-equivalent: Parse with explicit parameter OIDs.
    pub async fn send_prepare(
        &mut self,
        name: &str,
        sql: &str,
        param_oids: &[Oid],
    ) -> TransportResult<()> {
        self.begin_cycle(false);
        self.prepare_cycle = true;
        let mut buf = BytesMut::new();
        Parse {
            name: name.to_string(),
            sql: sql.to_string(),
            param_oids: param_oids.to_vec(),
        }
        .write(&mut buf);
        Sync.write(&mut buf);
        self.write_all(&buf).await
    }

    /// Execute a previously prepared statement.
    pub async fn send_query_prepared(
        &mut self,
        name: &str,
        params: Vec<BindParam>,
        single_row: bool,
    ) -> TransportResult<()> {
        self.begin_cycle(single_row);
        let mut buf = BytesMut::new();
        Bind {
            portal: String::new(),
            statement: name.to_string(),
            params,
            result_format: Format::Text,
        }
        .write(&mut buf);
        Describe {
            target: b'P',
            name: String::new(),
        }
        .write(&mut buf);
        Execute {
            portal: String::new(),
            max_rows: 0,
        }
        .write(&mut buf);
        Sync.write(&mut buf);
        self.write_all(&buf).await
    }

    /// One-shot parameterised query through the unnamed statement.
    pub async fn send_query_params(
        &mut self,
        sql: &str,
        param_oids: &[Oid],
        params: Vec<BindParam>,
        single_row: bool,
    ) -> TransportResult<()> {
        self.begin_cycle(single_row);
        let mut buf = BytesMut::new();
        Parse {
            name: String::new(),
            sql: sql.to_string(),
            param_oids: param_oids.to_vec(),
        }
        .write(&mut buf);
        Bind {
            portal: String::new(),
            statement: String::new(),
            params,
            result_format: Format::Text,
        }
        .write(&mut buf);
        Describe {
            target: b'P',
            name: String::new(),
        }
        .write(&mut buf);
        Execute {
            portal: String::new(),
            max_rows: 0,
        }
        .write(&mut buf);
        Sync.write(&mut buf);
        self.write_all(&buf).await
    }

    /// Simple query protocol; used for COPY and parameterless statements
    /// whose text is fixed.
    pub async fn send_simple(&mut self, sql: &str) -> TransportResult<()> {
        self.begin_cycle(false);
        let mut buf = BytesMut::new();
        SimpleQuery {
            sql: sql.to_string(),
        }
        .write(&mut buf);
        self.write_all(&buf).await
    }

    // ------------------------------------------------------------------
    // COPY FROM STDIN
    // ------------------------------------------------------------------

    pub async fn put_copy_data(&mut self, data: &[u8]) -> TransportResult<()> {
        let mut buf = BytesMut::new();
        CopyData { data }.write(&mut buf);
        // Buffered; flushed by put_copy_end or the next full send.
        self.write_buffered(&buf).await
    }

    pub async fn put_copy_end(&mut self) -> TransportResult<()> {
        let mut buf = BytesMut::new();
        CopyDone.write(&mut buf);
        self.write_all(&buf).await
    }

    pub async fn put_copy_fail(&mut self, message: &str) -> TransportResult<()> {
        let mut buf = BytesMut::new();
        CopyFail {
            message: message.to_string(),
        }
        .write(&mut buf);
        self.write_all(&buf).await
    }

    // ------------------------------------------------------------------
    // Result assembly
    // ------------------------------------------------------------------

    /// Pull the next result of the current cycle, or `None` once the server
    /// reports readiness for the next cycle.
    pub async fn get_result(&mut self) -> TransportResult<Option<RawResult>> {
        if self.cycle_done {
            return Ok(None);
        }

        let mut saw_description = self.tuples_in_progress;
        let mut rows: Vec<RawRow> = Vec::new();

        loop {
            match self.receive().await? {
                Inbound::ParseComplete => {
                    // A Parse-only cycle has no CommandComplete; the
                    // acknowledgement itself is the result.
                    if self.prepare_cycle {
                        return Ok(Some(RawResult::status_only(ResultStatus::CommandOk)));
                    }
                }
                Inbound::BindComplete
                | Inbound::CloseComplete
                | Inbound::NoData
                | Inbound::PortalSuspended => {}
                Inbound::RowDescription { .. } => {
                    saw_description = true;
                }
                Inbound::DataRow { cells } => {
                    let row = row_of_cells(cells);
                    if self.single_row {
                        self.tuples_in_progress = true;
                        return Ok(Some(RawResult {
                            status: ResultStatus::SingleTuple,
                            rows: vec![row],
                            command_tag: String::new(),
                            error: None,
                        }));
                    }
                    rows.push(row);
                }
                Inbound::CommandComplete { tag } => {
                    self.tuples_in_progress = false;
                    let status = if saw_description && self.single_row {
                        // Terminating empty result of a single-row cycle.
                        rows.clear();
                        ResultStatus::TuplesOk
                    } else if saw_description {
                        ResultStatus::TuplesOk
                    } else {
                        ResultStatus::CommandOk
                    };
                    return Ok(Some(RawResult {
                        status,
                        rows,
                        command_tag: tag,
                        error: None,
                    }));
                }
                Inbound::EmptyQueryResponse => {
                    return Ok(Some(RawResult::status_only(ResultStatus::EmptyQuery)));
                }
                Inbound::ErrorResponse { fields } => {
                    let mut result = RawResult::status_only(ResultStatus::FatalError);
                    result.error = Some(server_msg_of_fields(&fields));
                    return Ok(Some(result));
                }
                Inbound::CopyInResponse { .. } => {
                    return Ok(Some(RawResult::status_only(ResultStatus::CopyIn)));
                }
                Inbound::CopyOutResponse { .. } => {
                    return Ok(Some(RawResult::status_only(ResultStatus::CopyOut)));
                }
                Inbound::CopyBothResponse { .. } => {
                    return Ok(Some(RawResult::status_only(ResultStatus::CopyBoth)));
                }
                // We never initiate COPY TO; absorb stray copy-out data.
                Inbound::CopyDataOut { .. } | Inbound::CopyDoneOut => {}
                Inbound::NoticeResponse { fields } => self.dispatch_notice(&fields),
                Inbound::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                Inbound::NotificationResponse { .. } => {}
                Inbound::BackendKeyData { process_id, .. } => {
                    self.backend_pid = process_id;
                }
                Inbound::ReadyForQuery { .. } => {
                    self.cycle_done = true;
                    return Ok(None);
                }
                other @ (Inbound::AuthenticationOk
                | Inbound::AuthenticationCleartextPassword
                | Inbound::AuthenticationMd5Password { .. }
                | Inbound::AuthenticationSasl { .. }
                | Inbound::AuthenticationSaslContinue { .. }
                | Inbound::AuthenticationSaslFinal { .. }
                | Inbound::ParameterDescription { .. }) => {
                    return Err(TransportError::Protocol(format!(
                        "unexpected message {:?} during a query cycle",
                        other
                    )));
                }
            }
        }
    }

    /// Close the connection gracefully.
    pub async fn close(&mut self) -> TransportResult<()> {
        if self.closed {
            return Ok(());
        }
        let mut buf = BytesMut::new();
        Terminate.write(&mut buf);
        let outcome = self.write_all(&buf).await;
        self.closed = true;
        outcome
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn dispatch_notice(&self, fields: &HashMap<u8, String>) {
        let msg = server_msg_of_fields(fields).to_string();
        match &self.notice {
            Some(handler) => handler(&msg),
            None => tracing::warn!(target: "dbkit::pg", "server notice: {}", msg),
        }
    }

    async fn send<M: Outbound>(&mut self, msg: &M) -> TransportResult<()> {
        let mut buf = BytesMut::new();
        msg.write(&mut buf);
        self.write_all(&buf).await
    }

    async fn write_all(&mut self, buf: &[u8]) -> TransportResult<()> {
        self.write_buffered(buf).await?;
        if let Err(e) = self.writer.flush().await {
            self.closed = true;
            return Err(e.into());
        }
        Ok(())
    }

    async fn write_buffered(&mut self, buf: &[u8]) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        if let Err(e) = self.writer.write_all(buf).await {
            self.closed = true;
            return Err(e.into());
        }
        Ok(())
    }

    async fn receive(&mut self) -> TransportResult<Inbound> {
        loop {
            if self.read_buffer.len() >= 5 {
                let len = i32::from_be_bytes([
                    self.read_buffer[1],
                    self.read_buffer[2],
                    self.read_buffer[3],
                    self.read_buffer[4],
                ]) as usize;
                let total = 1 + len;
                if self.read_buffer.len() >= total {
                    let mut frame = self.read_buffer.split_to(total).freeze();
                    return Inbound::decode(&mut frame);
                }
            }

            if self.closed {
                return Err(TransportError::Closed);
            }
            let mut chunk = [0u8; 4096];
            let n = match self.reader.read(&mut chunk).await {
                Ok(n) => n,
                Err(e) => {
                    self.closed = true;
                    return Err(e.into());
                }
            };
            if n == 0 {
                self.closed = true;
                return Err(TransportError::Closed);
            }
            self.read_buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

fn row_of_cells(cells: Vec<Option<Bytes>>) -> RawRow {
    let mut row: RawRow = SmallVec::with_capacity(cells.len());
    for cell in cells {
        row.push(cell.map(|b| String::from_utf8_lossy(&b).into_owned()));
    }
    row
}

fn required_password(spec: &ConnectSpec) -> TransportResult<&str> {
    spec.password
        .as_deref()
        .ok_or_else(|| TransportError::Auth("password required".to_string()))
}

/// MD5 password response: `md5(md5(password + user) + salt)`.
fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, user).as_bytes());
    let mut outer_input = format!("{:x}", inner).into_bytes();
    outer_input.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&outer_input))
}
