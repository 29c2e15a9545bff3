//! PostgreSQL connection: request dispatch and statement management.
//!
//! One [`PgConnection`] serialises all requests issued through it. The
//! request pipeline resolves enum OIDs, prepares or reuses a server-side
//! statement, encodes the parameter tuple, sends the query, and classifies
//! the response. Transport failures outside a transaction are healed by one
//! transparent reconnect-and-retry.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use once_cell::sync::Lazy;
use tracing::{debug, warn};

use super::error::TransportError;
use super::protocol::{BindParam, Format};
use super::raw::{
    check_query_result, ConnectSpec, RawConnection, RawResult, ResultStatus, Verdict,
};
use super::types::{self, CodecError, Oid};
use crate::config::{Config, EnvFn, NoticeHandler};
use crate::driver::{Connection, DecodeRowFn, DriverInfo, Response, RowStream};
use crate::error::{Error, Msg, Result};
use crate::request::{Mult, QueryTemplate, Request};
use crate::types::{FieldType, Type, Value};

// Fixed requests used by the connection itself.
static BEGIN: Lazy<Request> =
    Lazy::new(|| Request::oneshot_sql("BEGIN", Type::Unit, Type::Unit, Mult::Zero));
static COMMIT: Lazy<Request> =
    Lazy::new(|| Request::oneshot_sql("COMMIT", Type::Unit, Type::Unit, Mult::Zero));
static ROLLBACK: Lazy<Request> =
    Lazy::new(|| Request::oneshot_sql("ROLLBACK", Type::Unit, Type::Unit, Mult::Zero));

/// Catalog lookup backing enum OID resolution.
static OID_PROBE: Lazy<Request> = Lazy::new(|| {
    Request::oneshot(
        Type::Field(FieldType::Text),
        Type::Field(FieldType::Int64),
        Mult::ZeroOrOne,
        |_| {
            QueryTemplate::seq(vec![
                QueryTemplate::lit("SELECT oid FROM pg_catalog.pg_type WHERE typname = "),
                QueryTemplate::Param(0),
            ])
        },
    )
});

/// A server-side prepared statement owned by this connection.
#[derive(Debug, Clone)]
struct PreparedEntry {
    name: String,
    sql: String,
    param_oids: Vec<Oid>,
    binary: Vec<bool>,
    single_row: bool,
}

/// Outcome of the send phase of a request.
struct Issued {
    sql: String,
    single_row: bool,
}

enum RequestOutcome {
    Complete(Response<'static>),
    Streaming(Issued),
}

pub struct PgConnection {
    raw: RawConnection,
    spec: ConnectSpec,
    uri: String,
    info: &'static DriverInfo,
    prepared: HashMap<u64, PreparedEntry>,
    type_oids: HashMap<String, Oid>,
    env: Option<EnvFn>,
    notice: Option<NoticeHandler>,
    use_single_row_mode: bool,
    in_use: bool,
    in_transaction: bool,
}

impl PgConnection {
    pub(crate) async fn open(
        config: &Config,
        uri: &str,
        info: &'static DriverInfo,
    ) -> Result<PgConnection> {
        let reject = |m: String| Error::ConnectFailed {
            uri: uri.to_string(),
            message: Msg::plain(m),
        };
        let settings = config.merged_settings(uri).map_err(reject)?;
        let spec = ConnectSpec::from_settings(&settings).map_err(reject)?;

        let notice = config.notice_handler();
        let raw = RawConnection::connect(&spec, notice.clone())
            .await
            .map_err(|e| Error::ConnectFailed {
                uri: uri.to_string(),
                message: e.into_msg(),
            })?;

        let mut conn = PgConnection {
            raw,
            spec,
            uri: uri.to_string(),
            info,
            prepared: HashMap::new(),
            type_oids: HashMap::new(),
            env: config.template_env(),
            notice,
            use_single_row_mode: config.single_row_mode(),
            in_use: false,
            in_transaction: false,
        };
        conn.session_setup().await.map_err(|e| Error::PostConnect {
            uri: conn.uri.clone(),
            source: Box::new(e),
        })?;
        Ok(conn)
    }

    /// Session defaults issued right after authentication.
    async fn session_setup(&mut self) -> Result<()> {
        self.simple_command("SET TimeZone TO 'UTC'").await
    }

    /// A startup parameter reported by the server, e.g. `server_version`.
    pub fn server_parameter(&self, name: &str) -> Option<&str> {
        self.raw.parameter(name)
    }

    /// Process ID of the server backend serving this connection.
    pub fn backend_pid(&self) -> i32 {
        self.raw.backend_pid()
    }

    // ------------------------------------------------------------------
    // Mutual exclusion
    // ------------------------------------------------------------------

    fn begin_use(&mut self) {
        // Interleaved requests on one connection are a programming error;
        // fail loudly rather than serialise.
        assert!(
            !self.in_use,
            "connection to {} used concurrently",
            self.uri
        );
        self.in_use = true;
    }

    fn end_use(&mut self) {
        self.in_use = false;
    }

    // ------------------------------------------------------------------
    // Error shaping
    // ------------------------------------------------------------------

    fn request_error(&self, query: &str, e: TransportError) -> Error {
        Error::RequestFailed {
            uri: self.uri.clone(),
            query: query.to_string(),
            message: e.into_msg(),
        }
    }

    fn encode_error(&self, query: &str, e: CodecError) -> Error {
        match e {
            CodecError::Missing { type_name } => Error::EncodeMissing {
                uri: self.uri.clone(),
                query: query.to_string(),
                type_name,
            },
            CodecError::Rejected { type_name, message } => Error::EncodeRejected {
                uri: self.uri.clone(),
                query: query.to_string(),
                type_name,
                message,
            },
        }
    }

    // ------------------------------------------------------------------
    // Result plumbing (over the raw fetchers)
    // ------------------------------------------------------------------

    async fn fetch_one_result(&mut self, query: &str) -> Result<RawResult> {
        match self
            .raw
            .get_result()
            .await
            .map_err(|e| self.request_error(query, e))?
        {
            Some(result) => Ok(result),
            None => Err(Error::RequestFailed {
                uri: self.uri.clone(),
                query: query.to_string(),
                message: Msg::plain("No response received after send."),
            }),
        }
    }

    async fn fetch_final_result(&mut self, query: &str) -> Result<RawResult> {
        let first = self.fetch_one_result(query).await?;
        match self
            .raw
            .get_result()
            .await
            .map_err(|e| self.request_error(query, e))?
        {
            None => Ok(first),
            Some(_) => Err(Error::ResponseRejected {
                uri: self.uri.clone(),
                query: query.to_string(),
                message: Msg::plain("More than one response received."),
            }),
        }
    }

    fn classify(
        &self,
        query: &str,
        result: &RawResult,
        mult: Mult,
        single_row: bool,
    ) -> Result<()> {
        match check_query_result(result, mult, single_row) {
            Verdict::Accept => Ok(()),
            Verdict::Reject(message) => Err(Error::ResponseRejected {
                uri: self.uri.clone(),
                query: query.to_string(),
                message,
            }),
            Verdict::Fail(message) => Err(Error::RequestFailed {
                uri: self.uri.clone(),
                query: query.to_string(),
                message,
            }),
        }
    }

    /// Send a fixed command through the simple protocol and expect a plain
    /// command acknowledgement.
    async fn simple_command(&mut self, sql: &str) -> Result<()> {
        self.raw
            .send_simple(sql)
            .await
            .map_err(|e| self.request_error(sql, e))?;
        let result = self.fetch_final_result(sql).await?;
        self.classify(sql, &result, Mult::Zero, false)
    }

    // ------------------------------------------------------------------
    // Reset and retry
    // ------------------------------------------------------------------

    /// Re-establish the connection. Server-side statements are gone with the
    /// old session, so the statement cache is dropped; cached enum OIDs stay
    /// valid for the same database.
    async fn reset(&mut self) -> Result<()> {
        debug!(target: "dbkit::pg", uri = %self.uri, "resetting connection");
        let raw = RawConnection::connect(&self.spec, self.notice.clone())
            .await
            .map_err(|e| Error::ConnectFailed {
                uri: self.uri.clone(),
                message: e.into_msg(),
            })?;
        self.raw = raw;
        self.prepared.clear();
        self.in_transaction = false;
        self.session_setup().await.map_err(|e| Error::PostConnect {
            uri: self.uri.clone(),
            source: Box::new(e),
        })
    }

    /// Run one request with reconnect-once semantics: a lost connection is
    /// healed by a single reset-and-retry. Inside a transaction a lost
    /// connection means lost session state, so the error surfaces instead.
    /// Single-row requests return right after the send; their response is
    /// pulled by the streaming source.
    async fn run_request(&mut self, req: &Request, params: &Value) -> Result<RequestOutcome> {
        // An abandoned result cycle (e.g. a dropped row stream) poisons the
        // connection; start from a fresh one.
        if self.raw.cycle_pending() || !self.raw.status_ok() {
            self.reset().await?;
        }

        let mut retried = false;
        loop {
            let e = match self.try_issue(req, params).await {
                Ok(issued) if issued.single_row => return Ok(RequestOutcome::Streaming(issued)),
                Ok(issued) => match self.finalize(req, &issued).await {
                    Ok(response) => return Ok(RequestOutcome::Complete(response)),
                    Err(e) => e,
                },
                Err(e) => e,
            };
            if !retried && !self.in_transaction && e.is_connection_failure() {
                debug!(target: "dbkit::pg", uri = %self.uri, error = %e, "retrying after reconnect");
                self.reset().await?;
                retried = true;
            } else {
                return Err(e);
            }
        }
    }

    // ------------------------------------------------------------------
    // The request pipeline
    // ------------------------------------------------------------------

    fn render(&self, req: &Request) -> Result<String> {
        let template = req.query(self.info);
        let fail = |m: String| Error::RequestFailed {
            uri: self.uri.clone(),
            query: String::new(),
            message: Msg::plain(m),
        };
        let expanded = match &self.env {
            Some(env) => template.expand(self.info, &|i, n| env(i, n), true),
            None => template.expand(self.info, &|_, _| None, true),
        }
        .map_err(fail)?;
        expanded.to_sql().map_err(fail)
    }

    fn param_layout(&self, sql: &str, ty: &Type) -> Result<(Vec<Oid>, Vec<bool>)> {
        let width = ty.length();
        let mut oids = vec![Oid(0); width];
        let mut binary = vec![false; width];
        types::init_param_types(&mut oids, &mut binary, ty, &self.type_oids)
            .map_err(|e| self.encode_error(sql, e))?;
        Ok((oids, binary))
    }

    fn encode_cells(&self, sql: &str, ty: &Type, params: &Value) -> Result<Vec<Option<Vec<u8>>>> {
        let mut cells = Vec::with_capacity(ty.length());
        types::encode_params(ty, params, false, &mut cells)
            .map_err(|e| self.encode_error(sql, e))?;
        Ok(cells)
    }

    async fn try_issue(&mut self, req: &Request, params: &Value) -> Result<Issued> {
        let cached = req.id().and_then(|id| self.prepared.get(&id).cloned());
        let sql = match &cached {
            Some(entry) => entry.sql.clone(),
            None => self.render(req)?,
        };

        self.probe_enum_oids(req.param_type(), &sql).await?;

        let single_row_wanted = req.row_mult().can_be_many() && self.use_single_row_mode;

        match req.id() {
            Some(id) => {
                let entry = match cached {
                    Some(entry) => entry,
                    None => self.prepare_statement(id, sql, req, single_row_wanted).await?,
                };
                let cells = self.encode_cells(&entry.sql, req.param_type(), params)?;
                if cells.len() != entry.param_oids.len() {
                    return Err(Error::EncodeRejected {
                        uri: self.uri.clone(),
                        query: entry.sql.clone(),
                        type_name: req.param_type().to_string(),
                        message: format!(
                            "encoded {} parameters, statement takes {}",
                            cells.len(),
                            entry.param_oids.len()
                        ),
                    });
                }
                let bind = bind_params(cells, &entry.binary);
                self.raw
                    .send_query_prepared(&entry.name, bind, entry.single_row)
                    .await
                    .map_err(|e| self.request_error(&entry.sql, e))?;
                Ok(Issued {
                    sql: entry.sql,
                    single_row: entry.single_row,
                })
            }
            None => {
                let (oids, binary) = self.param_layout(&sql, req.param_type())?;
                let cells = self.encode_cells(&sql, req.param_type(), params)?;
                let bind = bind_params(cells, &binary);
                self.raw
                    .send_query_params(&sql, &oids, bind, single_row_wanted)
                    .await
                    .map_err(|e| self.request_error(&sql, e))?;
                Ok(Issued {
                    sql,
                    single_row: single_row_wanted,
                })
            }
        }
    }

    /// PREPARE on first use. The entry is cached only after the server has
    /// accepted the statement, so a failed prepare is retried on the next
    /// call.
    async fn prepare_statement(
        &mut self,
        id: u64,
        sql: String,
        req: &Request,
        single_row: bool,
    ) -> Result<PreparedEntry> {
        let (param_oids, binary) = self.param_layout(&sql, req.param_type())?;
        let name = format!("_caq{}", id);
        self.raw
            .send_prepare(&name, &sql, &param_oids)
            .await
            .map_err(|e| self.request_error(&sql, e))?;
        let result = self.fetch_final_result(&sql).await?;
        self.classify(&sql, &result, Mult::Zero, false)?;

        let entry = PreparedEntry {
            name,
            sql,
            param_oids,
            binary,
            single_row,
        };
        self.prepared.insert(id, entry.clone());
        Ok(entry)
    }

    /// Await and classify the response of a fully buffered request.
    async fn finalize(&mut self, req: &Request, issued: &Issued) -> Result<Response<'static>> {
        let result = self.fetch_final_result(&issued.sql).await?;
        self.classify(&issued.sql, &result, req.row_mult(), false)?;

        let decode = row_decoder(self.uri.clone(), issued.sql.clone(), req.row_type().clone());
        let cmd_tuples = result.cmd_tuples();
        Ok(Response::complete(
            self.uri.clone(),
            issued.sql.clone(),
            result.rows,
            cmd_tuples,
            decode,
        ))
    }

    // ------------------------------------------------------------------
    // Enum OID probing
    // ------------------------------------------------------------------

    /// Resolve all enum names of the descriptor through the catalog, caching
    /// per connection. Any probe failure degrades to a missing-encoder error
    /// for the affected type.
    async fn probe_enum_oids(&mut self, param_type: &Type, query_ctx: &str) -> Result<()> {
        let mut names = Vec::new();
        param_type.enum_names(&mut names);
        names.sort();
        names.dedup();
        names.retain(|n| !self.type_oids.contains_key(n));

        for name in names {
            let probed = self.probe_one(&name).await;
            match probed {
                Ok(Some(oid)) => {
                    self.type_oids.insert(name, oid);
                    continue;
                }
                Ok(None) => {
                    warn!(target: "dbkit::pg", "no pg_type entry for enum {:?}", name)
                }
                Err(e) => {
                    warn!(target: "dbkit::pg", "enum OID lookup for {:?} failed: {}", name, e)
                }
            }
            return Err(Error::EncodeMissing {
                uri: self.uri.clone(),
                query: query_ctx.to_string(),
                type_name: FieldType::Enum(name).to_string(),
            });
        }
        Ok(())
    }

    /// One catalog round trip through the regular request pipeline. Boxed:
    /// the pipeline recurses into the probe, so the future must be erased.
    fn probe_one<'s>(&'s mut self, name: &'s str) -> BoxFuture<'s, Result<Option<Oid>>> {
        Box::pin(async move {
            let issued = self.try_issue(&OID_PROBE, &Value::text(name)).await?;
            let response = self.finalize(&OID_PROBE, &issued).await?;
            match response.find_opt().await? {
                Some(Value::Int64(oid)) => Ok(Some(Oid::from_i32(oid as i32))),
                Some(_) | None => Ok(None),
            }
        })
    }

    // ------------------------------------------------------------------
    // COPY FROM STDIN
    // ------------------------------------------------------------------

    async fn populate_inner(
        &mut self,
        table: &str,
        columns: &[String],
        row_type: &Type,
        mut rows: BoxStream<'_, Result<Value>>,
    ) -> Result<()> {
        if self.raw.cycle_pending() || !self.raw.status_ok() {
            self.reset().await?;
        }

        let mut sql = format!("COPY {}", quote_ident(table));
        if !columns.is_empty() {
            let cols: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
            sql.push_str(&format!(" ({})", cols.join(", ")));
        }
        sql.push_str(" FROM STDIN");

        self.raw
            .send_simple(&sql)
            .await
            .map_err(|e| self.request_error(&sql, e))?;
        let opening = self.fetch_one_result(&sql).await?;
        match opening.status {
            ResultStatus::CopyIn => {}
            _ => {
                self.classify(&sql, &opening, Mult::Zero, false)?;
                return Err(Error::ResponseRejected {
                    uri: self.uri.clone(),
                    query: sql,
                    message: Msg::plain("Expected a copy response."),
                });
            }
        }

        while let Some(item) = rows.next().await {
            let line = match item.and_then(|value| {
                copy_line(row_type, &value).map_err(|e| self.encode_error(&sql, e))
            }) {
                Ok(line) => line,
                Err(e) => {
                    // Abort the copy so the connection comes back to a
                    // usable state, then surface the original error.
                    let _ = self.raw.put_copy_fail("aborted by client").await;
                    let _ = self.fetch_final_result(&sql).await;
                    return Err(e);
                }
            };
            self.raw
                .put_copy_data(&line)
                .await
                .map_err(|e| self.request_error(&sql, e))?;
        }

        self.raw
            .put_copy_end()
            .await
            .map_err(|e| self.request_error(&sql, e))?;
        let result = self.fetch_final_result(&sql).await?;
        self.classify(&sql, &result, Mult::Zero, false)
    }
}

// ============================================================================
// Connection trait
// ============================================================================

#[async_trait]
impl Connection for PgConnection {
    fn driver_info(&self) -> &'static DriverInfo {
        self.info
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    async fn call<'c>(&'c mut self, req: &Request, params: Value) -> Result<Response<'c>> {
        self.begin_use();
        let outcome = self.run_request(req, &params).await;
        self.end_use();

        match outcome? {
            RequestOutcome::Complete(response) => Ok(response),
            RequestOutcome::Streaming(issued) => {
                let uri = self.uri.clone();
                let row_type = req.row_type().clone();
                let source = SingleRowSource {
                    row_type,
                    uri: uri.clone(),
                    query: issued.sql.clone(),
                    finished: false,
                    conn: self,
                };
                Ok(Response::streaming(uri, issued.sql, Box::new(source)))
            }
        }
    }

    async fn deallocate(&mut self, req: &Request) -> Result<()> {
        let Some(id) = req.id() else {
            return Err(Error::Unsupported);
        };
        if let Some(entry) = self.prepared.get(&id).cloned() {
            let drop_req = Request::oneshot_sql(
                format!("DEALLOCATE {}", entry.name),
                Type::Unit,
                Type::Unit,
                Mult::Zero,
            );
            self.call(&drop_req, Value::Unit).await?.exec()?;
            self.prepared.remove(&id);
        }
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        self.call(&BEGIN, Value::Unit).await?.exec()?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let outcome = match self.call(&COMMIT, Value::Unit).await {
            Ok(response) => response.exec(),
            Err(e) => Err(e),
        };
        // The transaction is over either way.
        self.in_transaction = false;
        outcome
    }

    async fn rollback(&mut self) -> Result<()> {
        let outcome = match self.call(&ROLLBACK, Value::Unit).await {
            Ok(response) => response.exec(),
            Err(e) => Err(e),
        };
        self.in_transaction = false;
        outcome
    }

    async fn set_statement_timeout(&mut self, seconds: Option<f64>) -> Result<()> {
        let ms = statement_timeout_ms(seconds);
        let req = Request::oneshot_sql(
            format!("SET statement_timeout TO {}", ms),
            Type::Unit,
            Type::Unit,
            Mult::Zero,
        );
        self.call(&req, Value::Unit).await?.exec()
    }

    async fn populate(
        &mut self,
        table: &str,
        columns: &[String],
        row_type: &Type,
        rows: BoxStream<'_, Result<Value>>,
    ) -> Result<()> {
        self.begin_use();
        let outcome = self.populate_inner(table, columns, row_type, rows).await;
        self.end_use();
        outcome
    }

    async fn validate(&mut self) -> bool {
        if self.raw.status_ok() {
            true
        } else {
            self.reset().await.is_ok()
        }
    }

    fn check(&self) -> bool {
        self.raw.status_ok()
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn disconnect(&mut self) {
        if let Err(e) = self.raw.close().await {
            warn!(target: "dbkit::pg", uri = %self.uri, "error while disconnecting: {}", e);
        }
    }
}

// ============================================================================
// Single-row streaming
// ============================================================================

/// Pulls rows of a single-row-mode cycle off the connection one at a time.
struct SingleRowSource<'c> {
    conn: &'c mut PgConnection,
    row_type: Type,
    uri: String,
    query: String,
    finished: bool,
}

#[async_trait]
impl RowStream for SingleRowSource<'_> {
    async fn fetch_next(&mut self) -> Result<Option<Value>> {
        if self.finished {
            return Ok(None);
        }
        loop {
            let result = match self.conn.raw.get_result().await {
                Err(e) => {
                    self.finished = true;
                    return Err(self.conn.request_error(&self.query, e));
                }
                Ok(None) => {
                    self.finished = true;
                    return Ok(None);
                }
                Ok(Some(result)) => result,
            };

            match result.status {
                ResultStatus::SingleTuple => {
                    let row = &result.rows[0];
                    return types::decode_row(&self.row_type, row).map(Some).map_err(|e| {
                        decode_error(&self.uri, &self.query, e)
                    });
                }
                ResultStatus::TuplesOk if result.ntuples() == 0 => {
                    // End of stream; anything further violates the protocol.
                    self.finished = true;
                    return match self.conn.raw.get_result().await {
                        Ok(None) => Ok(None),
                        Ok(Some(_)) => Err(Error::ResponseRejected {
                            uri: self.uri.clone(),
                            query: self.query.clone(),
                            message: Msg::plain("More than one response received."),
                        }),
                        Err(e) => Err(self.conn.request_error(&self.query, e)),
                    };
                }
                _ => match check_query_result(&result, Mult::ZeroOrMore, true) {
                    Verdict::Accept => continue,
                    Verdict::Reject(message) => {
                        self.finished = true;
                        return Err(Error::ResponseRejected {
                            uri: self.uri.clone(),
                            query: self.query.clone(),
                            message,
                        });
                    }
                    Verdict::Fail(message) => {
                        self.finished = true;
                        return Err(Error::RequestFailed {
                            uri: self.uri.clone(),
                            query: self.query.clone(),
                            message,
                        });
                    }
                },
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn bind_params(cells: Vec<Option<Vec<u8>>>, binary: &[bool]) -> Vec<BindParam> {
    cells
        .into_iter()
        .zip(binary)
        .map(|(data, &is_binary)| BindParam {
            data,
            format: if is_binary { Format::Binary } else { Format::Text },
        })
        .collect()
}

fn row_decoder(uri: String, query: String, row_type: Type) -> DecodeRowFn {
    Box::new(move |cells| {
        types::decode_row(&row_type, cells).map_err(|e| decode_error(&uri, &query, e))
    })
}

fn decode_error(uri: &str, query: &str, e: CodecError) -> Error {
    match e {
        CodecError::Missing { type_name } => Error::DecodeMissing {
            uri: uri.to_string(),
            query: query.to_string(),
            type_name,
        },
        CodecError::Rejected { type_name, message } => Error::DecodeRejected {
            uri: uri.to_string(),
            query: query.to_string(),
            type_name,
            message,
        },
    }
}

fn copy_line(row_type: &Type, value: &Value) -> std::result::Result<Vec<u8>, CodecError> {
    let mut cells = Vec::with_capacity(row_type.length());
    types::encode_params(row_type, value, true, &mut cells)?;
    let mut line = Vec::new();
    for (i, cell) in cells.iter().enumerate() {
        if i > 0 {
            line.push(b'\t');
        }
        match cell {
            None => line.extend_from_slice(b"\\N"),
            Some(bytes) => line.extend_from_slice(bytes),
        }
    }
    line.push(b'\n');
    Ok(line)
}

fn quote_ident(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for ch in name.chars() {
        if ch == '"' {
            out.push('"');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

fn statement_timeout_ms(seconds: Option<f64>) -> i64 {
    match seconds {
        None => 0,
        Some(s) => ((s * 1000.0).round() as i64).max(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_timeout_rounding() {
        assert_eq!(statement_timeout_ms(None), 0);
        assert_eq!(statement_timeout_ms(Some(1.5)), 1500);
        assert_eq!(statement_timeout_ms(Some(0.0004)), 1);
        assert_eq!(statement_timeout_ms(Some(0.0)), 1);
        assert_eq!(statement_timeout_ms(Some(2.0004)), 2000);
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("with\"quote"), "\"with\"\"quote\"");
    }

    #[test]
    fn test_copy_line_layout() {
        let ty = Type::tup3(
            Type::Field(FieldType::Int),
            Type::option(Type::Field(FieldType::Text)),
            Type::Field(FieldType::Text),
        );
        let value = Value::tup3(Value::Int(7), Value::Null, Value::text("a\tb"));
        let line = copy_line(&ty, &value).unwrap();
        assert_eq!(line, b"7\t\\N\ta\\tb\n".to_vec());
    }

    #[test]
    fn test_bind_params_formats_follow_flags() {
        let cells = vec![Some(b"x".to_vec()), None];
        let params = bind_params(cells, &[true, false]);
        assert_eq!(params[0].format, Format::Binary);
        assert_eq!(params[1].format, Format::Text);
        assert!(params[1].data.is_none());
    }
}
