//! Driver and connection interfaces.
//!
//! A driver is a vtable resolved from the URI scheme; it produces boxed
//! [`Connection`] trait objects. Responses are returned as [`Response`]
//! values whose iteration decodes rows on demand, either from a fully
//! buffered result or from a single-row stream that is still attached to the
//! connection.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::Stream;
use smallvec::SmallVec;

use crate::config::Config;
use crate::error::{Error, Msg, Result};
use crate::request::Request;
use crate::types::{Type, Value};

// ============================================================================
// Driver info
// ============================================================================

/// Static description of a driver's capabilities.
#[derive(Debug, Clone, Copy)]
pub struct DriverInfo {
    /// Primary URI scheme.
    pub scheme: &'static str,
    /// Whether independent connections may be used concurrently.
    pub can_concur: bool,
    /// Whether connections survive being parked in a pool.
    pub can_pool: bool,
    /// Default pool capacity when the caller does not choose one.
    pub default_max_size: usize,
}

/// A database driver, registered per URI scheme.
#[async_trait]
pub trait Driver: Send + Sync {
    fn info(&self) -> &'static DriverInfo;

    /// Open a connection to `uri` with the given configuration.
    async fn connect(&self, config: &Config, uri: &str) -> Result<Box<dyn Connection>>;
}

// ============================================================================
// Connections
// ============================================================================

/// An open database connection.
///
/// Requests on one connection are serialised; the `&mut self` receivers make
/// interleaving impossible from safe code, and the drivers additionally keep
/// a loud runtime guard for the same invariant.
#[async_trait]
pub trait Connection: Send {
    fn driver_info(&self) -> &'static DriverInfo;

    /// The URI this connection was opened with.
    fn uri(&self) -> &str;

    /// Issue a request and return its response. The response borrows the
    /// connection until it is consumed.
    async fn call<'c>(&'c mut self, req: &Request, params: Value) -> Result<Response<'c>>;

    /// Release the server-side prepared statement of a cacheable request.
    async fn deallocate(&mut self, req: &Request) -> Result<()>;

    /// Begin a transaction.
    async fn start(&mut self) -> Result<()>;

    /// Commit the current transaction.
    async fn commit(&mut self) -> Result<()>;

    /// Roll back the current transaction.
    async fn rollback(&mut self) -> Result<()>;

    /// Set or clear the server-side statement timeout, in seconds.
    async fn set_statement_timeout(&mut self, seconds: Option<f64>) -> Result<()>;

    /// Bulk-load rows into `table` via the server's COPY path.
    async fn populate(
        &mut self,
        table: &str,
        columns: &[String],
        row_type: &Type,
        rows: BoxStream<'_, Result<Value>>,
    ) -> Result<()>;

    /// Whether the connection is usable, re-establishing it if possible.
    async fn validate(&mut self) -> bool;

    /// Whether the connection looks usable, without touching the wire.
    fn check(&self) -> bool;

    /// Whether a transaction is open.
    fn in_transaction(&self) -> bool;

    /// Close the connection. Errors are logged, never surfaced.
    async fn disconnect(&mut self);
}

// ============================================================================
// Responses
// ============================================================================

/// An undecoded result row: one text cell per field, `None` for SQL NULL.
pub type RawRow = SmallVec<[Option<String>; 16]>;

/// Decodes one raw row into a [`Value`] shaped like the request's row type.
pub(crate) type DecodeRowFn = Box<dyn Fn(&[Option<String>]) -> Result<Value> + Send + Sync>;

/// A source of decoded rows delivered one at a time.
#[async_trait]
pub trait RowStream: Send {
    async fn fetch_next(&mut self) -> Result<Option<Value>>;
}

enum Source<'a> {
    Complete {
        rows: std::vec::IntoIter<RawRow>,
        returned: usize,
        affected: u64,
        decode: DecodeRowFn,
    },
    Stream(Box<dyn RowStream + 'a>),
}

/// The response to a request.
pub struct Response<'a> {
    uri: String,
    query: String,
    source: Source<'a>,
}

impl<'a> Response<'a> {
    /// A fully buffered response.
    pub(crate) fn complete(
        uri: String,
        query: String,
        rows: Vec<RawRow>,
        affected: u64,
        decode: DecodeRowFn,
    ) -> Response<'a> {
        let returned = rows.len();
        Response {
            uri,
            query,
            source: Source::Complete {
                rows: rows.into_iter(),
                returned,
                affected,
                decode,
            },
        }
    }

    /// A response streamed row by row off the connection.
    pub(crate) fn streaming(
        uri: String,
        query: String,
        stream: Box<dyn RowStream + 'a>,
    ) -> Response<'a> {
        Response {
            uri,
            query,
            source: Source::Stream(stream),
        }
    }

    /// Acknowledge a response that carries no interesting rows.
    pub fn exec(self) -> Result<()> {
        Ok(())
    }

    /// Number of rows the server returned. Not available while streaming.
    pub fn returned_count(&self) -> Result<usize> {
        match &self.source {
            Source::Complete { returned, .. } => Ok(*returned),
            Source::Stream(_) => Err(Error::Unsupported),
        }
    }

    /// Number of rows the command affected. Not available while streaming.
    pub fn affected_count(&self) -> Result<u64> {
        match &self.source {
            Source::Complete { affected, .. } => Ok(*affected),
            Source::Stream(_) => Err(Error::Unsupported),
        }
    }

    /// Fetch and decode the next row.
    pub async fn next_row(&mut self) -> Result<Option<Value>> {
        match &mut self.source {
            Source::Complete { rows, decode, .. } => match rows.next() {
                Some(raw) => decode(&raw).map(Some),
                None => Ok(None),
            },
            Source::Stream(s) => s.fetch_next().await,
        }
    }

    /// Decode the single row of the response.
    pub async fn find(mut self) -> Result<Value> {
        match self.next_row().await? {
            Some(v) => Ok(v),
            None => Err(Error::ResponseRejected {
                uri: self.uri.clone(),
                query: self.query.clone(),
                message: Msg::plain("Received 0 tuples, expected one."),
            }),
        }
    }

    /// Decode the row of the response, if there is one.
    pub async fn find_opt(mut self) -> Result<Option<Value>> {
        self.next_row().await
    }

    /// Fold over all rows.
    pub async fn fold<B, F>(mut self, mut f: F, mut acc: B) -> Result<B>
    where
        F: FnMut(Value, B) -> B + Send,
        B: Send,
    {
        while let Some(v) = self.next_row().await? {
            acc = f(v, acc);
        }
        Ok(acc)
    }

    /// Fold over all rows with a fallible step.
    pub async fn try_fold<B, F>(mut self, mut f: F, mut acc: B) -> Result<B>
    where
        F: FnMut(Value, B) -> Result<B> + Send,
        B: Send,
    {
        while let Some(v) = self.next_row().await? {
            acc = f(v, acc)?;
        }
        Ok(acc)
    }

    /// Run a fallible action on each row.
    pub async fn for_each<F>(self, mut f: F) -> Result<()>
    where
        F: FnMut(Value) -> Result<()> + Send,
    {
        self.try_fold(|v, ()| f(v), ()).await
    }

    /// Turn the response into a lazy stream of decoded rows. The stream ends
    /// after the first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<Value>> + 'a {
        futures::stream::unfold(Some(self), |state| async move {
            let mut resp = state?;
            match resp.next_row().await {
                Ok(Some(v)) => Some((Ok(v), Some(resp))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldType;
    use futures::StreamExt;
    use smallvec::smallvec;

    fn int_response(cells: Vec<Option<&str>>) -> Response<'static> {
        let rows: Vec<RawRow> = cells
            .into_iter()
            .map(|c| smallvec![c.map(str::to_string)])
            .collect();
        let decode: DecodeRowFn = Box::new(|raw| {
            let cell = raw[0].as_deref().unwrap_or("");
            cell.parse::<i64>()
                .map(Value::Int)
                .map_err(|e| Error::DecodeRejected {
                    uri: "stub://".into(),
                    query: "Q".into(),
                    type_name: FieldType::Int.to_string(),
                    message: e.to_string(),
                })
        });
        Response::complete("stub://".into(), "Q".into(), rows, 0, decode)
    }

    #[tokio::test]
    async fn test_counts_on_complete_response() {
        let resp = int_response(vec![Some("1"), Some("2")]);
        assert_eq!(resp.returned_count().unwrap(), 2);
        assert_eq!(resp.affected_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_find_and_find_opt() {
        let v = int_response(vec![Some("7")]).find().await.unwrap();
        assert_eq!(v, Value::Int(7));

        let v = int_response(vec![]).find_opt().await.unwrap();
        assert_eq!(v, None);

        let err = int_response(vec![]).find().await.unwrap_err();
        assert!(matches!(err, Error::ResponseRejected { .. }));
    }

    #[tokio::test]
    async fn test_fold_decodes_in_order() {
        let resp = int_response(vec![Some("1"), Some("2"), Some("3")]);
        let collected = resp
            .fold(
                |v, mut acc: Vec<Value>| {
                    acc.push(v);
                    acc
                },
                Vec::new(),
            )
            .await
            .unwrap();
        assert_eq!(collected, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    }

    #[tokio::test]
    async fn test_stream_stops_after_error() {
        let resp = int_response(vec![Some("1"), Some("oops"), Some("3")]);
        let items: Vec<_> = resp.into_stream().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(*items[0].as_ref().unwrap(), Value::Int(1));
        assert!(items[1].is_err());
    }
}
