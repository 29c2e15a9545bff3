//! Request descriptors and query templates.
//!
//! A [`Request`] bundles the parameter and row descriptors, the expected row
//! multiplicity, an optional stable identity (present for requests eligible
//! for statement caching), and a function producing the query template for a
//! given driver.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::driver::DriverInfo;
use crate::types::Type;

// ============================================================================
// Row multiplicity
// ============================================================================

/// Static contract on how many rows a request produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mult {
    Zero,
    One,
    ZeroOrOne,
    ZeroOrMore,
}

impl Mult {
    /// Whether more than one row is admissible.
    pub fn can_be_many(self) -> bool {
        matches!(self, Mult::ZeroOrMore)
    }

    /// Whether zero rows are admissible.
    pub fn can_be_zero(self) -> bool {
        !matches!(self, Mult::One)
    }
}

// ============================================================================
// Query templates
// ============================================================================

/// A query template: a tree of literal fragments, quoted literals, parameter
/// references, and environment references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryTemplate {
    /// Literal SQL text, included as is.
    Lit(String),
    /// A string rendered as a quoted SQL literal.
    Quote(String),
    /// A reference to the i-th parameter, 0-indexed.
    Param(usize),
    /// A reference to an environment entry, resolved at expansion time.
    Env(String),
    Seq(Vec<QueryTemplate>),
}

/// Environment lookup used when expanding [`QueryTemplate::Env`] nodes.
pub type TemplateEnv<'a> = dyn Fn(&DriverInfo, &str) -> Option<QueryTemplate> + 'a;

impl QueryTemplate {
    pub fn lit(s: impl Into<String>) -> QueryTemplate {
        QueryTemplate::Lit(s.into())
    }

    pub fn quote(s: impl Into<String>) -> QueryTemplate {
        QueryTemplate::Quote(s.into())
    }

    pub fn seq(parts: Vec<QueryTemplate>) -> QueryTemplate {
        QueryTemplate::Seq(parts)
    }

    /// Expand environment references. With `last = true` any unresolved
    /// reference is an error; no `Env` node survives a final expansion.
    pub fn expand(
        &self,
        info: &DriverInfo,
        env: &TemplateEnv<'_>,
        last: bool,
    ) -> std::result::Result<QueryTemplate, String> {
        match self {
            QueryTemplate::Lit(_) | QueryTemplate::Quote(_) | QueryTemplate::Param(_) => {
                Ok(self.clone())
            }
            QueryTemplate::Env(name) => match env(info, name) {
                // An expansion may itself contain Env nodes; resolve those too.
                Some(t) => t.expand(info, env, last),
                None if last => Err(format!("unresolved environment reference {:?}", name)),
                None => Ok(self.clone()),
            },
            QueryTemplate::Seq(parts) => {
                let mut out = Vec::with_capacity(parts.len());
                for p in parts {
                    out.push(p.expand(info, env, last)?);
                }
                Ok(QueryTemplate::Seq(out))
            }
        }
    }

    /// Render the template as SQL text with `$1`-style placeholders and
    /// inline quoted literals. Environment references must have been
    /// expanded away.
    pub fn to_sql(&self) -> std::result::Result<String, String> {
        let mut out = String::new();
        self.write_sql(&mut out)?;
        Ok(out)
    }

    fn write_sql(&self, out: &mut String) -> std::result::Result<(), String> {
        match self {
            QueryTemplate::Lit(s) => out.push_str(s),
            QueryTemplate::Quote(s) => {
                out.push('\'');
                for ch in s.chars() {
                    if ch == '\'' {
                        out.push('\'');
                    }
                    out.push(ch);
                }
                out.push('\'');
            }
            QueryTemplate::Param(i) => {
                out.push('$');
                out.push_str(&(i + 1).to_string());
            }
            QueryTemplate::Env(name) => {
                return Err(format!("unresolved environment reference {:?}", name))
            }
            QueryTemplate::Seq(parts) => {
                for p in parts {
                    p.write_sql(out)?;
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for QueryTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_sql() {
            Ok(sql) => f.write_str(&sql),
            Err(_) => f.write_str("<template with unresolved references>"),
        }
    }
}

// ============================================================================
// Requests
// ============================================================================

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(0);

type MakeQuery = dyn Fn(&DriverInfo) -> QueryTemplate + Send + Sync;

/// A request descriptor: what to send and what to expect back.
#[derive(Clone)]
pub struct Request {
    id: Option<u64>,
    param_type: Type,
    row_type: Type,
    row_mult: Mult,
    make_query: Arc<MakeQuery>,
}

impl Request {
    /// A request with a stable identity, eligible for statement caching.
    pub fn prepared<F>(param_type: Type, row_type: Type, row_mult: Mult, make_query: F) -> Request
    where
        F: Fn(&DriverInfo) -> QueryTemplate + Send + Sync + 'static,
    {
        Request {
            id: Some(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)),
            param_type,
            row_type,
            row_mult,
            make_query: Arc::new(make_query),
        }
    }

    /// A one-shot request: never cached, sent with inline placeholders.
    pub fn oneshot<F>(param_type: Type, row_type: Type, row_mult: Mult, make_query: F) -> Request
    where
        F: Fn(&DriverInfo) -> QueryTemplate + Send + Sync + 'static,
    {
        Request {
            id: None,
            param_type,
            row_type,
            row_mult,
            make_query: Arc::new(make_query),
        }
    }

    /// A one-shot request over a fixed SQL string with no parameters
    /// beyond `$1`-style references already present in the text.
    pub fn oneshot_sql(
        sql: impl Into<String>,
        param_type: Type,
        row_type: Type,
        row_mult: Mult,
    ) -> Request {
        let sql = sql.into();
        Request::oneshot(param_type, row_type, row_mult, move |_| {
            QueryTemplate::Lit(sql.clone())
        })
    }

    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn param_type(&self) -> &Type {
        &self.param_type
    }

    pub fn row_type(&self) -> &Type {
        &self.row_type
    }

    pub fn row_mult(&self) -> Mult {
        self.row_mult
    }

    pub fn query(&self, info: &DriverInfo) -> QueryTemplate {
        (self.make_query)(info)
    }
}

// Request closures are opaque; show the identifying parts only.
impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("param_type", &self.param_type)
            .field("row_type", &self.row_type)
            .field("row_mult", &self.row_mult)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldType;

    fn info() -> DriverInfo {
        DriverInfo {
            scheme: "postgresql",
            can_concur: true,
            can_pool: true,
            default_max_size: 8,
        }
    }

    #[test]
    fn test_render_params_and_quotes() {
        let t = QueryTemplate::seq(vec![
            QueryTemplate::lit("SELECT * FROM t WHERE a = "),
            QueryTemplate::Param(0),
            QueryTemplate::lit(" AND b = "),
            QueryTemplate::quote("o'brien"),
            QueryTemplate::lit(" AND c = "),
            QueryTemplate::Param(1),
        ]);
        assert_eq!(
            t.to_sql().unwrap(),
            "SELECT * FROM t WHERE a = $1 AND b = 'o''brien' AND c = $2"
        );
    }

    #[test]
    fn test_final_expansion_leaves_no_env() {
        let t = QueryTemplate::seq(vec![
            QueryTemplate::lit("SELECT * FROM "),
            QueryTemplate::Env("schema".into()),
            QueryTemplate::lit("t"),
        ]);
        let env = |_: &DriverInfo, name: &str| {
            (name == "schema").then(|| QueryTemplate::lit("public."))
        };
        let expanded = t.expand(&info(), &env, true).unwrap();
        assert_eq!(expanded.to_sql().unwrap(), "SELECT * FROM public.t");
    }

    #[test]
    fn test_unresolved_env_fails_when_last() {
        let t = QueryTemplate::Env("missing".into());
        let env = |_: &DriverInfo, _: &str| None;
        assert!(t.expand(&info(), &env, true).is_err());
        // A non-final expansion keeps the node for a later pass.
        assert_eq!(t.expand(&info(), &env, false).unwrap(), t);
        assert!(t.to_sql().is_err());
    }

    #[test]
    fn test_request_identity() {
        let mk = |_: &DriverInfo| QueryTemplate::lit("SELECT 1");
        let a = Request::prepared(Type::Unit, Type::Field(FieldType::Int), Mult::One, mk);
        let b = Request::prepared(Type::Unit, Type::Field(FieldType::Int), Mult::One, mk);
        assert!(a.id().is_some());
        assert_ne!(a.id(), b.id());

        let c = Request::oneshot_sql("BEGIN", Type::Unit, Type::Unit, Mult::Zero);
        assert_eq!(c.id(), None);
    }
}
