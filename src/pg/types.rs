//! PostgreSQL type handling: OIDs, parameter typing, and text-format codecs.
//!
//! Parameters are rendered to the server's text representation (octets are
//! the exception and travel in binary), result cells are parsed back from
//! text. Both directions are interpreters over the request's type
//! descriptor.

use std::collections::HashMap;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};

use crate::types::{FieldType, Type, Value};

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub i32);

impl Oid {
    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const FLOAT8: Oid = Oid(701);
    /// The `unknown` pseudo-type; leaves typing to the server.
    pub const UNKNOWN: Oid = Oid(705);
    pub const DATE: Oid = Oid(1082);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const INTERVAL: Oid = Oid(1186);

    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }
}

// ============================================================================
// Codec errors
// ============================================================================

/// Failure while converting between native values and wire text. The
/// dispatcher maps these onto the encode/decode arms of the crate taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CodecError {
    /// No coding is available for the type.
    Missing { type_name: String },
    /// The coding refused the value or cell.
    Rejected { type_name: String, message: String },
}

impl CodecError {
    fn rejected(ty: &impl std::fmt::Display, message: impl Into<String>) -> CodecError {
        CodecError::Rejected {
            type_name: ty.to_string(),
            message: message.into(),
        }
    }
}

// ============================================================================
// Parameter typing
// ============================================================================

/// The OID bound for a field kind. Enum kinds resolve through the
/// per-connection cache of probed OIDs.
fn field_oid(
    ft: &FieldType,
    enum_oids: &HashMap<String, Oid>,
) -> std::result::Result<Oid, CodecError> {
    Ok(match ft {
        FieldType::Bool => Oid::BOOL,
        FieldType::Int => Oid::INT8,
        FieldType::Int16 => Oid::INT2,
        FieldType::Int32 => Oid::INT4,
        FieldType::Int64 => Oid::INT8,
        FieldType::Float => Oid::FLOAT8,
        // Let the server coerce string parameters to the column type.
        FieldType::Text => Oid::UNKNOWN,
        FieldType::Octets => Oid::BYTEA,
        FieldType::Date => Oid::DATE,
        FieldType::Timestamp => Oid::TIMESTAMPTZ,
        FieldType::Span => Oid::INTERVAL,
        FieldType::Enum(name) => match enum_oids.get(name) {
            Some(oid) => *oid,
            None => {
                return Err(CodecError::Missing {
                    type_name: ft.to_string(),
                })
            }
        },
    })
}

/// Assign the parameter OID and binary flag for every field leaf of `ty`,
/// left to right. The binary flag is set exactly for BYTEA parameters.
pub(crate) fn init_param_types(
    oids: &mut [Oid],
    binary: &mut [bool],
    ty: &Type,
    enum_oids: &HashMap<String, Oid>,
) -> std::result::Result<(), CodecError> {
    let mut cursor = 0;
    walk_param_types(oids, binary, ty, enum_oids, &mut cursor)?;
    if cursor != ty.length() {
        return Err(CodecError::rejected(ty, "descriptor length mismatch"));
    }
    Ok(())
}

fn walk_param_types(
    oids: &mut [Oid],
    binary: &mut [bool],
    ty: &Type,
    enum_oids: &HashMap<String, Oid>,
    cursor: &mut usize,
) -> std::result::Result<(), CodecError> {
    match ty {
        Type::Unit => Ok(()),
        Type::Field(ft) => {
            let oid = field_oid(ft, enum_oids)?;
            oids[*cursor] = oid;
            binary[*cursor] = oid == Oid::BYTEA;
            *cursor += 1;
            Ok(())
        }
        Type::Option(t) | Type::Annot(_, t) => {
            walk_param_types(oids, binary, t, enum_oids, cursor)
        }
        Type::Tup2(a, b) => {
            walk_param_types(oids, binary, a, enum_oids, cursor)?;
            walk_param_types(oids, binary, b, enum_oids, cursor)
        }
        Type::Tup3(a, b, c) => {
            walk_param_types(oids, binary, a, enum_oids, cursor)?;
            walk_param_types(oids, binary, b, enum_oids, cursor)?;
            walk_param_types(oids, binary, c, enum_oids, cursor)
        }
        Type::Tup4(a, b, c, d) => {
            walk_param_types(oids, binary, a, enum_oids, cursor)?;
            walk_param_types(oids, binary, b, enum_oids, cursor)?;
            walk_param_types(oids, binary, c, enum_oids, cursor)?;
            walk_param_types(oids, binary, d, enum_oids, cursor)
        }
        Type::Custom { rep, .. } => walk_param_types(oids, binary, rep, enum_oids, cursor),
    }
}

// ============================================================================
// Parameter encoding
// ============================================================================

/// Encode a parameter tuple against its descriptor. Each field leaf yields
/// one array slot; `None` is SQL NULL. With `copy` set, the COPY text
/// escapes are applied and octets go through `escape_bytea`.
pub(crate) fn encode_params(
    ty: &Type,
    value: &Value,
    copy: bool,
    out: &mut Vec<Option<Vec<u8>>>,
) -> std::result::Result<(), CodecError> {
    match (ty, value) {
        (Type::Unit, Value::Unit) => Ok(()),
        (Type::Field(ft), v) => {
            out.push(encode_field(ft, v, copy)?);
            Ok(())
        }
        (Type::Option(t), Value::Null) => {
            out.extend(std::iter::repeat_with(|| None).take(t.length()));
            Ok(())
        }
        (Type::Option(t), Value::Some(v)) => encode_params(t, v, copy, out),
        (Type::Tup2(ta, tb), Value::Tup2(va, vb)) => {
            encode_params(ta, va, copy, out)?;
            encode_params(tb, vb, copy, out)
        }
        (Type::Tup3(ta, tb, tc), Value::Tup3(va, vb, vc)) => {
            encode_params(ta, va, copy, out)?;
            encode_params(tb, vb, copy, out)?;
            encode_params(tc, vc, copy, out)
        }
        (Type::Tup4(ta, tb, tc, td), Value::Tup4(va, vb, vc, vd)) => {
            encode_params(ta, va, copy, out)?;
            encode_params(tb, vb, copy, out)?;
            encode_params(tc, vc, copy, out)?;
            encode_params(td, vd, copy, out)
        }
        (Type::Custom { rep, codec }, v) => {
            let rep_value = codec.encode(v).map_err(|message| CodecError::Rejected {
                type_name: codec.name().to_string(),
                message,
            })?;
            encode_params(rep, &rep_value, copy, out)
        }
        (Type::Annot(_, t), v) => encode_params(t, v, copy, out),
        (ty, v) => Err(CodecError::rejected(
            ty,
            format!("value {:?} does not have this shape", v),
        )),
    }
}

fn encode_field(
    ft: &FieldType,
    value: &Value,
    copy: bool,
) -> std::result::Result<Option<Vec<u8>>, CodecError> {
    let bytes = match (ft, value) {
        (FieldType::Bool, Value::Bool(b)) => vec![if *b { b't' } else { b'f' }],
        (FieldType::Int, Value::Int(i)) => i.to_string().into_bytes(),
        (FieldType::Int16, Value::Int16(i)) => i.to_string().into_bytes(),
        (FieldType::Int32, Value::Int32(i)) => i.to_string().into_bytes(),
        (FieldType::Int64, Value::Int64(i)) => i.to_string().into_bytes(),
        (FieldType::Float, Value::Float(x)) => encode_float(*x).into_bytes(),
        (FieldType::Text, Value::Text(s)) => {
            if copy {
                copy_escape(s.as_bytes())
            } else {
                s.clone().into_bytes()
            }
        }
        (FieldType::Octets, Value::Octets(bytes)) => {
            if copy {
                copy_escape(escape_bytea(bytes).as_bytes())
            } else {
                // Bound with the binary flag set; raw bytes go on the wire.
                bytes.clone()
            }
        }
        (FieldType::Date, Value::Date(d)) => d.format("%Y-%m-%d").to_string().into_bytes(),
        (FieldType::Timestamp, Value::Timestamp(t)) => t
            .format("%Y-%m-%d %H:%M:%S%.6f+00")
            .to_string()
            .into_bytes(),
        (FieldType::Span, Value::Span(d)) => encode_interval(d)
            .map_err(|m| CodecError::rejected(ft, m))?
            .into_bytes(),
        (FieldType::Enum(_), Value::Enum(label)) => label.clone().into_bytes(),
        (ft, v) => {
            return Err(CodecError::rejected(
                ft,
                format!("value {:?} does not fit this field", v),
            ))
        }
    };
    Ok(Some(bytes))
}

fn encode_float(x: f64) -> String {
    if x.is_nan() {
        "NaN".to_string()
    } else if x.is_infinite() {
        if x > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        // Shortest representation that round-trips.
        format!("{}", x)
    }
}

fn encode_interval(d: &Duration) -> std::result::Result<String, String> {
    match d.num_microseconds() {
        Some(us) => Ok(format!("{} microseconds", us)),
        None => Err("time span overflows the interval range".to_string()),
    }
}

// ============================================================================
// Row decoding
// ============================================================================

/// Decode one result row against its descriptor. Cells are the server's
/// text representation, `None` for SQL NULL.
pub(crate) fn decode_row(
    ty: &Type,
    cells: &[Option<String>],
) -> std::result::Result<Value, CodecError> {
    let mut cursor = 0;
    let value = decode_group(ty, cells, &mut cursor)?;
    if cursor != cells.len() {
        return Err(CodecError::rejected(
            ty,
            format!("row has {} cells, descriptor covers {}", cells.len(), cursor),
        ));
    }
    Ok(value)
}

fn decode_group(
    ty: &Type,
    cells: &[Option<String>],
    cursor: &mut usize,
) -> std::result::Result<Value, CodecError> {
    match ty {
        Type::Unit => Ok(Value::Unit),
        Type::Field(ft) => {
            let cell = cells
                .get(*cursor)
                .ok_or_else(|| CodecError::rejected(ty, "row is too narrow"))?;
            *cursor += 1;
            match cell {
                None => Err(CodecError::rejected(ft, "unexpected NULL")),
                Some(text) => decode_field(ft, text),
            }
        }
        Type::Option(t) => {
            let n = t.length();
            let group = cells
                .get(*cursor..*cursor + n)
                .ok_or_else(|| CodecError::rejected(ty, "row is too narrow"))?;
            if group.iter().all(Option::is_none) {
                *cursor += n;
                Ok(Value::Null)
            } else {
                Ok(Value::some(decode_group(t, cells, cursor)?))
            }
        }
        Type::Tup2(a, b) => Ok(Value::tup2(
            decode_group(a, cells, cursor)?,
            decode_group(b, cells, cursor)?,
        )),
        Type::Tup3(a, b, c) => Ok(Value::tup3(
            decode_group(a, cells, cursor)?,
            decode_group(b, cells, cursor)?,
            decode_group(c, cells, cursor)?,
        )),
        Type::Tup4(a, b, c, d) => Ok(Value::tup4(
            decode_group(a, cells, cursor)?,
            decode_group(b, cells, cursor)?,
            decode_group(c, cells, cursor)?,
            decode_group(d, cells, cursor)?,
        )),
        Type::Custom { rep, codec } => {
            let rep_value = decode_group(rep, cells, cursor)?;
            codec.decode(rep_value).map_err(|message| CodecError::Rejected {
                type_name: codec.name().to_string(),
                message,
            })
        }
        Type::Annot(_, t) => decode_group(t, cells, cursor),
    }
}

fn decode_field(ft: &FieldType, text: &str) -> std::result::Result<Value, CodecError> {
    match ft {
        FieldType::Bool => match text {
            "t" | "true" | "1" => Ok(Value::Bool(true)),
            "f" | "false" | "0" => Ok(Value::Bool(false)),
            other => Err(CodecError::rejected(ft, format!("invalid bool {:?}", other))),
        },
        FieldType::Int => parse_num(ft, text).map(Value::Int),
        FieldType::Int16 => parse_num(ft, text).map(Value::Int16),
        FieldType::Int32 => parse_num(ft, text).map(Value::Int32),
        FieldType::Int64 => parse_num(ft, text).map(Value::Int64),
        FieldType::Float => parse_num(ft, text).map(Value::Float),
        FieldType::Text => Ok(Value::Text(text.to_string())),
        FieldType::Octets => unescape_bytea(text)
            .map(Value::Octets)
            .map_err(|m| CodecError::rejected(ft, m)),
        FieldType::Date => NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map(Value::Date)
            .map_err(|e| CodecError::rejected(ft, e.to_string())),
        FieldType::Timestamp => parse_timestamptz(text)
            .map(Value::Timestamp)
            .map_err(|m| CodecError::rejected(ft, m)),
        FieldType::Span => parse_interval(text)
            .map(Value::Span)
            .map_err(|m| CodecError::rejected(ft, m)),
        FieldType::Enum(_) => Ok(Value::Enum(text.to_string())),
    }
}

fn parse_num<T: std::str::FromStr>(
    ft: &FieldType,
    text: &str,
) -> std::result::Result<T, CodecError>
where
    T::Err: std::fmt::Display,
{
    text.parse::<T>()
        .map_err(|e| CodecError::rejected(ft, e.to_string()))
}

// ============================================================================
// Date/time text converters
// ============================================================================

/// Parse a timestamptz in the server's text output form,
/// `YYYY-MM-DD HH:MM:SS[.ffffff]±HH[:MM]`.
fn parse_timestamptz(text: &str) -> std::result::Result<DateTime<Utc>, String> {
    let (naive_part, offset_secs) = split_utc_offset(text)?;
    let naive = NaiveDateTime::parse_from_str(naive_part, "%Y-%m-%d %H:%M:%S%.f")
        .map_err(|e| e.to_string())?;
    let utc = naive - Duration::seconds(offset_secs);
    Ok(DateTime::from_naive_utc_and_offset(utc, Utc))
}

fn split_utc_offset(text: &str) -> std::result::Result<(&str, i64), String> {
    // The date itself contains '-'; any offset sign appears after the time.
    let tail_start = text.char_indices().skip(11).find_map(|(i, c)| {
        (c == '+' || c == '-').then_some(i)
    });
    let Some(at) = tail_start else {
        return Ok((text, 0));
    };
    let (naive, tail) = text.split_at(at);
    let sign: i64 = if tail.starts_with('-') { -1 } else { 1 };
    let digits = tail[1..].replace(':', "");
    let (hours, minutes) = match digits.len() {
        2 => (digits.parse::<i64>().map_err(|e| e.to_string())?, 0),
        4 => (
            digits[..2].parse::<i64>().map_err(|e| e.to_string())?,
            digits[2..].parse::<i64>().map_err(|e| e.to_string())?,
        ),
        _ => return Err(format!("invalid timezone offset {:?}", tail)),
    };
    Ok((naive, sign * (hours * 3600 + minutes * 60)))
}

/// Parse an interval in the server's default (postgres-style) text output,
/// e.g. `3 days 04:05:06.789` or `-00:00:01`. Calendar units (years,
/// months) have no fixed width and are rejected.
fn parse_interval(text: &str) -> std::result::Result<Duration, String> {
    let mut total = Duration::zero();
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() {
        return Err("empty interval".to_string());
    }
    let mut i = 0;
    while i < tokens.len() {
        let tok = tokens[i];
        if tok.contains(':') {
            total = total + parse_clock(tok)?;
            i += 1;
        } else {
            let n: i64 = tok
                .parse()
                .map_err(|_| format!("invalid interval quantity {:?}", tok))?;
            let unit = tokens
                .get(i + 1)
                .ok_or_else(|| format!("interval quantity {:?} without a unit", tok))?;
            match unit.trim_end_matches('s') {
                "day" => total = total + Duration::days(n),
                "week" => total = total + Duration::weeks(n),
                "hour" => total = total + Duration::hours(n),
                "min" | "minute" => total = total + Duration::minutes(n),
                "sec" | "second" => total = total + Duration::seconds(n),
                "microsecond" => total = total + Duration::microseconds(n),
                "year" | "mon" | "month" | "decade" | "century" | "millennium" => {
                    return Err(format!(
                        "calendar interval unit {:?} has no fixed length",
                        unit
                    ))
                }
                other => return Err(format!("unsupported interval unit {:?}", other)),
            }
            i += 2;
        }
    }
    Ok(total)
}

fn parse_clock(tok: &str) -> std::result::Result<Duration, String> {
    let (sign, rest) = match tok.strip_prefix('-') {
        Some(rest) => (-1i64, rest),
        None => (1, tok.strip_prefix('+').unwrap_or(tok)),
    };
    let mut parts = rest.split(':');
    let hours: i64 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| format!("invalid clock {:?}", tok))?;
    let minutes: i64 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| format!("invalid clock {:?}", tok))?;
    let seconds_part = parts.next().unwrap_or("0");
    if parts.next().is_some() {
        return Err(format!("invalid clock {:?}", tok));
    }
    let (secs, micros) = match seconds_part.split_once('.') {
        None => (
            seconds_part
                .parse::<i64>()
                .map_err(|_| format!("invalid clock {:?}", tok))?,
            0,
        ),
        Some((s, frac)) => {
            let secs = s.parse::<i64>().map_err(|_| format!("invalid clock {:?}", tok))?;
            let padded = format!("{:0<6}", frac);
            let micros = padded[..6]
                .parse::<i64>()
                .map_err(|_| format!("invalid clock {:?}", tok))?;
            (secs, micros)
        }
    };
    let magnitude = Duration::hours(hours)
        + Duration::minutes(minutes)
        + Duration::seconds(secs)
        + Duration::microseconds(micros);
    Ok(if sign < 0 { -magnitude } else { magnitude })
}

// ============================================================================
// COPY and bytea escaping
// ============================================================================

/// Escape a COPY text cell: exactly `\`, newline, carriage return and tab.
pub(crate) fn copy_escape(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            b'\t' => out.extend_from_slice(b"\\t"),
            b => out.push(b),
        }
    }
    out
}

/// Render octets in the bytea hex input form.
pub(crate) fn escape_bytea(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Parse a bytea cell in either the hex or the legacy escape output form.
pub(crate) fn unescape_bytea(text: &str) -> std::result::Result<Vec<u8>, String> {
    if let Some(hex) = text.strip_prefix("\\x") {
        let digits = hex.as_bytes();
        if digits.len() % 2 != 0 {
            return Err("odd-length bytea hex string".to_string());
        }
        let mut out = Vec::with_capacity(digits.len() / 2);
        for pair in digits.chunks(2) {
            let s = std::str::from_utf8(pair).map_err(|e| e.to_string())?;
            out.push(u8::from_str_radix(s, 16).map_err(|e| e.to_string())?);
        }
        return Ok(out);
    }

    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
        } else if bytes.get(i + 1) == Some(&b'\\') {
            out.push(b'\\');
            i += 2;
        } else if i + 4 <= bytes.len() {
            let oct = std::str::from_utf8(&bytes[i + 1..i + 4]).map_err(|e| e.to_string())?;
            out.push(u8::from_str_radix(oct, 8).map_err(|e| e.to_string())?);
            i += 4;
        } else {
            return Err("truncated bytea escape".to_string());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::types::CustomCodec;

    fn field(ft: FieldType) -> Type {
        Type::Field(ft)
    }

    fn no_enums() -> HashMap<String, Oid> {
        HashMap::new()
    }

    #[test]
    fn test_param_typing_assigns_oids_and_flags() {
        let ty = Type::tup4(
            field(FieldType::Bool),
            field(FieldType::Text),
            field(FieldType::Octets),
            Type::option(field(FieldType::Int)),
        );
        let mut oids = vec![Oid(0); ty.length()];
        let mut binary = vec![false; ty.length()];
        init_param_types(&mut oids, &mut binary, &ty, &no_enums()).unwrap();
        assert_eq!(oids, vec![Oid::BOOL, Oid::UNKNOWN, Oid::BYTEA, Oid::INT8]);
        assert_eq!(binary, vec![false, false, true, false]);
        for (oid, flag) in oids.iter().zip(&binary) {
            assert_eq!(*flag, *oid == Oid::BYTEA);
        }
    }

    #[test]
    fn test_param_typing_resolves_enums_from_cache() {
        let ty = Type::enum_("mood");
        let mut oids = vec![Oid(0)];
        let mut binary = vec![false];

        let missing = init_param_types(&mut oids, &mut binary, &ty, &no_enums());
        assert_eq!(
            missing,
            Err(CodecError::Missing {
                type_name: "enum(mood)".to_string()
            })
        );

        let mut cache = HashMap::new();
        cache.insert("mood".to_string(), Oid(16001));
        init_param_types(&mut oids, &mut binary, &ty, &cache).unwrap();
        assert_eq!(oids[0], Oid(16001));
        assert!(!binary[0]);
    }

    #[test]
    fn test_encode_primitives() {
        let mut out = Vec::new();
        encode_params(&field(FieldType::Bool), &Value::Bool(true), false, &mut out).unwrap();
        encode_params(&field(FieldType::Bool), &Value::Bool(false), false, &mut out).unwrap();
        encode_params(&field(FieldType::Int), &Value::Int(-42), false, &mut out).unwrap();
        encode_params(
            &field(FieldType::Text),
            &Value::text("plain"),
            false,
            &mut out,
        )
        .unwrap();
        assert_eq!(out[0].as_deref(), Some(b"t".as_ref()));
        assert_eq!(out[1].as_deref(), Some(b"f".as_ref()));
        assert_eq!(out[2].as_deref(), Some(b"-42".as_ref()));
        assert_eq!(out[3].as_deref(), Some(b"plain".as_ref()));
    }

    #[test]
    fn test_absent_option_encodes_null_group() {
        let ty = Type::option(Type::tup2(field(FieldType::Int), field(FieldType::Text)));
        let mut out = Vec::new();
        encode_params(&ty, &Value::Null, false, &mut out).unwrap();
        assert_eq!(out, vec![None, None]);

        out.clear();
        let present = Value::some(Value::tup2(Value::Int(1), Value::text("x")));
        encode_params(&ty, &present, false, &mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(Option::is_some));
    }

    #[test]
    fn test_value_shape_mismatch_is_rejected() {
        let mut out = Vec::new();
        let err = encode_params(&field(FieldType::Int), &Value::text("7"), false, &mut out)
            .unwrap_err();
        assert!(matches!(err, CodecError::Rejected { .. }));
    }

    #[test]
    fn test_field_roundtrips() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let stamp = DateTime::parse_from_rfc3339("2024-02-29T12:30:45.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        let cases = vec![
            (FieldType::Bool, Value::Bool(true)),
            (FieldType::Int, Value::Int(i64::MIN)),
            (FieldType::Int16, Value::Int16(-32768)),
            (FieldType::Int32, Value::Int32(2147483647)),
            (FieldType::Int64, Value::Int64(1)),
            (FieldType::Float, Value::Float(0.1)),
            (FieldType::Float, Value::Float(-1.5e300)),
            (FieldType::Text, Value::text("héllo\tworld")),
            (FieldType::Date, Value::Date(date)),
            (FieldType::Timestamp, Value::Timestamp(stamp)),
            (
                FieldType::Span,
                Value::Span(Duration::seconds(3661) + Duration::microseconds(250)),
            ),
            (FieldType::Enum("mood".into()), Value::Enum("happy".into())),
        ];
        for (ft, value) in cases {
            let encoded = encode_field(&ft, &value, false).unwrap().unwrap();
            let text = String::from_utf8(encoded).unwrap();
            let decoded = decode_field(&ft, &text).unwrap();
            assert_eq!(decoded, value, "round-trip for {}", ft);
        }
    }

    #[test]
    fn test_float_specials() {
        for (x, rendered) in [
            (f64::NAN, "NaN"),
            (f64::INFINITY, "Infinity"),
            (f64::NEG_INFINITY, "-Infinity"),
        ] {
            let encoded = encode_field(&FieldType::Float, &Value::Float(x), false)
                .unwrap()
                .unwrap();
            assert_eq!(encoded, rendered.as_bytes());
        }
        match decode_field(&FieldType::Float, "NaN").unwrap() {
            Value::Float(x) => assert!(x.is_nan()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_octets_binary_in_parameter_mode() {
        let payload = vec![0u8, 1, 2, b'\\', b'\n', 255];
        let encoded = encode_field(&FieldType::Octets, &Value::Octets(payload.clone()), false)
            .unwrap()
            .unwrap();
        assert_eq!(encoded, payload);
    }

    #[test]
    fn test_bytea_escape_roundtrip() {
        let payload = vec![0u8, 1, 2, b'\\', b'\n', 255];
        let escaped = escape_bytea(&payload);
        assert_eq!(escaped, "\\x0001025c0aff");
        assert_eq!(unescape_bytea(&escaped).unwrap(), payload);
        // Legacy escape format decodes too.
        assert_eq!(unescape_bytea("a\\\\b\\012").unwrap(), b"a\\b\n".to_vec());
    }

    #[test]
    fn test_copy_escape_set() {
        assert_eq!(copy_escape(b"a\\b\nc\rd\te"), b"a\\\\b\\nc\\rd\\te".to_vec());
        // Nothing else is touched, including quotes and NUL-adjacent bytes.
        assert_eq!(copy_escape(b"it's \"fine\" \x01"), b"it's \"fine\" \x01".to_vec());
    }

    #[test]
    fn test_copy_mode_escapes_octets_twice() {
        let encoded = encode_field(
            &FieldType::Octets,
            &Value::Octets(vec![b'\n']),
            true,
        )
        .unwrap()
        .unwrap();
        // escape_bytea gives \x0a; the copy layer escapes its backslash.
        assert_eq!(encoded, b"\\\\x0a".to_vec());
    }

    #[test]
    fn test_decode_option_skip_null_probe() {
        let ty = Type::tup2(
            field(FieldType::Int),
            Type::option(Type::tup2(field(FieldType::Text), field(FieldType::Int))),
        );
        let absent = vec![Some("1".to_string()), None, None];
        assert_eq!(
            decode_row(&ty, &absent).unwrap(),
            Value::tup2(Value::Int(1), Value::Null)
        );

        // A partially NULL group decodes the inner type, which then rejects
        // the NULL cell for a non-optional field.
        let partial = vec![Some("1".to_string()), Some("x".to_string()), None];
        assert!(decode_row(&ty, &partial).is_err());

        let present = vec![
            Some("1".to_string()),
            Some("x".to_string()),
            Some("2".to_string()),
        ];
        assert_eq!(
            decode_row(&ty, &present).unwrap(),
            Value::tup2(
                Value::Int(1),
                Value::some(Value::tup2(Value::text("x"), Value::Int(2)))
            )
        );
    }

    #[test]
    fn test_decode_row_width_must_match() {
        let ty = field(FieldType::Int);
        let too_wide = vec![Some("1".to_string()), Some("2".to_string())];
        assert!(decode_row(&ty, &too_wide).is_err());
        let too_narrow: Vec<Option<String>> = vec![];
        assert!(decode_row(&ty, &too_narrow).is_err());
    }

    #[test]
    fn test_parse_timestamptz_offsets() {
        let t = parse_timestamptz("2024-02-29 12:30:45.123456+00").unwrap();
        assert_eq!(t.to_rfc3339(), "2024-02-29T12:30:45.123456+00:00");

        let t = parse_timestamptz("2024-02-29 17:00:00+05:30").unwrap();
        assert_eq!(t.to_rfc3339(), "2024-02-29T11:30:00+00:00");

        let t = parse_timestamptz("2024-02-29 06:00:00-02").unwrap();
        assert_eq!(t.to_rfc3339(), "2024-02-29T08:00:00+00:00");
    }

    #[test]
    fn test_parse_interval_forms() {
        assert_eq!(parse_interval("00:00:00").unwrap(), Duration::zero());
        assert_eq!(parse_interval("-00:00:01").unwrap(), Duration::seconds(-1));
        assert_eq!(
            parse_interval("3 days 04:05:06.5").unwrap(),
            Duration::days(3)
                + Duration::hours(4)
                + Duration::minutes(5)
                + Duration::seconds(6)
                + Duration::microseconds(500_000)
        );
        assert_eq!(
            parse_interval("1 day -01:00:00").unwrap(),
            Duration::hours(23)
        );
        assert_eq!(
            parse_interval("5000000 microseconds").unwrap(),
            Duration::seconds(5)
        );
        assert!(parse_interval("2 mons").is_err());
        assert!(parse_interval("1 year").is_err());
    }

    struct CentCodec;

    impl CustomCodec for CentCodec {
        fn name(&self) -> &str {
            "cents"
        }

        fn encode(&self, value: &Value) -> std::result::Result<Value, String> {
            match value {
                Value::Float(euros) => Ok(Value::Int((euros * 100.0).round() as i64)),
                other => Err(format!("expected float, got {:?}", other)),
            }
        }

        fn decode(&self, rep: Value) -> std::result::Result<Value, String> {
            match rep {
                Value::Int(cents) => Ok(Value::Float(cents as f64 / 100.0)),
                other => Err(format!("expected int, got {:?}", other)),
            }
        }
    }

    #[test]
    fn test_custom_codec_layers() {
        let ty = Type::custom(field(FieldType::Int), Arc::new(CentCodec));

        let mut out = Vec::new();
        encode_params(&ty, &Value::Float(12.34), false, &mut out).unwrap();
        assert_eq!(out[0].as_deref(), Some(b"1234".as_ref()));

        let row = vec![Some("1234".to_string())];
        assert_eq!(decode_row(&ty, &row).unwrap(), Value::Float(12.34));

        // A refusing user codec surfaces as a rejection tagged with its name.
        let mut out = Vec::new();
        let err = encode_params(&ty, &Value::text("x"), false, &mut out).unwrap_err();
        match err {
            CodecError::Rejected { type_name, .. } => assert_eq!(type_name, "cents"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
