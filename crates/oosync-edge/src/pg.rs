//! Dynamic parameter binding for schema-driven SQL.
//!
//! Pushed rows arrive as JSON, so parameter types are only known once the
//! prepared statement reports the column types. `PgValue` bridges the gap:
//! it converts itself to whatever Postgres type the statement expects,
//! parsing text into timestamps, uuids, and dates on the way.

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};

#[derive(Debug, Clone)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    TextArray(Vec<String>),
    Json(Value),
}

impl PgValue {
    pub fn from_json(v: &Value) -> PgValue {
        match v {
            Value::Null => PgValue::Null,
            Value::Bool(b) => PgValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => PgValue::Int(i),
                None => PgValue::Float(n.as_f64().unwrap_or(0.0)),
            },
            Value::String(s) => PgValue::Text(s.clone()),
            other => PgValue::Json(other.clone()),
        }
    }
}

/// Borrow a parameter slice in the form `tokio_postgres` expects.
pub fn params_ref(params: &[PgValue]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

type ToSqlError = Box<dyn std::error::Error + Sync + Send>;

fn mismatch(value: &PgValue, ty: &Type) -> ToSqlError {
    format!("cannot bind {value:?} to column type {ty}").into()
}

impl ToSql for PgValue {
    // `Type` constants are not matchable patterns, hence the guard chains.
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, ToSqlError> {
        match self {
            PgValue::Null => Ok(IsNull::Yes),

            PgValue::Bool(b) => match ty {
                t if *t == Type::BOOL => b.to_sql(ty, out),
                t if *t == Type::INT2 => i16::from(*b).to_sql(ty, out),
                t if *t == Type::INT4 => i32::from(*b).to_sql(ty, out),
                t if *t == Type::INT8 => i64::from(*b).to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },

            PgValue::Int(i) => match ty {
                t if *t == Type::BOOL => (*i != 0).to_sql(ty, out),
                t if *t == Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                t if *t == Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                t if *t == Type::INT8 => i.to_sql(ty, out),
                t if *t == Type::FLOAT4 => (*i as f32).to_sql(ty, out),
                t if *t == Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                t if *t == Type::TEXT || *t == Type::VARCHAR => i.to_string().to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },

            PgValue::Float(f) => match ty {
                t if *t == Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                t if *t == Type::FLOAT8 => f.to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },

            PgValue::Text(s) => match ty {
                t if *t == Type::TIMESTAMPTZ => DateTime::parse_from_rfc3339(s)
                    .map_err(|e| -> ToSqlError { e.to_string().into() })?
                    .with_timezone(&Utc)
                    .to_sql(ty, out),
                t if *t == Type::TIMESTAMP => {
                    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                        .map_err(|e| -> ToSqlError { e.to_string().into() })?
                        .to_sql(ty, out)
                }
                t if *t == Type::DATE => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map_err(|e| -> ToSqlError { e.to_string().into() })?
                    .to_sql(ty, out),
                t if *t == Type::UUID => uuid::Uuid::parse_str(s)
                    .map_err(|e| -> ToSqlError { e.to_string().into() })?
                    .to_sql(ty, out),
                t if *t == Type::BOOL => matches!(s.as_str(), "true" | "1").to_sql(ty, out),
                t if *t == Type::INT2 || *t == Type::INT4 || *t == Type::INT8 => s
                    .parse::<i64>()
                    .map_err(|e| -> ToSqlError { e.to_string().into() })
                    .and_then(|i| PgValue::Int(i).to_sql(ty, out)),
                t if *t == Type::FLOAT4 || *t == Type::FLOAT8 => s
                    .parse::<f64>()
                    .map_err(|e| -> ToSqlError { e.to_string().into() })
                    .and_then(|f| PgValue::Float(f).to_sql(ty, out)),
                t if *t == Type::JSON || *t == Type::JSONB => {
                    Value::String(s.clone()).to_sql(ty, out)
                }
                _ => s.to_sql(ty, out),
            },

            PgValue::TextArray(items) => items.to_sql(ty, out),

            PgValue::Json(v) => match ty {
                t if *t == Type::JSON || *t == Type::JSONB => v.to_sql(ty, out),
                t if *t == Type::TEXT || *t == Type::VARCHAR => v.to_string().to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        // Coercion is decided per-value at bind time.
        true
    }

    to_sql_checked!();
}
