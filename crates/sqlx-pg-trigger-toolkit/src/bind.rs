use serde_json::Value as JsonValue;
use sqlx::Postgres;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;

use crate::{Error, Result};

/// Binds a JSON value to a query parameter.
///
/// | JSON            | Parameter type |
/// |-----------------|----------------|
/// | `null`          | `TEXT` null    |
/// | bool            | `BOOL`         |
/// | integer         | `INT8`         |
/// | other number    | `FLOAT8`       |
/// | string          | `TEXT`         |
/// | array or object | `JSONB`        |
///
/// PostgreSQL applies assignment casts for most column types. Where it does
/// not (a `null` into an integer column, for example), cast in SQL: `$1::int4`.
///
/// Integers above `i64::MAX` are rejected rather than rounded through `FLOAT8`;
/// pass them as strings and cast in SQL (`$1::numeric`).
pub fn bind_value<'q>(
   query: Query<'q, Postgres, PgArguments>,
   value: JsonValue,
) -> Result<Query<'q, Postgres, PgArguments>> {
   let query = match value {
      JsonValue::Null => query.bind(None::<String>),
      JsonValue::Bool(b) => query.bind(b),
      JsonValue::String(s) => query.bind(s),
      JsonValue::Number(number) => {
         if let Some(int_val) = number.as_i64() {
            query.bind(int_val)
         } else if number.is_u64() {
            return Err(Error::UnsupportedDatatype(format!(
               "integer {number} does not fit in INT8"
            )));
         } else {
            query.bind(number.as_f64().unwrap_or_default())
         }
      }
      value @ (JsonValue::Array(_) | JsonValue::Object(_)) => query.bind(value),
   };
   Ok(query)
}
