//! Atomic execution of statement batches.
//!
//! [`transaction`] is the only place that begins, commits or rolls back. It is
//! written against two small seams so it works with any data-access handle:
//!
//! - [`TransactionSource`]: something that can begin a transaction, and commit
//!   or roll it back (implemented for [`PgPool`])
//! - [`StatementExecutor`]: something that can run statements while the
//!   transaction is open (implemented for [`sqlx::Transaction`])

use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgConnection, PgPool, PgRow};
use sqlx::{Executor, Postgres, Row};
use tracing::{debug, error, warn};

use crate::bind::bind_value;
use crate::{Error, Result};

/// A decoded result row: column name to JSON value, in column order.
pub type JsonRow = IndexMap<String, JsonValue>;

/// Result returned from write statements (e.g. INSERT, UPDATE, DELETE).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteQueryResult {
   /// The number of rows affected by the statement.
   pub rows_affected: u64,
}

/// Runs statements on an open transaction.
pub trait StatementExecutor: Send {
   /// Executes one parameterized statement (`$1`, `$2`, ... placeholders).
   fn execute<'a>(
      &'a mut self,
      query: &'a str,
      values: Vec<JsonValue>,
   ) -> BoxFuture<'a, Result<WriteQueryResult>>;

   /// Executes unparameterized SQL, which may contain several statements.
   ///
   /// Used for DDL such as function bodies, which cannot be prepared.
   fn execute_raw<'a>(&'a mut self, sql: &'a str) -> BoxFuture<'a, Result<()>>;

   /// Runs a parameterized query and decodes every row to JSON.
   fn fetch_all<'a>(
      &'a mut self,
      query: &'a str,
      values: Vec<JsonValue>,
   ) -> BoxFuture<'a, Result<Vec<JsonRow>>>;

   /// Executes `statements` in order, stopping at the first failure.
   fn execute_batch<'a>(&'a mut self, statements: &'a [String]) -> BoxFuture<'a, Result<()>> {
      Box::pin(async move {
         for statement in statements {
            self.execute_raw(statement).await?;
         }
         Ok(())
      })
   }
}

/// Hands out transactions.
pub trait TransactionSource: Send + Sync {
   type Transaction: StatementExecutor + 'static;

   fn begin(&self) -> BoxFuture<'_, Result<Self::Transaction>>;

   fn commit(transaction: Self::Transaction) -> BoxFuture<'static, Result<()>>;

   fn rollback(transaction: Self::Transaction) -> BoxFuture<'static, Result<()>>;
}

/// Runs `f` inside one transaction.
///
/// Commits when `f` returns `Ok` and rolls back when it returns `Err`. The
/// transaction is never shared: each call begins its own. If `f` panics or the
/// returned future is dropped, the transaction is dropped unfinished, which for
/// sqlx means it is rolled back when its connection goes back to the pool.
///
/// Errors from `f` or from commit come back as [`Error::TransactionFailed`]. If
/// the rollback fails as well, [`Error::TransactionRollbackFailed`] carries both
/// messages.
///
/// ```no_run
/// use sqlx::PgPool;
/// use sqlx_pg_notify::Operation;
/// use sqlx_pg_trigger_toolkit::{StatementExecutor, TriggerDefinition, build, transaction};
///
/// # async fn example(pool: PgPool) -> sqlx_pg_trigger_toolkit::Result<()> {
/// let statements = build(&TriggerDefinition::new("items", "insert_test").on(Operation::Insert))?;
///
/// transaction(&pool, move |tx| {
///    Box::pin(async move {
///       tx.execute_batch(&statements).await?;
///       tx.execute("INSERT INTO items (name) VALUES ($1)", vec!["lamp".into()])
///          .await?;
///       Ok(())
///    })
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn transaction<S, F, T>(source: &S, f: F) -> Result<T>
where
   S: TransactionSource,
   F: for<'c> FnOnce(&'c mut S::Transaction) -> BoxFuture<'c, Result<T>>,
{
   let mut tx = source
      .begin()
      .await
      .map_err(|e| Error::TransactionFailed(Box::new(e)))?;
   debug!("Transaction started");

   match f(&mut tx).await {
      Ok(value) => {
         S::commit(tx)
            .await
            .map_err(|e| Error::TransactionFailed(Box::new(e)))?;
         debug!("Transaction committed");
         Ok(value)
      }
      Err(e) => {
         warn!(error = %e, "Transaction failed, rolling back");
         match S::rollback(tx).await {
            Ok(()) => Err(Error::TransactionFailed(Box::new(e))),
            Err(rollback_error) => {
               error!(
                  error = %e,
                  rollback_error = %rollback_error,
                  "Rollback failed after transaction error"
               );
               Err(Error::TransactionRollbackFailed {
                  transaction_error: e.to_string(),
                  rollback_error: rollback_error.to_string(),
               })
            }
         }
      }
   }
}

impl TransactionSource for PgPool {
   type Transaction = sqlx::Transaction<'static, Postgres>;

   fn begin(&self) -> BoxFuture<'_, Result<Self::Transaction>> {
      Box::pin(async move { Ok(sqlx::Pool::begin(self).await?) })
   }

   fn commit(transaction: Self::Transaction) -> BoxFuture<'static, Result<()>> {
      Box::pin(async move { Ok(transaction.commit().await?) })
   }

   fn rollback(transaction: Self::Transaction) -> BoxFuture<'static, Result<()>> {
      Box::pin(async move { Ok(transaction.rollback().await?) })
   }
}

impl StatementExecutor for sqlx::Transaction<'static, Postgres> {
   fn execute<'a>(
      &'a mut self,
      query: &'a str,
      values: Vec<JsonValue>,
   ) -> BoxFuture<'a, Result<WriteQueryResult>> {
      Box::pin(async move {
         let mut q = sqlx::query(query);
         for value in values {
            q = bind_value(q, value)?;
         }
         let result = q.execute(&mut **self).await?;
         Ok(WriteQueryResult {
            rows_affected: result.rows_affected(),
         })
      })
   }

   fn execute_raw<'a>(&'a mut self, sql: &'a str) -> BoxFuture<'a, Result<()>> {
      Box::pin(async move {
         let conn: &mut PgConnection = &mut **self;
         conn.execute(sqlx::raw_sql(sql)).await?;
         Ok(())
      })
   }

   fn fetch_all<'a>(
      &'a mut self,
      query: &'a str,
      values: Vec<JsonValue>,
   ) -> BoxFuture<'a, Result<Vec<JsonRow>>> {
      Box::pin(async move {
         let mut q = sqlx::query(query);
         for value in values {
            q = bind_value(q, value)?;
         }
         let rows = q.fetch_all(&mut **self).await?;
         decode_rows(rows)
      })
   }
}

/// Decodes rows into column-ordered JSON maps.
pub fn decode_rows(rows: Vec<PgRow>) -> Result<Vec<JsonRow>> {
   use sqlx::Column;

   let mut values = Vec::with_capacity(rows.len());
   for row in rows {
      let mut value = IndexMap::default();
      for (i, column) in row.columns().iter().enumerate() {
         let v = row.try_get_raw(i)?;
         let v = crate::decode::to_json(v)?;
         value.insert(column.name().to_string(), v);
      }
      values.push(value);
   }
   Ok(values)
}
