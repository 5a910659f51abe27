//! Notify-trigger definitions and the DDL that installs or removes them.
//!
//! A [`TriggerDefinition`] names a table, the mutation events to watch, an
//! optional row condition and the channel to publish on. [`build`] turns it into
//! the statements that create one notify function per channel and one trigger
//! per event; [`build_teardown`] produces the statements that remove them again.
//!
//! Generation is pure text. Running the statements is the job of
//! [`transaction`](crate::transaction).
//!
//! Object names are derived from the definition, so installing the same
//! definition twice replaces the existing objects instead of adding new ones.
//! Every name is double-quoted in the generated SQL, so mixed-case tables such
//! as `"Item"` keep their case:
//!
//! | Object   | Name                                  |
//! |----------|---------------------------------------|
//! | function | `<schema>.<channel>_notify_func`      |
//! | trigger  | `<table>_<channel>_<event>_trigger`   |

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx_pg_notify::Operation;

use crate::{Error, Result};

/// PostgreSQL truncates identifiers longer than this (NAMEDATALEN - 1).
pub const MAX_IDENTIFIER_BYTES: usize = 63;

static IDENTIFIER_REGEX: LazyLock<Regex> =
   LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

const DEFAULT_SCHEMA: &str = "public";

/// What to watch and where to publish it.
///
/// ```
/// use sqlx_pg_notify::Operation;
/// use sqlx_pg_trigger_toolkit::TriggerDefinition;
///
/// let definition = TriggerDefinition::new("items", "item_status")
///    .on(Operation::Update)
///    .when("OLD.status IS DISTINCT FROM NEW.status AND NEW.status = 'done'");
///
/// assert_eq!(definition.function_name(), "item_status_notify_func");
/// assert_eq!(
///    definition.trigger_name(Operation::Update),
///    "items_item_status_update_trigger"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerDefinition {
   schema: String,
   table: String,
   events: BTreeSet<Operation>,
   condition: Option<String>,
   channel: String,
}

impl TriggerDefinition {
   /// Starts a definition for `table` in the `public` schema publishing on `channel`.
   ///
   /// At least one event must be added with [`on`](Self::on) or
   /// [`on_all`](Self::on_all) before the definition can be built.
   pub fn new(table: impl Into<String>, channel: impl Into<String>) -> Self {
      Self {
         schema: DEFAULT_SCHEMA.to_string(),
         table: table.into(),
         events: BTreeSet::new(),
         condition: None,
         channel: channel.into(),
      }
   }

   pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
      self.schema = schema.into();
      self
   }

   /// Adds a mutation event. Adding the same event twice has no effect.
   pub fn on(mut self, operation: Operation) -> Self {
      self.events.insert(operation);
      self
   }

   /// Watches INSERT, UPDATE and DELETE.
   pub fn on_all(mut self) -> Self {
      self.events.extend(Operation::ALL);
      self
   }

   /// Guards every trigger with a `WHEN (...)` row condition.
   ///
   /// The condition is inserted verbatim and may reference `OLD` and `NEW`. The
   /// server rejects `OLD` on INSERT triggers and `NEW` on DELETE triggers, so
   /// a condition using either should only be combined with events that have
   /// that row. A blank condition is treated as none.
   pub fn when(mut self, condition: impl Into<String>) -> Self {
      let condition = condition.into();
      self.condition = (!condition.trim().is_empty()).then_some(condition);
      self
   }

   pub fn schema(&self) -> &str {
      &self.schema
   }

   pub fn table(&self) -> &str {
      &self.table
   }

   pub fn channel(&self) -> &str {
      &self.channel
   }

   pub fn condition(&self) -> Option<&str> {
      self.condition.as_deref()
   }

   /// Events in INSERT, UPDATE, DELETE order.
   pub fn events(&self) -> impl Iterator<Item = Operation> + '_ {
      self.events.iter().copied()
   }

   pub fn function_name(&self) -> String {
      format!("{}_notify_func", self.channel)
   }

   pub fn trigger_name(&self, operation: Operation) -> String {
      format!(
         "{}_{}_{}_trigger",
         self.table,
         self.channel,
         operation.as_str().to_ascii_lowercase()
      )
   }

   /// Checks identifiers, generated names and events.
   pub fn validate(&self) -> Result<()> {
      validate_identifier("schema", &self.schema)?;
      validate_identifier("table", &self.table)?;
      validate_identifier("channel", &self.channel)?;

      if self.events.is_empty() {
         return Err(Error::NoTriggerEvents {
            table: self.table.clone(),
            channel: self.channel.clone(),
         });
      }

      // Truncated names could make two events share one trigger.
      validate_identifier("function name", &self.function_name())?;
      for operation in self.events() {
         validate_identifier("trigger name", &self.trigger_name(operation))?;
      }

      Ok(())
   }

   fn qualified_table(&self) -> String {
      format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
   }

   fn qualified_function(&self) -> String {
      format!(
         "{}.{}",
         quote_ident(&self.schema),
         quote_ident(&self.function_name())
      )
   }
}

/// Double-quotes `name` for use as an SQL identifier, doubling embedded quotes.
///
/// ```
/// use sqlx_pg_trigger_toolkit::quote_ident;
///
/// assert_eq!(quote_ident("Item"), r#""Item""#);
/// assert_eq!(quote_ident(r#"a"b"#), r#""a""b""#);
/// ```
pub fn quote_ident(name: &str) -> String {
   format!("\"{}\"", name.replace('"', "\"\""))
}

/// Checks that `value` is a simple identifier: ASCII letters, digits and
/// underscores, not starting with a digit. Case is preserved.
pub fn validate_identifier(kind: &'static str, value: &str) -> Result<()> {
   let reason = if value.len() > MAX_IDENTIFIER_BYTES {
      "longer than 63 bytes"
   } else if !IDENTIFIER_REGEX.is_match(value) {
      "must match [A-Za-z_][A-Za-z0-9_]*"
   } else {
      return Ok(());
   };

   Err(Error::InvalidIdentifier {
      kind,
      value: value.to_string(),
      reason,
   })
}

/// Generates the statements that install `definition`.
///
/// The first statement creates (or replaces) the channel's notify function, which
/// publishes `row_to_json(OLD)` for DELETE and `row_to_json(NEW)` otherwise. It is
/// followed by a `DROP TRIGGER IF EXISTS` / `CREATE TRIGGER` pair per event.
pub fn build(definition: &TriggerDefinition) -> Result<Vec<String>> {
   definition.validate()?;

   let mut statements = Vec::with_capacity(1 + definition.events.len() * 2);
   statements.push(notify_function(definition));

   for operation in definition.events() {
      let trigger = quote_ident(&definition.trigger_name(operation));
      statements.push(format!(
         "DROP TRIGGER IF EXISTS {trigger} ON {}",
         definition.qualified_table()
      ));

      let mut create = format!(
         "CREATE TRIGGER {trigger} AFTER {operation} ON {} FOR EACH ROW",
         definition.qualified_table()
      );
      if let Some(condition) = definition.condition() {
         let _ = write!(create, " WHEN ({})", condition.trim());
      }
      let _ = write!(
         create,
         " EXECUTE FUNCTION {}()",
         definition.qualified_function()
      );
      statements.push(create);
   }

   Ok(statements)
}

/// Generates the statements that remove what [`build`] installs.
///
/// The function is dropped without `CASCADE`: if another table's trigger still
/// publishes through the same channel function, the drop fails and the
/// surrounding transaction rolls back.
pub fn build_teardown(definition: &TriggerDefinition) -> Result<Vec<String>> {
   definition.validate()?;

   let mut statements: Vec<String> = definition
      .events()
      .map(|operation| {
         format!(
            "DROP TRIGGER IF EXISTS {} ON {}",
            quote_ident(&definition.trigger_name(operation)),
            definition.qualified_table()
         )
      })
      .collect();
   statements.push(format!(
      "DROP FUNCTION IF EXISTS {}()",
      definition.qualified_function()
   ));

   Ok(statements)
}

fn notify_function(definition: &TriggerDefinition) -> String {
   // Validated channel names contain no quotes, so the literal needs no escaping.
   // It stays case-exact to match the quoted name LISTEN uses.
   let channel = &definition.channel;
   format!(
      "CREATE OR REPLACE FUNCTION {function}() RETURNS trigger AS $$
BEGIN
  IF TG_OP = 'DELETE' THEN
    PERFORM pg_notify('{channel}', json_build_object('operation', TG_OP, 'timestamp', NOW(), 'data', row_to_json(OLD))::text);
    RETURN OLD;
  END IF;
  PERFORM pg_notify('{channel}', json_build_object('operation', TG_OP, 'timestamp', NOW(), 'data', row_to_json(NEW))::text);
  RETURN NEW;
END;
$$ LANGUAGE plpgsql",
      function = definition.qualified_function(),
   )
}
