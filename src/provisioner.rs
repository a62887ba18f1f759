//! # Trigger provisioning
//!
//! Installs and removes the per-table notification function and row-level
//! trigger that feed a change stream. For table `user` the objects are:
//!
//! - function `notify_user_changes()`
//! - trigger `user_changes_trigger` on `user`, `AFTER <ops> FOR EACH ROW`
//! - notifications on channel `user_changes`
//!
//! Installation is create-or-replace for the function and drop-then-create for
//! the trigger, so repeating it never accumulates duplicates. Removal uses
//! `IF EXISTS` throughout and is safe to repeat.

use sqlx::{PgPool, Row};
use tracing::{debug, info, instrument};

use crate::error::{Result, RowNotifyError};
use crate::events::OperationSet;
use crate::logging::log_error;
use crate::sanitize::{quote_identifier, sanitize_identifier};
use crate::subscription::{channel_name, function_name, trigger_name, FieldSelection};

/// `json_build_object` takes at most 100 arguments, i.e. 50 key/value pairs
const MAX_PAIRS_PER_OBJECT: usize = 50;

/// Catalog view of the objects installed for one table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriggerStatus {
    pub function_count: i64,
    pub trigger_count: i64,
}

impl TriggerStatus {
    pub fn is_installed(&self) -> bool {
        self.function_count == 1 && self.trigger_count == 1
    }

    pub fn is_absent(&self) -> bool {
        self.function_count == 0 && self.trigger_count == 0
    }
}

/// Issues trigger DDL over a short-lived setup connection
#[derive(Clone)]
pub struct TriggerProvisioner {
    pool: PgPool,
}

impl std::fmt::Debug for TriggerProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerProvisioner")
            .field("pool", &"PgPool")
            .finish()
    }
}

impl TriggerProvisioner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Install (or replace) the notification function and trigger for `table`.
    ///
    /// All three statements run in one transaction.
    #[instrument(skip(self, selection), fields(table = %table, operations = %operations))]
    pub async fn install(
        &self,
        table: &str,
        selection: &FieldSelection,
        operations: OperationSet,
    ) -> Result<()> {
        let table = checked_table(table)?;
        if operations.is_empty() {
            return Err(RowNotifyError::NoOperations);
        }

        let statements = [
            Self::function_sql(&table, selection)?,
            Self::drop_trigger_sql(&table),
            Self::create_trigger_sql(&table, operations),
        ];

        debug!("Installing change trigger");

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| provisioning_failed(&table, "install", e))?;

        for sql in &statements {
            sqlx::query(sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| provisioning_failed(&table, "install", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| provisioning_failed(&table, "install", e))?;

        info!(
            function = %function_name(&table),
            trigger = %trigger_name(&table),
            channel = %channel_name(&table),
            "Change trigger installed"
        );
        Ok(())
    }

    /// Drop the trigger, then the function. Missing objects are not an error.
    #[instrument(skip(self), fields(table = %table))]
    pub async fn uninstall(&self, table: &str) -> Result<()> {
        let table = checked_table(table)?;

        for sql in [Self::drop_trigger_sql(&table), Self::drop_function_sql(&table)] {
            sqlx::query(&sql)
                .execute(&self.pool)
                .await
                .map_err(|e| provisioning_failed(&table, "uninstall", e))?;
        }

        info!("Change trigger removed");
        Ok(())
    }

    /// Count the generated function and trigger for `table` in the catalogs
    #[instrument(skip(self), fields(table = %table))]
    pub async fn status(&self, table: &str) -> Result<TriggerStatus> {
        let table = checked_table(table)?;

        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM pg_proc WHERE proname = $1) AS function_count,
                (SELECT COUNT(*)
                   FROM pg_trigger t
                   JOIN pg_class c ON c.oid = t.tgrelid
                  WHERE t.tgname = $2
                    AND c.relname = $3
                    AND NOT t.tgisinternal) AS trigger_count
            "#,
        )
        .bind(function_name(&table))
        .bind(trigger_name(&table))
        .bind(&table)
        .fetch_one(&self.pool)
        .await?;

        Ok(TriggerStatus {
            function_count: row.try_get("function_count")?,
            trigger_count: row.try_get("trigger_count")?,
        })
    }

    /// `CREATE OR REPLACE FUNCTION` statement for the table's notification function.
    ///
    /// Fails when a projected field has no usable identifier characters.
    pub fn function_sql(table: &str, fields: &FieldSelection) -> Result<String> {
        let table = sanitize_identifier(table);
        Ok(format!(
            r#"CREATE OR REPLACE FUNCTION {function}() RETURNS trigger AS $$
DECLARE
    row_data JSON;
BEGIN
    IF TG_OP = 'DELETE' THEN
        row_data := row_to_json(OLD);
    ELSE
        row_data := {new_row};
    END IF;

    PERFORM pg_notify(
        '{channel}',
        json_build_object(
            'operation', TG_OP,
            'timestamp', to_char(NOW() AT TIME ZONE 'UTC', 'YYYY-MM-DD"T"HH24:MI:SS.MS"Z"'),
            'data', row_data
        )::text
    );

    RETURN NULL;
END;
$$ LANGUAGE plpgsql"#,
            function = quote_identifier(&function_name(&table)),
            new_row = new_row_expression(fields)?,
            channel = channel_name(&table),
        ))
    }

    pub fn drop_trigger_sql(table: &str) -> String {
        let table = sanitize_identifier(table);
        format!(
            "DROP TRIGGER IF EXISTS {} ON {}",
            quote_identifier(&trigger_name(&table)),
            quote_identifier(&table)
        )
    }

    pub fn create_trigger_sql(table: &str, operations: OperationSet) -> String {
        let table = sanitize_identifier(table);
        format!(
            "CREATE TRIGGER {} AFTER {} ON {} FOR EACH ROW EXECUTE FUNCTION {}()",
            quote_identifier(&trigger_name(&table)),
            operations.to_trigger_clause(),
            quote_identifier(&table),
            quote_identifier(&function_name(&table))
        )
    }

    pub fn drop_function_sql(table: &str) -> String {
        format!(
            "DROP FUNCTION IF EXISTS {}()",
            quote_identifier(&function_name(table))
        )
    }
}

/// Payload expression for the INSERT/UPDATE row image.
///
/// Projections keep the requested field order; past 50 fields the chunks are
/// merged as jsonb, which orders keys by PostgreSQL's own rules.
fn new_row_expression(fields: &FieldSelection) -> Result<String> {
    if fields.is_all() {
        return Ok("row_to_json(NEW)".to_string());
    }

    let mut columns = Vec::with_capacity(fields.fields().len());
    for field in fields.fields() {
        let column = sanitize_identifier(field);
        if column.is_empty() {
            return Err(RowNotifyError::config(format!(
                "Field name {field:?} contains no usable identifier characters"
            )));
        }
        columns.push(column);
    }

    let objects: Vec<String> = columns
        .chunks(MAX_PAIRS_PER_OBJECT)
        .map(|chunk| {
            let pairs = chunk
                .iter()
                .map(|column| format!("'{column}', NEW.\"{column}\""))
                .collect::<Vec<_>>()
                .join(", ");
            format!("json_build_object({pairs})")
        })
        .collect();

    match objects.as_slice() {
        [single] => Ok(single.clone()),
        chunks => Ok(format!(
            "({})::json",
            chunks
                .iter()
                .map(|object| format!("{object}::jsonb"))
                .collect::<Vec<_>>()
                .join(" || ")
        )),
    }
}

fn checked_table(table: &str) -> Result<String> {
    let sanitized = sanitize_identifier(table);
    if sanitized.is_empty() {
        return Err(RowNotifyError::config(format!(
            "Table name {table:?} contains no usable identifier characters"
        )));
    }
    Ok(sanitized)
}

fn provisioning_failed(table: &str, stage: &str, source: sqlx::Error) -> RowNotifyError {
    log_error(
        "provisioner",
        stage,
        &source.to_string(),
        Some(&format!("table={table}")),
    );
    RowNotifyError::provisioning(table, source)
}
