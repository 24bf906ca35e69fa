//! SQL codegen for the trigger driver. Ported from the original's
//! `pkg/drivers/trigger/queries.go`, re-expressed as small pure functions
//! instead of one monolithic `getCreateTriggerSqlForEvent`.
//!
//! Naming scheme (`<schema>_<listener_uid>_<operation>`, suffixed `_fn` /
//! `_trigger` / `_event` for the function/trigger/channel respectively) is
//! carried over unchanged from the original, since `parse_channel_name`
//! depends on the channel splitting into exactly four `_`-separated
//! segments (schema, listener UID, operation, the literal `event`).

use crate::error::{Error, Result};
use crate::model::{ListenerConfig, Operation};

/// `<schema>_<listener_uid>_<lowercase op>`, the shared stem for the
/// function, trigger, and channel names of one (listener, operation) pair.
fn unique_identifier(schema: &str, listener_uid: &str, operation: Operation) -> Result<String> {
    let op_name = operation
        .sql_name()
        .ok_or_else(|| Error::trigger("operation must be exactly one of insert/update/delete/truncate"))?;
    Ok(format!("{schema}_{listener_uid}_{}", op_name.to_ascii_lowercase()))
}

pub fn function_name(schema: &str, listener_uid: &str, operation: Operation) -> Result<String> {
    Ok(format!("{}_fn", unique_identifier(schema, listener_uid, operation)?))
}

pub fn trigger_name(schema: &str, listener_uid: &str, operation: Operation) -> Result<String> {
    Ok(format!("{}_trigger", unique_identifier(schema, listener_uid, operation)?))
}

pub fn channel_name(schema: &str, listener_uid: &str, operation: Operation) -> Result<String> {
    Ok(format!("{}_event", unique_identifier(schema, listener_uid, operation)?))
}

/// Splits a channel name into its `(listener_uid, operation)` parts.
/// Requires exactly four `_`-separated segments: schema, listener UID,
/// operation, and the literal `event`.
pub fn parse_channel_name(channel: &str) -> Result<(String, Operation)> {
    let parts: Vec<&str> = channel.split('_').collect();
    if parts.len() != 4 {
        return Err(Error::trigger(format!(
            "channel name '{channel}' must have exactly 4 underscore-separated segments"
        )));
    }
    let [_schema, listener_uid, op_name, suffix] = [parts[0], parts[1], parts[2], parts[3]];
    if suffix != "event" {
        return Err(Error::trigger(format!(
            "channel name '{channel}' does not end in '_event'"
        )));
    }
    let operation = Operation::from_sql_name(op_name)
        .ok_or_else(|| Error::trigger(format!("unknown operation segment '{op_name}'")))?;
    Ok((listener_uid.to_string(), operation))
}

/// Double-quotes each dot-separated segment of a table name
/// (`schema.table` → `"schema"."table"`), confining identifier quoting to
/// names the driver itself generates or reads from the catalog — never to
/// user-supplied values.
pub fn sanitize_table_name(table: &str) -> String {
    table
        .split('.')
        .map(|segment| format!("\"{}\"", segment.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

fn sanitize_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Builds the `CREATE OR REPLACE FUNCTION` + `CREATE OR REPLACE TRIGGER`
/// statements for one (listener, operation, table) combination, plus the
/// channel name the function notifies on.
pub fn create_trigger_sql(
    schema: &str,
    listener_uid: &str,
    config: &ListenerConfig,
    operation: Operation,
) -> Result<(String, String)> {
    let op_name = operation
        .sql_name()
        .ok_or_else(|| Error::trigger("operation must be exactly one of insert/update/delete/truncate"))?;
    let function = sanitize_identifier(&function_name(schema, listener_uid, operation)?);
    let trigger = sanitize_identifier(&trigger_name(schema, listener_uid, operation)?);
    let channel = channel_name(schema, listener_uid, operation)?;
    let table = sanitize_table_name(&config.table);

    let payload_expr = payload_expression(operation, &config.fields);
    let change_guard = change_guard_clause(operation, &config.fields);

    let body = match change_guard {
        Some(guard) => format!(
            "IF {guard} THEN\n    PERFORM pg_notify('{channel}', {payload_expr}::text);\n  END IF;"
        ),
        None => format!("PERFORM pg_notify('{channel}', {payload_expr}::text);"),
    };

    let function_sql = format!(
        "CREATE OR REPLACE FUNCTION {schema_qualified}() RETURNS trigger AS $trigger$\n\
         BEGIN\n  {body}\n  RETURN COALESCE(NEW, OLD);\nEND;\n$trigger$ LANGUAGE plpgsql VOLATILE;",
        schema_qualified = format!("{}.{function}", sanitize_identifier(schema)),
    );

    let trigger_sql = if operation == Operation::TRUNCATE {
        format!(
            "CREATE OR REPLACE TRIGGER {trigger} BEFORE TRUNCATE ON {table} FOR EACH STATEMENT EXECUTE PROCEDURE {}.{function}();",
            sanitize_identifier(schema),
        )
    } else {
        format!(
            "CREATE OR REPLACE TRIGGER {trigger} AFTER {op_name} ON {table} FOR EACH ROW EXECUTE PROCEDURE {}.{function}();",
            sanitize_identifier(schema),
        )
    };

    Ok((format!("{function_sql}\n{trigger_sql}"), channel))
}

pub fn drop_trigger_sql(schema: &str, listener_uid: &str, operation: Operation) -> Result<String> {
    let function = sanitize_identifier(&function_name(schema, listener_uid, operation)?);
    Ok(format!(
        "DROP FUNCTION IF EXISTS {}.{function} CASCADE;",
        sanitize_identifier(schema)
    ))
}

/// The JSON payload expression per operation: TRUNCATE carries no row data;
/// DELETE only the old row; INSERT only the new row; UPDATE both.
fn payload_expression(operation: Operation, fields: &[String]) -> String {
    let old = jsonb_object_expr("OLD", fields);
    let new = jsonb_object_expr("NEW", fields);
    match operation {
        Operation::TRUNCATE => "'null'".to_string(),
        Operation::DELETE => format!("JSONB_BUILD_OBJECT('old', {old})"),
        Operation::INSERT => format!("JSONB_BUILD_OBJECT('new', {new})"),
        Operation::UPDATE => format!("JSONB_BUILD_OBJECT('old', {old}, 'new', {new})"),
        _ => "'null'".to_string(),
    }
}

/// `TO_JSONB(row)` when the listener wants every column, otherwise a
/// `JSONB_BUILD_OBJECT` of just the projected fields — the server-side
/// equivalent of the WAL driver's client-side `Event::project`.
fn jsonb_object_expr(row: &str, fields: &[String]) -> String {
    if fields.is_empty() {
        format!("TO_JSONB({row})")
    } else {
        let pairs = fields
            .iter()
            .map(|f| format!("'{f}', {row}.\"{f}\""))
            .collect::<Vec<_>>()
            .join(", ");
        format!("JSONB_BUILD_OBJECT({pairs})")
    }
}

/// For UPDATE, suppresses notification when none of the projected fields
/// actually changed (`IS DISTINCT FROM` across every listed field, OR'd
/// together). `None` for operations that always notify unconditionally.
fn change_guard_clause(operation: Operation, fields: &[String]) -> Option<String> {
    if operation != Operation::UPDATE || fields.is_empty() {
        return None;
    }
    let clauses = fields
        .iter()
        .map(|f| format!("(OLD.\"{f}\" IS DISTINCT FROM NEW.\"{f}\")"))
        .collect::<Vec<_>>()
        .join(" OR ");
    Some(clauses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_name_round_trips_through_parse() {
        let channel = channel_name("public", "abc123", Operation::INSERT).unwrap();
        assert_eq!(channel, "public_abc123_insert_event");
        let (listener_uid, op) = parse_channel_name(&channel).unwrap();
        assert_eq!(listener_uid, "abc123");
        assert_eq!(op, Operation::INSERT);
    }

    #[test]
    fn parse_channel_name_rejects_wrong_segment_count() {
        assert!(parse_channel_name("too_few_parts").is_err());
        assert!(parse_channel_name("way_too_many_parts_here_event").is_err());
    }

    #[test]
    fn sanitize_table_name_quotes_each_segment() {
        assert_eq!(sanitize_table_name("public.posts"), "\"public\".\"posts\"");
        assert_eq!(sanitize_table_name("posts"), "\"posts\"");
    }

    #[test]
    fn truncate_trigger_uses_before_statement() {
        let config = ListenerConfig::new("public.posts");
        let (sql, channel) = create_trigger_sql("public", "abc123", &config, Operation::TRUNCATE).unwrap();
        assert!(sql.contains("BEFORE TRUNCATE ON \"public\".\"posts\" FOR EACH STATEMENT"));
        assert_eq!(channel, "public_abc123_truncate_event");
    }

    #[test]
    fn update_with_fields_guards_on_is_distinct_from() {
        let config = ListenerConfig::new("public.posts").with_fields(vec!["title".to_string()]);
        let (sql, _) = create_trigger_sql("public", "abc123", &config, Operation::UPDATE).unwrap();
        assert!(sql.contains("IS DISTINCT FROM"));
        assert!(sql.contains("AFTER UPDATE ON"));
    }

    #[test]
    fn drop_sql_cascades() {
        let sql = drop_trigger_sql("public", "abc123", Operation::INSERT).unwrap();
        assert!(sql.starts_with("DROP FUNCTION IF EXISTS"));
        assert!(sql.trim_end().ends_with("CASCADE;"));
    }
}
