//! The event contract: operations, listener configuration, and the event
//! variants delivered to subscribers (C1, part of C2's data shape).
//!
//! Grounded on `pkg/types/listeners.go` in the original source: the Go
//! driver models `Operation` as a `uint8` bitset and `Event` as an
//! interface implemented by four structs. Rust prefers a closed enum with
//! an inherent accessor over an open interface, so `Event` is a tagged enum
//! and `Operation` stays a bitflag newtype (`Contains` is a single AND, per
//! spec.md §9).

use std::collections::HashMap;

use serde_json::Value;

/// A decoded column value, or explicit SQL NULL. Unchanged-TOAST columns are
/// never represented here — they're simply absent from the map.
pub type ColumnValue = Value;

/// Column name → decoded value for one row version.
pub type EventData = HashMap<String, ColumnValue>;

/// Operation bit-flags: {Insert=1, Update=2, Delete=4, Truncate=8}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operation(u8);

impl Operation {
    pub const INSERT: Operation = Operation(1 << 0);
    pub const UPDATE: Operation = Operation(1 << 1);
    pub const DELETE: Operation = Operation(1 << 2);
    pub const TRUNCATE: Operation = Operation(1 << 3);
    pub const ALL: Operation = Operation(
        Self::INSERT.0 | Self::UPDATE.0 | Self::DELETE.0 | Self::TRUNCATE.0,
    );

    pub const fn empty() -> Self {
        Operation(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits(bits: u8) -> Self {
        Operation(bits & Self::ALL.0)
    }

    /// Single-AND membership test, per spec.md §9.
    pub const fn contains(self, other: Operation) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Operation) -> Self {
        Operation(self.0 | other.0)
    }

    pub fn name(self) -> &'static str {
        match self {
            Operation::INSERT => "insert",
            Operation::UPDATE => "update",
            Operation::DELETE => "delete",
            Operation::TRUNCATE => "truncate",
            _ => "unknown",
        }
    }

    /// Parses the upper-case SQL operation keyword used by the trigger
    /// driver's generated `AFTER <op> ON ...` clause and channel names.
    pub fn from_sql_name(name: &str) -> Option<Operation> {
        match name.to_ascii_uppercase().as_str() {
            "INSERT" => Some(Operation::INSERT),
            "UPDATE" => Some(Operation::UPDATE),
            "DELETE" => Some(Operation::DELETE),
            "TRUNCATE" => Some(Operation::TRUNCATE),
            _ => None,
        }
    }

    pub fn sql_name(self) -> Option<&'static str> {
        match self {
            Operation::INSERT => Some("INSERT"),
            Operation::UPDATE => Some("UPDATE"),
            Operation::DELETE => Some("DELETE"),
            Operation::TRUNCATE => Some("TRUNCATE"),
            _ => None,
        }
    }
}

impl std::ops::BitOr for Operation {
    type Output = Operation;
    fn bitor(self, rhs: Operation) -> Operation {
        self.union(rhs)
    }
}

/// Configuration for one subscription, per spec.md §3.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Table name, optionally schema-qualified (`public.posts`). Schema
    /// defaults to `public` when absent.
    pub table: String,
    /// Field projection. Empty means all columns (`SELECT *`).
    pub fields: Vec<String>,
    /// Max parallel callback invocations. `None` means unbounded (the
    /// original's `-1`); `Some(1)` (the default) is strictly sequential.
    pub max_parallel_process: Option<usize>,
}

impl ListenerConfig {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            fields: Vec::new(),
            max_parallel_process: Some(1),
        }
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_max_parallel_process(mut self, max: Option<usize>) -> Self {
        self.max_parallel_process = max;
        self
    }

    /// Schema-qualified table name, defaulting the schema to `public`.
    pub fn qualified_table(&self) -> String {
        if self.table.contains('.') {
            self.table.clone()
        } else {
            format!("public.{}", self.table)
        }
    }
}

/// One row-change event, tagged by operation. Consumers dispatch on the
/// variant rather than on an open interface.
#[derive(Debug, Clone)]
pub enum Event {
    Insert { new: EventData },
    Update { old: Option<EventData>, new: EventData },
    Delete { old: EventData },
    Truncate,
}

impl Event {
    pub const fn operation(&self) -> Operation {
        match self {
            Event::Insert { .. } => Operation::INSERT,
            Event::Update { .. } => Operation::UPDATE,
            Event::Delete { .. } => Operation::DELETE,
            Event::Truncate => Operation::TRUNCATE,
        }
    }

    /// Projects the event's tuple(s) down to the listener's field list.
    /// Empty `fields` is a no-op (full row). This is the WAL driver's
    /// best-effort client-side filtering named in spec.md §4.4/Open
    /// Questions — the trigger driver never needs it, since its generated
    /// SQL already projects server-side.
    pub fn project(&self, fields: &[String]) -> Event {
        if fields.is_empty() {
            return self.clone();
        }
        let keep = |data: &EventData| -> EventData {
            data.iter()
                .filter(|(k, _)| fields.iter().any(|f| f == *k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        match self {
            Event::Insert { new } => Event::Insert { new: keep(new) },
            Event::Update { old, new } => Event::Update {
                old: old.as_ref().map(keep),
                new: keep(new),
            },
            Event::Delete { old } => Event::Delete { old: keep(old) },
            Event::Truncate => Event::Truncate,
        }
    }
}

/// A listener-targeted event, the unit sent over the dispatch channel.
#[derive(Debug, Clone)]
pub struct DatabaseEvent {
    pub listener_uid: String,
    pub event: Event,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_contains_is_bitwise() {
        let mask = Operation::INSERT | Operation::DELETE;
        assert!(mask.contains(Operation::INSERT));
        assert!(mask.contains(Operation::DELETE));
        assert!(!mask.contains(Operation::UPDATE));
        assert!(Operation::ALL.contains(Operation::TRUNCATE));
    }

    #[test]
    fn sql_name_round_trips() {
        for op in [
            Operation::INSERT,
            Operation::UPDATE,
            Operation::DELETE,
            Operation::TRUNCATE,
        ] {
            let name = op.sql_name().unwrap();
            assert_eq!(Operation::from_sql_name(name), Some(op));
        }
    }

    #[test]
    fn qualified_table_defaults_schema_to_public() {
        let l = ListenerConfig::new("posts");
        assert_eq!(l.qualified_table(), "public.posts");
        let l2 = ListenerConfig::new("app.posts");
        assert_eq!(l2.qualified_table(), "app.posts");
    }

    #[test]
    fn project_keeps_only_listed_fields() {
        let mut new = EventData::new();
        new.insert("id".into(), serde_json::json!(1));
        new.insert("title".into(), serde_json::json!("x"));
        new.insert("body".into(), serde_json::json!("y"));
        let ev = Event::Insert { new };

        let projected = ev.project(&["title".to_string()]);
        match projected {
            Event::Insert { new } => {
                assert_eq!(new.len(), 1);
                assert_eq!(new.get("title").unwrap(), &serde_json::json!("x"));
            }
            _ => panic!("expected insert"),
        }
    }
}
