//! pgoutput logical-replication message shapes and the replication-state
//! catalog (C3), grounded on the teacher's `src/protocol/messages.rs`.

use std::collections::HashMap;

pub type Oid = u32;
pub type Xid = u32;
pub type XLogRecPtr = u64;
pub type TimestampTz = i64;

pub const INVALID_XLOG_REC_PTR: XLogRecPtr = 0;

/// Seconds between the Unix epoch and PostgreSQL's epoch (2000-01-01).
pub const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;

#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub key_flag: bool,
    pub column_name: String,
    pub column_type: Oid,
    pub atttypmod: i32,
}

#[derive(Debug, Clone)]
pub struct RelationInfo {
    pub oid: Oid,
    pub namespace: String,
    pub relation_name: String,
    pub replica_identity: char,
    pub column_count: i16,
    pub columns: Vec<ColumnInfo>,
}

impl RelationInfo {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.namespace, self.relation_name)
    }
}

/// One column's wire-format value within a tuple.
#[derive(Debug, Clone)]
pub enum ColumnData {
    Null,
    /// Unchanged TOAST value: present on the wire but not re-sent. Never
    /// surfaced in the decoded event — callers observe its absence from the
    /// resulting map, not a variant.
    Unchanged,
    Text(String),
}

#[derive(Debug, Clone, Default)]
pub struct TupleData {
    pub columns: Vec<(String, ColumnData, Oid)>,
}

#[derive(Debug, Clone)]
pub enum ReplicationMessage {
    Begin {
        final_lsn: XLogRecPtr,
        timestamp: TimestampTz,
        xid: Xid,
    },
    Commit {
        flags: u8,
        commit_lsn: XLogRecPtr,
        end_lsn: XLogRecPtr,
        timestamp: TimestampTz,
    },
    Relation {
        relation: RelationInfo,
    },
    Insert {
        xid: Option<Xid>,
        relation_oid: Oid,
        new_tuple: TupleData,
    },
    Update {
        xid: Option<Xid>,
        relation_oid: Oid,
        old_tuple: Option<TupleData>,
        new_tuple: TupleData,
    },
    Delete {
        xid: Option<Xid>,
        relation_oid: Oid,
        old_tuple: TupleData,
    },
    Truncate {
        xid: Option<Xid>,
        relation_oids: Vec<Oid>,
    },
    StreamStart {
        xid: Xid,
    },
    StreamStop,
    StreamCommit {
        xid: Xid,
        commit_lsn: XLogRecPtr,
        end_lsn: XLogRecPtr,
        timestamp: TimestampTz,
    },
    StreamAbort {
        xid: Xid,
        sub_xid: Xid,
    },
}

/// Tracks the relation catalog and LSN bookkeeping across one replication
/// session, exactly as the teacher's `ReplicationState` does.
#[derive(Debug, Default)]
pub struct ReplicationState {
    pub relations: HashMap<Oid, RelationInfo>,
    pub received_lsn: XLogRecPtr,
    pub flushed_lsn: XLogRecPtr,
    pub applied_lsn: XLogRecPtr,
    pub last_feedback_time: Option<std::time::Instant>,
}

impl ReplicationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_relation(&mut self, relation: RelationInfo) {
        self.relations.insert(relation.oid, relation);
    }

    pub fn get_relation(&self, oid: Oid) -> Option<&RelationInfo> {
        self.relations.get(&oid)
    }

    pub fn update_received_lsn(&mut self, lsn: XLogRecPtr) {
        self.received_lsn = lsn;
    }

    /// Advances the position reported to the server as flushed. Must only be
    /// called with a transaction's commit LSN (`SessionState::last_written_lsn`),
    /// never with `received_lsn` directly: acknowledging past an in-flight or
    /// aborted transaction would defeat replay-on-reconnect.
    pub fn update_flushed_lsn(&mut self, lsn: XLogRecPtr) {
        self.flushed_lsn = lsn;
    }

    pub fn update_applied_lsn(&mut self, lsn: XLogRecPtr) {
        self.applied_lsn = lsn;
    }

    pub fn update_feedback_time(&mut self, when: std::time::Instant) {
        self.last_feedback_time = Some(when);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relation(oid: Oid) -> RelationInfo {
        RelationInfo {
            oid,
            namespace: "public".into(),
            relation_name: "posts".into(),
            replica_identity: 'd',
            column_count: 1,
            columns: vec![ColumnInfo {
                key_flag: true,
                column_name: "id".into(),
                column_type: 23,
                atttypmod: -1,
            }],
        }
    }

    #[test]
    fn test_replication_state_creation() {
        let state = ReplicationState::new();
        assert!(state.relations.is_empty());
        assert_eq!(state.received_lsn, INVALID_XLOG_REC_PTR);
    }

    #[test]
    fn test_lsn_updates() {
        let mut state = ReplicationState::new();
        state.update_received_lsn(100);
        assert_eq!(state.received_lsn, 100);
        assert_eq!(state.flushed_lsn, 0);
    }

    #[test]
    fn flushed_lsn_advances_independently_of_received() {
        let mut state = ReplicationState::new();
        state.update_received_lsn(200);
        state.update_flushed_lsn(150);
        assert_eq!(state.received_lsn, 200);
        assert_eq!(state.flushed_lsn, 150);
    }

    #[test]
    fn test_relation_management() {
        let mut state = ReplicationState::new();
        state.add_relation(relation(5));
        assert_eq!(state.get_relation(5).unwrap().qualified_name(), "public.posts");
        assert!(state.get_relation(6).is_none());
    }

    #[test]
    fn test_feedback_timing() {
        let mut state = ReplicationState::new();
        assert!(state.last_feedback_time.is_none());
        let now = std::time::Instant::now();
        state.update_feedback_time(now);
        assert_eq!(state.last_feedback_time, Some(now));
    }
}
