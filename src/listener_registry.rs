//! Per-table listener registry (C2).
//!
//! Indexed by fully-qualified table name, mapping listener-UID to its
//! subscribed operation mask and column projection. Mutated on attach/detach
//! (control paths); read on every dispatched tuple (the hot path). Per
//! spec.md §5 both paths need reader-safe concurrent access with exclusive
//! writers — `pgdog` (the other heavily-concurrent example in this pack)
//! reaches for `parking_lot::RwLock` for exactly this shape, so we do too.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::model::{ListenerConfig, Operation};

#[derive(Debug, Clone)]
struct Subscription {
    mask: Operation,
    fields: Vec<String>,
}

#[derive(Default)]
pub struct ListenerRegistry {
    // qualified table name -> listener-uid -> subscription
    by_table: RwLock<HashMap<String, HashMap<String, Subscription>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener_uid` for `mask` operations on `config.table`.
    pub fn attach(&self, listener_uid: &str, config: &ListenerConfig, mask: Operation) {
        let table = config.qualified_table();
        let mut guard = self.by_table.write();
        guard
            .entry(table)
            .or_default()
            .insert(
                listener_uid.to_string(),
                Subscription {
                    mask,
                    fields: config.fields.clone(),
                },
            );
    }

    /// Removes `mask` operations from `listener_uid`'s subscription, for
    /// every table it's registered under. If the resulting mask is empty the
    /// listener is removed entirely (mirrors spec.md §4.7's
    /// `HandleEventListenStop` as the reverse of `Start`).
    pub fn detach(&self, listener_uid: &str, mask: Operation) {
        let mut guard = self.by_table.write();
        for listeners in guard.values_mut() {
            if let Some(sub) = listeners.get_mut(listener_uid) {
                sub.mask = Operation::from_bits(sub.mask.bits() & !mask.bits());
            }
        }
        for listeners in guard.values_mut() {
            listeners.retain(|_, sub| sub.mask != Operation::empty());
        }
    }

    /// Returns `(listener_uid, fields)` for every listener subscribed to
    /// `table` for `operation`. Empty `fields` means "full row".
    pub fn matching(&self, table: &str, operation: Operation) -> Vec<(String, Vec<String>)> {
        let guard = self.by_table.read();
        let Some(listeners) = guard.get(table) else {
            return Vec::new();
        };
        listeners
            .iter()
            .filter(|(_, sub)| sub.mask.contains(operation))
            .map(|(uid, sub)| (uid.clone(), sub.fields.clone()))
            .collect()
    }

    /// Every table with at least one active listener. Used by drivers to
    /// know which tables require server-side artifacts (publication members,
    /// triggers).
    pub fn tables(&self) -> Vec<String> {
        self.by_table.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_filters_by_mask_and_table() {
        let reg = ListenerRegistry::new();
        let cfg = ListenerConfig::new("public.posts");
        reg.attach("A", &cfg, Operation::INSERT);
        reg.attach("B", &cfg, Operation::UPDATE);

        let insert_matches = reg.matching("public.posts", Operation::INSERT);
        assert_eq!(insert_matches.len(), 1);
        assert_eq!(insert_matches[0].0, "A");

        let update_matches = reg.matching("public.posts", Operation::UPDATE);
        assert_eq!(update_matches.len(), 1);
        assert_eq!(update_matches[0].0, "B");

        assert!(reg.matching("public.other", Operation::INSERT).is_empty());
    }

    #[test]
    fn detach_removes_listener_once_mask_empties() {
        let reg = ListenerRegistry::new();
        let cfg = ListenerConfig::new("public.posts");
        reg.attach("A", &cfg, Operation::INSERT | Operation::DELETE);

        reg.detach("A", Operation::INSERT);
        assert_eq!(reg.matching("public.posts", Operation::DELETE).len(), 1);
        assert!(reg.matching("public.posts", Operation::INSERT).is_empty());

        reg.detach("A", Operation::DELETE);
        assert!(reg.matching("public.posts", Operation::DELETE).is_empty());
        assert!(reg.tables().iter().all(|t| reg.matching(t, Operation::ALL).is_empty()));
    }
}
