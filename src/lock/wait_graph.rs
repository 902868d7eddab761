//! Wait-for graph between transactions.
//!
//! An edge `a → b` means transaction `a` is waiting for a lock that
//! transaction `b` currently holds. The graph is derived from the lock
//! table on every blocking acquire and checked for a cycle through the
//! requester.

use std::collections::{HashMap, HashSet};

use crate::types::TrxId;

#[derive(Debug, Default)]
pub(crate) struct WaitForGraph {
    graph: HashMap<TrxId, HashSet<TrxId>>,
}

impl WaitForGraph {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_edge(&mut self, from: TrxId, to: TrxId) {
        if from != to {
            self.graph.entry(from).or_default().insert(to);
        }
    }

    /// Whether some path of wait edges leads from `start` back to
    /// `start`
    pub(crate) fn has_cycle_from(&self, start: TrxId) -> bool {
        let mut visited = HashSet::new();
        let mut stack: Vec<TrxId> = self
            .graph
            .get(&start)
            .map(|next| next.iter().copied().collect())
            .unwrap_or_default();

        while let Some(trx) = stack.pop() {
            if trx == start {
                return true;
            }
            if !visited.insert(trx) {
                continue;
            }
            if let Some(next) = self.graph.get(&trx) {
                stack.extend(next.iter().copied());
            }
        }
        false
    }
}
