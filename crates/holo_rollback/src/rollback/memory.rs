//! In-memory oplog used by tests and offline tooling.

use super::types::{OplogEntry, OplogInterface, OplogIterator, OplogValue, RecordId};

/// Oplog held entirely in memory, stored newest-first.
#[derive(Clone, Debug)]
pub struct InMemoryOplog {
    name: String,
    values: Vec<OplogValue>,
    fail_read_at: Option<usize>,
}

impl InMemoryOplog {
    /// Build an oplog from values in any order; they are sorted newest-first.
    ///
    /// The sort is stable, so values sharing a timestamp keep their relative
    /// order.
    pub fn new(name: impl Into<String>, mut values: Vec<OplogValue>) -> Self {
        values.sort_by(|a, b| b.entry.ts.cmp(&a.entry.ts));
        Self {
            name: name.into(),
            values,
            fail_read_at: None,
        }
    }

    /// Build an oplog from bare entries, assigning record ids in timestamp
    /// order starting at 1.
    pub fn from_entries(name: impl Into<String>, mut entries: Vec<OplogEntry>) -> Self {
        entries.sort_by(|a, b| a.ts.cmp(&b.ts));
        let values = entries
            .into_iter()
            .enumerate()
            .map(|(idx, entry)| OplogValue::new(entry, Some(RecordId(idx as u64 + 1))))
            .collect::<Vec<_>>();
        Self::new(name, values)
    }

    /// Make the read at `position` (0 = newest) fail instead of returning an entry.
    pub fn with_read_failure_at(mut self, position: usize) -> Self {
        self.fail_read_at = Some(position);
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Entries newest-first.
    pub fn values(&self) -> &[OplogValue] {
        &self.values
    }
}

impl OplogInterface for InMemoryOplog {
    fn make_iterator(&self) -> Box<dyn OplogIterator + '_> {
        Box::new(InMemoryOplogIterator {
            oplog: self,
            position: 0,
        })
    }

    fn describe(&self) -> String {
        format!("InMemoryOplog({}, {} entries)", self.name, self.values.len())
    }
}

/// Cursor over an `InMemoryOplog`.
pub struct InMemoryOplogIterator<'a> {
    oplog: &'a InMemoryOplog,
    position: usize,
}

impl OplogIterator for InMemoryOplogIterator<'_> {
    fn next(&mut self) -> anyhow::Result<Option<OplogValue>> {
        if self.oplog.fail_read_at == Some(self.position) {
            anyhow::bail!(
                "injected read failure in {} at position {}",
                self.oplog.name,
                self.position
            );
        }
        let value = self.oplog.values.get(self.position).cloned();
        if value.is_some() {
            self.position += 1;
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollback::Timestamp;

    #[test]
    fn entries_are_served_newest_first_with_record_ids() {
        let oplog = InMemoryOplog::from_entries(
            "remote",
            vec![
                OplogEntry::new(Timestamp::new(3, 0), 30),
                OplogEntry::new(Timestamp::new(1, 0), 10),
                OplogEntry::new(Timestamp::new(2, 0), 20),
            ],
        );
        assert_eq!(oplog.len(), 3);

        let mut iter = oplog.make_iterator();
        let mut seen = Vec::new();
        while let Some(value) = iter.next().expect("read") {
            seen.push((value.entry.h, value.record_id));
        }
        assert_eq!(
            seen,
            vec![
                (30, Some(RecordId(3))),
                (20, Some(RecordId(2))),
                (10, Some(RecordId(1))),
            ]
        );
        assert!(iter.next().expect("read after end").is_none());
    }

    #[test]
    fn describe_names_the_log() {
        let oplog = InMemoryOplog::new("remote", Vec::new());
        assert!(oplog.is_empty());
        assert_eq!(oplog.describe(), "InMemoryOplog(remote, 0 entries)");
    }
}
