use ulid::Ulid;

use crate::model::{Ms, Span};

/// One doctor's appointments, sorted by start time.
#[derive(Debug, Default, Clone)]
pub struct DoctorCalendar {
    entries: Vec<(Ms, Ulid)>,
}

impl DoctorCalendar {
    /// Insert keeping `(start, id)` order.
    pub fn insert(&mut self, start: Ms, id: Ulid) {
        let pos = self
            .entries
            .binary_search(&(start, id))
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, (start, id));
    }

    /// Remove by id, returning the start it was filed under.
    pub fn remove(&mut self, id: Ulid) -> Option<Ms> {
        let pos = self.entries.iter().position(|(_, e)| *e == id)?;
        Some(self.entries.remove(pos).0)
    }

    /// Ids whose start lies in `span`.
    pub fn within(&self, span: &Span) -> impl Iterator<Item = Ulid> + '_ {
        let lo = self.entries.partition_point(|(s, _)| *s < span.start);
        let hi = self.entries.partition_point(|(s, _)| *s < span.end);
        self.entries[lo..hi.max(lo)].iter().map(|(_, id)| *id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
