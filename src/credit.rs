use std::sync::Mutex;

use chrono::{DateTime, TimeDelta, Utc};

use crate::prelude::*;

struct Entry {
    source_id: String,
    watt: f64,
    valid_until: DateTime<Utc>,
}

/// Ledger of expiring savings from loads that were recently turned off.
///
/// While an entry is live, the freed-up wattage is still treated as committed,
/// so it does not get mistaken for fresh surplus. Expiry is lazy: every read
/// prunes the dead entries first.
#[must_use]
#[derive(Default)]
pub struct DecayingCredit {
    entries: Mutex<Vec<Entry>>,
}

impl DecayingCredit {
    /// Record a credit expiring at `as_of + valid_for`.
    ///
    /// Credits from the same source coexist independently.
    pub fn add(&self, source_id: &str, watt: f64, as_of: DateTime<Utc>, valid_for: TimeDelta) {
        self.entries
            .lock()
            .expect("the credit ledger lock must not be poisoned")
            .push(Entry { source_id: source_id.to_owned(), watt, valid_until: as_of + valid_for });
    }

    /// Prune the expired entries and sum up the remaining wattage.
    #[must_use]
    pub fn value(&self, now: DateTime<Utc>) -> f64 {
        let mut entries =
            self.entries.lock().expect("the credit ledger lock must not be poisoned");
        entries.retain(|entry| {
            let live = now < entry.valid_until;
            if !live {
                debug!(source_id = %entry.source_id, watt = entry.watt, "savings credit expired");
            }
            live
        });
        entries.iter().map(|entry| entry.watt).sum()
    }

}
