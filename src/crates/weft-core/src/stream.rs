//! Append-only journal of sequenced records
//!
//! A [`StreamRegistry`] is a registry of [`Record`]s with three extra
//! guarantees:
//!
//! - **Monotonic seq** — every append carries a seq strictly greater than
//!   everything before it; a missing seq is assigned `max_seq + 1`, an
//!   out-of-order or duplicate seq is a [`EngineError::SequenceViolation`].
//! - **Append-only** — removal is always an error; an "update" is a new
//!   record with a fresh seq.
//! - **Markers & sections** — [`StreamRegistry::push_records`] lands a batch
//!   atomically and drops a named marker at its first seq. Sections are
//!   half-open: `get_section(name, type)` yields records from the marker up
//!   to (not including) the next marker of the same type, so sections of one
//!   type never overlap.
//!
//! Channels are derived, not a separate index: a record is on channel `x`
//! when its type is `x` or it carries the `channel:x` tag.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::entity::{Criteria, Matchable, MatchScope};
use crate::error::{EngineError, Result};
use crate::record::Record;
use crate::registry::Registry;

/// Append-only, strictly sequenced stream of records.
#[derive(Debug, Clone, Default)]
pub struct StreamRegistry {
    records: Registry<Record>,
    // markers[type][name] = seq
    markers: BTreeMap<String, BTreeMap<String, u64>>,
    max_seq: u64,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn max_seq(&self) -> u64 {
        self.max_seq
    }

    pub fn get(&self, uid: Uuid) -> Option<&Record> {
        self.records.get(uid)
    }

    /// Records in seq order.
    pub fn records(&self) -> Vec<&Record> {
        let mut all: Vec<&Record> = self.records.values().collect();
        all.sort_by_key(|r| r.seq());
        all
    }

    // ---- add / push ----

    /// Append one record, assigning `max_seq + 1` when it has no seq.
    ///
    /// A record arriving with a seq at or below `max_seq` is rejected; seqs
    /// only move forward.
    pub fn add_record(&mut self, record: impl Into<Record>) -> Result<u64> {
        let mut record = record.into();
        let seq = match record.seq() {
            Some(seq) => {
                if seq <= self.max_seq && !self.records.is_empty() {
                    return Err(EngineError::SequenceViolation(format!(
                        "seq {seq} is not after max seq {}",
                        self.max_seq
                    )));
                }
                seq
            }
            None => {
                let seq = self.max_seq + 1;
                record.assign_seq(seq);
                seq
            }
        };
        self.max_seq = self.max_seq.max(seq);
        self.records.add(record)?;
        Ok(seq)
    }

    /// Coerce an unstructured value through the record discriminator, then
    /// append it.
    pub fn add_value(&mut self, value: Value) -> Result<u64> {
        self.add_record(Record::from_value(value)?)
    }

    /// Append a batch atomically and mark the first record's seq.
    ///
    /// The marker name defaults to the first record's label, falling back to
    /// `seq{n}`. Returns the inclusive `(start_seq, end_seq)` bounds; pass
    /// `(start, end + 1)` to [`StreamRegistry::get_slice`].
    pub fn push_records(
        &mut self,
        records: Vec<Record>,
        marker_type: &str,
        marker_name: Option<&str>,
    ) -> Result<(u64, u64)> {
        if records.is_empty() {
            debug!(marker_type, "no-op push to record stream");
            return Ok((self.max_seq, self.max_seq));
        }

        // marker name must be free before anything lands
        let first_label = records[0].label().map(str::to_string);
        let start_seq = records[0].seq().unwrap_or(self.max_seq + 1);
        let name = marker_name
            .map(str::to_string)
            .or(first_label)
            .unwrap_or_else(|| format!("seq{start_seq}"));
        if self.marker_seq(&name, marker_type).is_some() {
            return Err(EngineError::MarkerExists {
                marker_type: marker_type.to_string(),
                name,
            });
        }

        let mut start = None;
        for record in records {
            let seq = self.add_record(record)?;
            start.get_or_insert(seq);
        }
        let start = start.ok_or_else(|| {
            EngineError::SequenceViolation("batch push landed no records".into())
        })?;
        self.set_marker(&name, marker_type, Some(start))?;
        Ok((start, self.max_seq))
    }

    // ---- markers ----

    /// Drop a named marker at `seq` (default: current `max_seq`). Names are
    /// unique within their marker type.
    pub fn set_marker(&mut self, name: &str, marker_type: &str, seq: Option<u64>) -> Result<()> {
        let seq = seq.unwrap_or(self.max_seq);
        debug!(name, marker_type, seq, "adding marker");
        let of_type = self.markers.entry(marker_type.to_string()).or_default();
        if of_type.contains_key(name) {
            return Err(EngineError::MarkerExists {
                marker_type: marker_type.to_string(),
                name: name.to_string(),
            });
        }
        of_type.insert(name.to_string(), seq);
        Ok(())
    }

    pub fn marker_seq(&self, name: &str, marker_type: &str) -> Option<u64> {
        self.markers.get(marker_type)?.get(name).copied()
    }

    /// First marker of the same type strictly after `start`; end of stream
    /// otherwise.
    fn next_marker_seq(&self, start: u64, marker_type: &str) -> u64 {
        self.markers
            .get(marker_type)
            .into_iter()
            .flat_map(|m| m.values().copied())
            .filter(|seq| *seq > start)
            .min()
            .unwrap_or(self.max_seq + 1)
    }

    // ---- queries ----

    /// Records with `start <= seq < end` matching `criteria`, in seq order.
    pub fn get_slice(&self, start: u64, end: u64, criteria: &Criteria) -> Vec<&Record> {
        let mut slice: Vec<&Record> = self
            .records
            .values()
            .filter(|r| r.seq().map(|s| s >= start && s < end).unwrap_or(false))
            .filter(|r| r.matches(criteria, MatchScope::bare()))
            .collect();
        slice.sort_by_key(|r| r.seq());
        slice
    }

    /// Half-open section: from the named marker up to the next marker of the
    /// same type.
    pub fn get_section(&self, name: &str, marker_type: &str, criteria: &Criteria) -> Result<Vec<&Record>> {
        let start = self
            .marker_seq(name, marker_type)
            .ok_or_else(|| EngineError::NotFound(format!("marker {name}@{marker_type}")))?;
        let end = self.next_marker_seq(start, marker_type);
        debug!(name, marker_type, start, end, "section query");
        Ok(self.get_slice(start, end, criteria))
    }

    /// Records on the named channel matching `criteria`, in seq order.
    pub fn iter_channel(&self, channel: &str, criteria: &Criteria) -> Vec<&Record> {
        let mut found: Vec<&Record> = self
            .records
            .values()
            .filter(|r| r.has_channel(channel))
            .filter(|r| r.matches(criteria, MatchScope::bare()))
            .collect();
        found.sort_by_key(|r| r.seq());
        found
    }

    /// Max-by-seq record on `channel` matching `criteria`, if any.
    pub fn last(&self, channel: Option<&str>, criteria: &Criteria) -> Option<&Record> {
        self.records
            .values()
            .filter(|r| channel.map(|c| r.has_channel(c)).unwrap_or(true))
            .filter(|r| r.matches(criteria, MatchScope::bare()))
            .max_by_key(|r| r.seq())
    }

    /// Streams are append-only; removal is always an error.
    pub fn remove(&mut self, _uid: Uuid) -> Result<()> {
        Err(EngineError::SequenceViolation(
            "cannot remove records from a stream registry".into(),
        ))
    }
}
