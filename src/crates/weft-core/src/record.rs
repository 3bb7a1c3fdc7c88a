//! Immutable records and call receipts
//!
//! Records capture *what happened* — rendered fragments, receipts, planning
//! summaries — without allowing mutation. Once constructed a [`Record`]
//! exposes getters only; an "update" is a new record with a fresh seq. The
//! journal ([`crate::stream::StreamRegistry`]) assigns the monotonic seq at
//! append time.
//!
//! A [`CallReceipt`] is the audit envelope produced by each behavior
//! invocation: who ran ([`CallReceipt::blame_id`]), what came back
//! ([`CallReceipt::result`] plus [`ResultCode`]), and for whom. Reducers
//! ([`CallReceipt::last_result`], [`CallReceipt::all_truthy`], ...) fold a
//! receipt sequence into a phase verdict; the [`Aggregator`] enum is the
//! data-driven front end used by phase drivers.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::entity::{Entity, ItemKind, Matchable, MatchScope};
use crate::error::{EngineError, Result};

/// Outcome classification for one behavior invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultCode {
    /// Handler ran and produced a result.
    Ok,
    /// Handler matched but chose not to act.
    Skip,
    /// Handler matched but judged its input invalid.
    Invalid,
    /// Nothing applicable (used by aggregations).
    None,
    /// Handler failed; the message carries the error.
    Error,
}

/// Immutable runtime artifact with a typed discriminator and monotonic seq.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    #[serde(flatten)]
    base: Entity,
    #[serde(rename = "type")]
    record_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    blame_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seq: Option<u64>,
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    payload: Value,
}

impl Record {
    pub fn new(record_type: impl Into<String>) -> Self {
        Self {
            base: Entity::new(),
            record_type: record_type.into(),
            blame_id: None,
            seq: None,
            created_at: Utc::now(),
            payload: Value::Null,
        }
    }

    pub fn labeled(mut self, label: impl Into<String>) -> Self {
        self.base = self.base.labeled(label);
        self
    }

    pub fn tagged<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.base = self.base.tagged(tags);
        self
    }

    /// Attribute the record to its originating entity.
    pub fn blamed(mut self, blame_id: Uuid) -> Self {
        self.blame_id = Some(blame_id);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Pre-assign a seq. Normally the journal assigns one at append time.
    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }

    /// Coerce an unstructured value into a record via the `type` discriminator.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| EngineError::TemplateValidation(format!("record payload: {e}")))
    }

    pub fn uid(&self) -> Uuid {
        self.base.uid()
    }

    pub fn record_type(&self) -> &str {
        &self.record_type
    }

    pub fn blame_id(&self) -> Option<Uuid> {
        self.blame_id
    }

    /// Dereference the blamed entity through a registry of candidates.
    pub fn blame<'a, T: Matchable>(&self, registry: &'a crate::registry::Registry<T>) -> Option<&'a T> {
        self.blame_id.and_then(|uid| registry.get(uid))
    }

    pub fn seq(&self) -> Option<u64> {
        self.seq
    }

    pub fn label(&self) -> Option<&str> {
        self.base.label.as_deref()
    }

    pub fn display_label(&self) -> String {
        self.base.display_label()
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.base.tags
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// A record is on channel `name` when its type matches or it carries the
    /// `channel:{name}` tag.
    pub fn has_channel(&self, name: &str) -> bool {
        self.record_type == name || self.base.tags.contains(&format!("channel:{name}"))
    }

    pub(crate) fn assign_seq(&mut self, seq: u64) {
        self.seq = Some(seq);
    }
}

impl Matchable for Record {
    fn entity(&self) -> &Entity {
        &self.base
    }

    fn kind(&self) -> ItemKind {
        ItemKind::Record
    }

    fn capability(&self, key: &str, expected: &Value, _scope: MatchScope<'_>) -> Option<bool> {
        match key {
            "has_channel" => Some(expected.as_str().map(|c| self.has_channel(c)).unwrap_or(false)),
            _ => self.base.base_capability(key, expected),
        }
    }

    fn attr(&self, key: &str) -> Option<Value> {
        match key {
            "record_type" | "type" => Some(Value::String(self.record_type.clone())),
            "seq" => self.seq.map(|s| Value::from(s)),
            "label" => self.base.label.clone().map(Value::String),
            "uid" => Some(Value::String(self.base.uid().to_string())),
            other => self
                .base
                .attr(other)
                .cloned()
                .or_else(|| self.payload.get(other).cloned()),
        }
    }
}

/// Truthiness in the JSON domain, used by receipt reducers.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Reducers over a receipt sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregator {
    Gather,
    Merge,
    First,
    Last,
    Any,
    All,
}

/// Audit envelope produced by one behavior invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallReceipt {
    #[serde(default = "Uuid::new_v4")]
    uid: Uuid,
    /// The behavior that ran.
    pub blame_id: Uuid,
    pub result: Value,
    pub result_code: ResultCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub other_ids: Vec<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CallReceipt {
    pub fn ok(blame_id: Uuid, result: Value) -> Self {
        Self {
            uid: Uuid::new_v4(),
            blame_id,
            result,
            result_code: ResultCode::Ok,
            result_type: None,
            caller_id: None,
            other_ids: Vec::new(),
            message: None,
        }
    }

    pub fn skip(blame_id: Uuid, message: Option<String>) -> Self {
        Self {
            result_code: ResultCode::Skip,
            message,
            ..Self::ok(blame_id, Value::Null)
        }
    }

    pub fn invalid(blame_id: Uuid, message: Option<String>) -> Self {
        Self {
            result_code: ResultCode::Invalid,
            message,
            ..Self::ok(blame_id, Value::Null)
        }
    }

    pub fn error(blame_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            result_code: ResultCode::Error,
            message: Some(message.into()),
            ..Self::ok(blame_id, Value::Null)
        }
    }

    pub fn with_caller(mut self, caller_id: Uuid) -> Self {
        self.caller_id = Some(caller_id);
        self
    }

    pub fn with_others(mut self, other_ids: Vec<Uuid>) -> Self {
        self.other_ids = other_ids;
        self
    }

    pub fn with_result_type(mut self, result_type: impl Into<String>) -> Self {
        self.result_type = Some(result_type.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn uid(&self) -> Uuid {
        self.uid
    }

    /// Non-null results, in receipt order.
    pub fn gather_results<'a>(receipts: &'a [CallReceipt]) -> Vec<&'a Value> {
        receipts.iter().map(|r| &r.result).filter(|v| !v.is_null()).collect()
    }

    /// Chain-map semantics: the earliest receipt to set a key wins.
    pub fn merge_results(receipts: &[CallReceipt]) -> Map<String, Value> {
        let mut merged = Map::new();
        for result in Self::gather_results(receipts) {
            if let Value::Object(map) = result {
                for (key, value) in map {
                    merged.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }
        merged
    }

    /// First non-null result.
    pub fn first_result(receipts: &[CallReceipt]) -> Option<&Value> {
        Self::gather_results(receipts).first().copied()
    }

    /// Last non-null result; the pipeline-style verdict (later clobbers).
    pub fn last_result(receipts: &[CallReceipt]) -> Option<&Value> {
        Self::gather_results(receipts).last().copied()
    }

    pub fn any_truthy(receipts: &[CallReceipt]) -> bool {
        Self::gather_results(receipts).iter().any(|v| is_truthy(v))
    }

    pub fn all_truthy(receipts: &[CallReceipt]) -> bool {
        Self::gather_results(receipts).iter().all(|v| is_truthy(v))
    }

    /// Data-driven reducer front end.
    pub fn aggregate(aggregator: Aggregator, receipts: &[CallReceipt]) -> Value {
        match aggregator {
            Aggregator::Gather => {
                Value::Array(Self::gather_results(receipts).into_iter().cloned().collect())
            }
            Aggregator::Merge => Value::Object(Self::merge_results(receipts)),
            Aggregator::First => Self::first_result(receipts).cloned().unwrap_or(Value::Null),
            Aggregator::Last => Self::last_result(receipts).cloned().unwrap_or(Value::Null),
            Aggregator::Any => Value::Bool(Self::any_truthy(receipts)),
            Aggregator::All => Value::Bool(Self::all_truthy(receipts)),
        }
    }

    /// Freeze into a journal record.
    pub fn into_record(self) -> Record {
        let payload = serde_json::to_value(&self).unwrap_or(Value::Null);
        Record::new("call_receipt").blamed(self.blame_id).with_payload(payload)
    }
}
