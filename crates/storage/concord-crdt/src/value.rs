//! Tagged CRDT values stored under shared-state keys
//!
//! A key declares its [`MergeType`] when first written. The encoded form is a
//! JSON object `{"type": "...", "state": {...}}`, so values travel through
//! any store that holds JSON.

use crate::error::{CrdtError, Result};
use crate::lww_register::LwwRegister;
use crate::or_set::OrSet;
use crate::pn_counter::PnCounter;
use crate::traits::Mergeable;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeType {
    Counter,
    Set,
    Register,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "state", rename_all = "lowercase")]
pub enum CrdtValue {
    Counter(PnCounter),
    Set(OrSet<String>),
    Register(LwwRegister<Value>),
}

impl CrdtValue {
    /// Bottom element for a merge type
    pub fn empty(merge_type: MergeType) -> Self {
        match merge_type {
            MergeType::Counter => CrdtValue::Counter(PnCounter::new()),
            MergeType::Set => CrdtValue::Set(OrSet::new()),
            MergeType::Register => CrdtValue::Register(LwwRegister::new()),
        }
    }

    pub fn merge_type(&self) -> MergeType {
        match self {
            CrdtValue::Counter(_) => MergeType::Counter,
            CrdtValue::Set(_) => MergeType::Set,
            CrdtValue::Register(_) => MergeType::Register,
        }
    }

    /// Merge two values of the same type
    pub fn try_merge(&mut self, other: &Self) -> Result<()> {
        match (self, other) {
            (CrdtValue::Counter(a), CrdtValue::Counter(b)) => a.merge(b),
            (CrdtValue::Set(a), CrdtValue::Set(b)) => a.merge(b),
            (CrdtValue::Register(a), CrdtValue::Register(b)) => a.merge(b),
            (mine, theirs) => {
                return Err(CrdtError::MergeTypeMismatch {
                    expected: mine.merge_type(),
                    found: theirs.merge_type(),
                })
            }
        }
        Ok(())
    }

    pub fn merged(&self, other: &Self) -> Result<Self> {
        let mut out = self.clone();
        out.try_merge(other)?;
        Ok(out)
    }

    pub fn to_json(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        Ok(Self::deserialize(value)?)
    }

    /// Decode and check the declared type
    pub fn from_json_as(value: &Value, expected: MergeType) -> Result<Self> {
        let decoded = Self::from_json(value)?;
        if decoded.merge_type() != expected {
            return Err(CrdtError::MergeTypeMismatch {
                expected,
                found: decoded.merge_type(),
            });
        }
        Ok(decoded)
    }

    /// Plain JSON view for readers that do not care about CRDT metadata
    pub fn materialize(&self) -> Value {
        match self {
            CrdtValue::Counter(c) => Value::from(c.value()),
            CrdtValue::Set(s) => Value::Array(s.elements().cloned().map(Value::String).collect()),
            CrdtValue::Register(r) => r.get().cloned().unwrap_or(Value::Null),
        }
    }

    pub fn as_counter_mut(&mut self) -> Result<&mut PnCounter> {
        match self {
            CrdtValue::Counter(c) => Ok(c),
            other => Err(CrdtError::MergeTypeMismatch {
                expected: MergeType::Counter,
                found: other.merge_type(),
            }),
        }
    }

    pub fn as_set_mut(&mut self) -> Result<&mut OrSet<String>> {
        match self {
            CrdtValue::Set(s) => Ok(s),
            other => Err(CrdtError::MergeTypeMismatch {
                expected: MergeType::Set,
                found: other.merge_type(),
            }),
        }
    }

    pub fn as_register_mut(&mut self) -> Result<&mut LwwRegister<Value>> {
        match self {
            CrdtValue::Register(r) => Ok(r),
            other => Err(CrdtError::MergeTypeMismatch {
                expected: MergeType::Register,
                found: other.merge_type(),
            }),
        }
    }
}
