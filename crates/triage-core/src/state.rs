//! Shared pipeline state.
//!
//! Slots form a closed set for this pipeline version. A slot is written at
//! most once per session; later writes to an occupied slot are refused and
//! reported back to the caller.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Input,
    StructuredTicket,
    ClassificationResult,
    SimilarTickets,
    RootCauseAnalysis,
    ImpactAssessment,
    SolutionProposal,
    FinalReport,
}

impl Slot {
    pub const ALL: [Slot; 8] = [
        Slot::Input,
        Slot::StructuredTicket,
        Slot::ClassificationResult,
        Slot::SimilarTickets,
        Slot::RootCauseAnalysis,
        Slot::ImpactAssessment,
        Slot::SolutionProposal,
        Slot::FinalReport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Slot::Input => "input",
            Slot::StructuredTicket => "structured_ticket",
            Slot::ClassificationResult => "classification_result",
            Slot::SimilarTickets => "similar_tickets",
            Slot::RootCauseAnalysis => "root_cause_analysis",
            Slot::ImpactAssessment => "impact_assessment",
            Slot::SolutionProposal => "solution_proposal",
            Slot::FinalReport => "final_report",
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown slot: {0}")]
pub struct UnknownSlot(pub String);

impl FromStr for Slot {
    type Err = UnknownSlot;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Slot::ALL
            .into_iter()
            .find(|slot| slot.as_str() == s)
            .ok_or_else(|| UnknownSlot(s.to_string()))
    }
}

/// Value produced into a slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SlotValue {
    Text(String),
    Json(serde_json::Value),
}

impl SlotValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SlotValue::Text(s) => Some(s),
            SlotValue::Json(_) => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            SlotValue::Json(v) => Some(v),
            SlotValue::Text(_) => None,
        }
    }

    /// Text form suitable for a prompt.
    pub fn render(&self) -> String {
        match self {
            SlotValue::Text(s) => s.clone(),
            SlotValue::Json(v) => serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string()),
        }
    }
}

impl From<String> for SlotValue {
    fn from(s: String) -> Self {
        SlotValue::Text(s)
    }
}

impl From<&str> for SlotValue {
    fn from(s: &str) -> Self {
        SlotValue::Text(s.to_string())
    }
}

/// The accumulated slot map of one session.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State {
    slots: BTreeMap<Slot, SlotValue>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(input: impl Into<String>) -> Self {
        let mut state = Self::new();
        state.slots.insert(Slot::Input, SlotValue::Text(input.into()));
        state
    }

    pub fn get(&self, slot: Slot) -> Option<&SlotValue> {
        self.slots.get(&slot)
    }

    pub fn text(&self, slot: Slot) -> Option<&str> {
        self.get(slot).and_then(SlotValue::as_text)
    }

    pub fn contains(&self, slot: Slot) -> bool {
        self.slots.contains_key(&slot)
    }

    /// Write a slot. An occupied slot is left untouched and the rejected value is returned.
    pub fn insert(&mut self, slot: Slot, value: SlotValue) -> Result<(), SlotValue> {
        if self.slots.contains_key(&slot) {
            return Err(value);
        }
        self.slots.insert(slot, value);
        Ok(())
    }

    /// Apply a delta, returning the slots that were already occupied.
    pub fn apply(&mut self, delta: StateDelta) -> Vec<Slot> {
        let mut refused = Vec::new();
        for (slot, value) in delta.slots {
            if self.insert(slot, value).is_err() {
                refused.push(slot);
            }
        }
        refused
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Slot, &SlotValue)> {
        self.slots.iter()
    }

    pub fn slots(&self) -> impl Iterator<Item = Slot> + '_ {
        self.slots.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Slots written by a single stage run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateDelta {
    slots: BTreeMap<Slot, SlotValue>,
}

impl StateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, slot: Slot, value: impl Into<SlotValue>) {
        self.slots.insert(slot, value.into());
    }

    pub fn get(&self, slot: Slot) -> Option<&SlotValue> {
        self.slots.get(&slot)
    }

    pub fn contains(&self, slot: Slot) -> bool {
        self.slots.contains_key(&slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Slot, &SlotValue)> {
        self.slots.iter()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl IntoIterator for StateDelta {
    type Item = (Slot, SlotValue);
    type IntoIter = std::collections::btree_map::IntoIter<Slot, SlotValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.slots.into_iter()
    }
}

impl FromIterator<(Slot, SlotValue)> for StateDelta {
    fn from_iter<I: IntoIterator<Item = (Slot, SlotValue)>>(iter: I) -> Self {
        Self {
            slots: iter.into_iter().collect(),
        }
    }
}
