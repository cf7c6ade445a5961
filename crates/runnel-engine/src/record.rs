use std::collections::BTreeMap;

use serde::Serialize;

use runnel_core::error::Result;
use runnel_core::types::ExecutionRecord;

/// Step-ordered execution records of one run.
///
/// Filled only when `record_steps` is enabled; the scheduler never reads it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionTrace {
    records: BTreeMap<u64, ExecutionRecord>,
}

impl ExecutionTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append(&mut self, record: ExecutionRecord) {
        self.records.insert(record.step, record);
    }

    pub(crate) fn clear(&mut self) {
        self.records.clear();
    }

    pub fn get(&self, step: u64) -> Option<&ExecutionRecord> {
        self.records.get(&step)
    }

    /// Records in step order.
    pub fn iter(&self) -> impl Iterator<Item = &ExecutionRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records of one runnable, in step order.
    pub fn for_runnable<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ExecutionRecord> {
        self.records.values().filter(move |r| r.runnable == name)
    }

    pub fn total_usage(&self) -> u64 {
        self.records.values().map(|r| r.usage).sum()
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.records)?)
    }
}
