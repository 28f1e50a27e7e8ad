// compliance.rs - Per-bundle kept / repaired / not-kept accounting.
//
// A promise is counted once per run no matter how many passes touched it;
// its recorded result is the worst one seen across passes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use cf_eval::{Compliance, PromiseResult};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceCounts {
    pub kept: usize,
    pub repaired: usize,
    pub not_kept: usize,
}

impl ComplianceCounts {
    pub fn total(&self) -> usize {
        self.kept + self.repaired + self.not_kept
    }

    /// Share of promises kept or repaired, in percent. An empty bundle is
    /// fully compliant.
    pub fn percent_compliant(&self) -> f64 {
        match self.total() {
            0 => 100.0,
            total => (self.kept + self.repaired) as f64 * 100.0 / total as f64,
        }
    }

    pub fn add(&mut self, other: ComplianceCounts) {
        self.kept += other.kept;
        self.repaired += other.repaired;
        self.not_kept += other.not_kept;
    }
}

#[derive(Debug, Clone, Default)]
pub struct BundleCompliance {
    promises: BTreeMap<String, PromiseResult>,
}

impl BundleCompliance {
    pub fn record(&mut self, key: &str, result: PromiseResult) {
        if result == PromiseResult::Skipped {
            return;
        }
        let merged = match self.promises.get(key) {
            Some(previous) => previous.update(result),
            None => result,
        };
        self.promises.insert(key.to_string(), merged);
    }

    pub fn counts(&self) -> ComplianceCounts {
        let mut counts = ComplianceCounts::default();
        for result in self.promises.values() {
            match result.compliance() {
                Compliance::Kept => counts.kept += 1,
                Compliance::Repaired => counts.repaired += 1,
                Compliance::NotKept => counts.not_kept += 1,
                Compliance::Ignored => {}
            }
        }
        counts
    }
}
