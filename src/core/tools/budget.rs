use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Per-tool spending limits. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimit {
    #[serde(default)]
    pub max_calls: Option<u64>,
    #[serde(default)]
    pub max_cost_units: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BudgetUsage {
    pub calls: u64,
    pub cost_units: u64,
}

#[derive(Debug, Default)]
struct Counter {
    limit: BudgetLimit,
    calls: AtomicU64,
    cost_units: AtomicU64,
}

/// Process-wide call and cost counters, one per registered tool.
///
/// The set of tools is fixed when the registry is built; after that the ledger
/// is shared read-only and every update is a compare-and-swap on the counters.
#[derive(Debug, Default)]
pub struct BudgetLedger {
    counters: HashMap<String, Counter>,
}

impl BudgetLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn track(&mut self, tool: &str) {
        self.counters.entry(tool.to_string()).or_default();
    }

    pub fn set_limit(&mut self, tool: &str, limit: BudgetLimit) {
        self.counters.entry(tool.to_string()).or_default().limit = limit;
    }

    /// Charge one call of `cost_units` to `tool`, or explain why it is over budget.
    pub fn try_reserve(&self, tool: &str, cost_units: u64) -> Result<(), String> {
        let Some(counter) = self.counters.get(tool) else {
            return Ok(());
        };

        let max_calls = counter.limit.max_calls;
        counter
            .calls
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |calls| match max_calls {
                Some(max) if calls >= max => None,
                _ => Some(calls + 1),
            })
            .map_err(|calls| format!("{calls} of {} calls used", max_calls.unwrap_or(0)))?;

        let max_cost = counter.limit.max_cost_units;
        let charged = counter
            .cost_units
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |spent| {
                let next = spent.saturating_add(cost_units);
                match max_cost {
                    Some(max) if next > max => None,
                    _ => Some(next),
                }
            });
        if let Err(spent) = charged {
            counter.calls.fetch_sub(1, Ordering::AcqRel);
            return Err(format!(
                "{spent} of {} cost units used, call needs {cost_units}",
                max_cost.unwrap_or(0)
            ));
        }
        Ok(())
    }

    pub fn usage(&self, tool: &str) -> Option<BudgetUsage> {
        self.counters.get(tool).map(|c| BudgetUsage {
            calls: c.calls.load(Ordering::Acquire),
            cost_units: c.cost_units.load(Ordering::Acquire),
        })
    }
}
