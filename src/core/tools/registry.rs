use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::{
    BudgetLedger, BudgetLimit, Capability, HttpTool, TECHNICAL_COMPLIANCE, TechnicalComplianceTool,
    Tool, ToolDescriptor,
};
use crate::config::PipelineConfig;
use crate::core::error::ToolFailure;
use crate::core::types::{MediaKind, SourceMode};

/// Capability-indexed catalog of every tool the pipeline may call.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    budgets: BudgetLedger,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry described by a config: declared HTTP tools, the
    /// built-in compliance verifier when it is listed, and budget limits.
    pub fn from_config(config: &PipelineConfig) -> anyhow::Result<Self> {
        let mut registry = Self::new();
        let poll_interval = Duration::from_millis(config.backoff.initial_ms.max(1));
        for decl in &config.http_tools {
            registry.register(Arc::new(HttpTool::from_config(decl, poll_interval)?));
        }
        if config.verifiers.iter().any(|v| v == TECHNICAL_COMPLIANCE)
            && registry.get(TECHNICAL_COMPLIANCE).is_none()
        {
            registry.register(Arc::new(TechnicalComplianceTool::new(config.output.clone())));
        }
        for (tool, limit) in &config.budgets {
            registry.set_budget(tool, limit.clone());
        }
        Ok(registry)
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let descriptor = tool.descriptor();
        info!(
            "Registered tool: {} ({})",
            descriptor.name,
            descriptor.capability.as_str()
        );
        self.budgets.track(&descriptor.name);
        self.tools.insert(descriptor.name.clone(), tool);
    }

    pub fn set_budget(&mut self, tool: &str, limit: BudgetLimit) {
        self.budgets.set_limit(tool, limit);
    }

    pub fn budgets(&self) -> &BudgetLedger {
        &self.budgets
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn descriptors(&self) -> Vec<&ToolDescriptor> {
        let mut out: Vec<&ToolDescriptor> = self.tools.values().map(|t| t.descriptor()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn by_capability(&self, capability: Capability) -> Vec<Arc<dyn Tool>> {
        let mut out: Vec<Arc<dyn Tool>> = self
            .tools
            .values()
            .filter(|t| t.descriptor().capability == capability)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.descriptor().name.cmp(&b.descriptor().name));
        out
    }

    /// Look up a tool by name and check it offers `capability`.
    pub fn resolve(&self, name: &str, capability: Capability) -> Result<Arc<dyn Tool>, ToolFailure> {
        match self.get(name) {
            Some(tool) if tool.descriptor().capability == capability => Ok(tool),
            Some(_) => Err(ToolFailure::Unavailable {
                what: format!("'{name}' is not a {} tool", capability.as_str()),
            }),
            None => Err(ToolFailure::Unavailable {
                what: format!("{} tool '{name}'", capability.as_str()),
            }),
        }
    }

    /// Pick a generation tool for a segment. A pinned name wins when it
    /// handles the mode and kind; otherwise the first matching tool by name.
    pub fn find_generator(
        &self,
        mode: SourceMode,
        kind: MediaKind,
        pinned: Option<&str>,
    ) -> Option<Arc<dyn Tool>> {
        if let Some(name) = pinned
            && let Some(tool) = self.get(name)
            && tool.descriptor().handles(mode, kind)
        {
            return Some(tool);
        }
        self.by_capability(Capability::Generation)
            .into_iter()
            .find(|t| t.descriptor().handles(mode, kind))
    }
}
