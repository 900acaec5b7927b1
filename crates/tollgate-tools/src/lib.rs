use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tollgate_protocol::{
    KernelResult, RiskLevel, ToolDescriptor, ToolInvocationOutput, ToolMetadata, ToolTransportPort,
};
use tracing::{debug, info, instrument, warn};

mod builtin;

pub use builtin::{LocalToolTransport, LocalToolsConfig};

/// Operator-supplied risk/category for a tool name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolClassification {
    pub risk: RiskLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// A discovered tool bound to the transport that serves it.
#[derive(Clone)]
pub struct ToolHandle {
    metadata: ToolMetadata,
    descriptor: ToolDescriptor,
    transport: Arc<dyn ToolTransportPort>,
}

impl ToolHandle {
    pub fn metadata(&self) -> &ToolMetadata {
        &self.metadata
    }

    pub fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    pub async fn call(&self, arguments: serde_json::Value) -> KernelResult<ToolInvocationOutput> {
        self.transport
            .call_tool(&self.descriptor.name, arguments)
            .await
    }
}

impl std::fmt::Debug for ToolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolHandle")
            .field("metadata", &self.metadata)
            .field("transport", &self.transport.name())
            .finish()
    }
}

/// Metadata for a proposed tool name plus, if the tool was discovered, the
/// handle that executes it.
#[derive(Debug, Clone)]
pub struct ResolvedTool {
    pub metadata: ToolMetadata,
    pub handle: Option<ToolHandle>,
}

/// Maps discovered tool names to handles and static classification.
///
/// Populated once at startup and shared read-only behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: IndexMap<String, ToolHandle>,
    classifications: HashMap<String, ToolClassification>,
    unknown_risk: RiskLevel,
}

impl ToolRegistry {
    pub fn new(
        classifications: HashMap<String, ToolClassification>,
        unknown_risk: RiskLevel,
    ) -> Self {
        Self {
            tools: IndexMap::new(),
            classifications,
            unknown_risk,
        }
    }

    /// Metadata for `name`, whether or not the tool was discovered.
    pub fn classify(&self, name: &str) -> ToolMetadata {
        match self.classifications.get(name) {
            Some(classification) => ToolMetadata::new(
                name,
                classification.risk,
                classification
                    .category
                    .clone()
                    .unwrap_or_else(|| ToolMetadata::UNCATEGORIZED.to_owned()),
            ),
            None => ToolMetadata::new(name, self.unknown_risk, ToolMetadata::UNCATEGORIZED),
        }
    }

    /// Register one descriptor. The first transport to offer a name keeps it.
    pub fn register(
        &mut self,
        descriptor: ToolDescriptor,
        transport: Arc<dyn ToolTransportPort>,
    ) -> bool {
        if let Some(existing) = self.tools.get(&descriptor.name) {
            warn!(
                tool = %descriptor.name,
                kept = existing.transport_name(),
                ignored = transport.name(),
                "duplicate tool name across transports"
            );
            return false;
        }
        let metadata = self.classify(&descriptor.name);
        debug!(tool = %descriptor.name, risk = %metadata.risk, category = %metadata.category, "tool registered");
        self.tools.insert(
            descriptor.name.clone(),
            ToolHandle {
                metadata,
                descriptor,
                transport,
            },
        );
        true
    }

    /// Ask every transport for its tools. A transport that fails to list is
    /// skipped so the remaining tools stay usable.
    #[instrument(skip(self, transports), fields(transports = transports.len()))]
    pub async fn discover(&mut self, transports: &[Arc<dyn ToolTransportPort>]) -> usize {
        let mut registered = 0;
        for transport in transports {
            match transport.list_tools().await {
                Ok(descriptors) => {
                    for descriptor in descriptors {
                        if self.register(descriptor, transport.clone()) {
                            registered += 1;
                        }
                    }
                }
                Err(error) => {
                    warn!(transport = transport.name(), %error, "tool discovery failed");
                }
            }
        }
        if self.tools.is_empty() {
            warn!("no tools discovered");
        } else {
            info!(registered, total = self.tools.len(), "tool discovery finished");
        }
        registered
    }

    pub fn get(&self, name: &str) -> Option<&ToolHandle> {
        self.tools.get(name)
    }

    pub fn resolve(&self, name: &str) -> ResolvedTool {
        match self.tools.get(name) {
            Some(handle) => ResolvedTool {
                metadata: handle.metadata.clone(),
                handle: Some(handle.clone()),
            },
            None => ResolvedTool {
                metadata: self.classify(name),
                handle: None,
            },
        }
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .map(|handle| handle.descriptor.clone())
            .collect()
    }

    pub fn metadata(&self) -> Vec<ToolMetadata> {
        self.tools
            .values()
            .map(|handle| handle.metadata.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
