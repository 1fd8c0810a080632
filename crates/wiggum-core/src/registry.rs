//! Service registry: read-only id and phase lookups over loaded definitions.

use std::collections::HashMap;

use crate::error::{OrchestratorError, Result};
use crate::service::{Phase, ServiceDefinition};

/// In-memory index of services. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    services: Vec<ServiceDefinition>,
    by_id: HashMap<String, usize>,
    /// Indices per phase, sorted by `order` (stable on insertion order).
    by_phase: HashMap<Phase, Vec<usize>>,
}

impl ServiceRegistry {
    /// Build the registry. Fails on duplicate ids.
    pub fn new(services: Vec<ServiceDefinition>) -> Result<Self> {
        let mut by_id = HashMap::with_capacity(services.len());
        let mut by_phase: HashMap<Phase, Vec<usize>> = HashMap::new();

        for (idx, svc) in services.iter().enumerate() {
            if by_id.insert(svc.id.clone(), idx).is_some() {
                return Err(OrchestratorError::DuplicateService(svc.id.clone()));
            }
            by_phase.entry(svc.phase).or_default().push(idx);
        }
        for indices in by_phase.values_mut() {
            indices.sort_by_key(|&i| services[i].order);
        }

        tracing::debug!("Service registry built: {} services", services.len());
        Ok(Self {
            services,
            by_id,
            by_phase,
        })
    }

    /// Look up a service by id.
    pub fn get(&self, id: &str) -> Option<&ServiceDefinition> {
        self.by_id.get(id).map(|&i| &self.services[i])
    }

    /// Enabled services of a phase, ascending by `order`.
    pub fn enabled_for_phase(&self, phase: Phase) -> Vec<&ServiceDefinition> {
        self.by_phase
            .get(&phase)
            .map(|indices| {
                indices
                    .iter()
                    .map(|&i| &self.services[i])
                    .filter(|s| s.enabled)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Enabled services in the order a phase dispatches them.
    /// `shutdown` runs in reverse so the last-started service stops first.
    pub fn dispatch_order(&self, phase: Phase) -> Vec<&ServiceDefinition> {
        let mut services = self.enabled_for_phase(phase);
        if phase == Phase::Shutdown {
            services.reverse();
        }
        services
    }

    /// All enabled services, in declaration order.
    pub fn all_enabled(&self) -> Vec<&ServiceDefinition> {
        self.services.iter().filter(|s| s.enabled).collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(|s| s.id.as_str())
    }

    pub fn count(&self) -> usize {
        self.services.len()
    }
}
