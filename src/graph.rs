//! Service dependency graph
//!
//! Built once from the descriptor store. Construction validates that every
//! edge points at a declared service and that the graph is acyclic; the
//! resulting graph exposes each service's edges, the reverse adjacency used
//! to wake dependents, and a deterministic topological order.

use crate::error::{MusterError, Result};
use crate::service::{DependencyEdge, DescriptorStore, ServiceDescriptor};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Validated, immutable dependency graph
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    descriptors: BTreeMap<String, ServiceDescriptor>,
    /// Reverse adjacency: service -> services depending on it
    dependents: HashMap<String, Vec<String>>,
    /// Dependencies before dependents; ties broken by name
    order: Vec<String>,
}

impl DependencyGraph {
    /// Validate the descriptors and build the graph
    pub fn build(store: DescriptorStore) -> Result<Self> {
        let descriptors = store.into_map();

        for descriptor in descriptors.values() {
            for edge in &descriptor.depends_on {
                if !descriptors.contains_key(&edge.target) {
                    return Err(MusterError::UnknownService {
                        service: descriptor.name.clone(),
                        dependency: edge.target.clone(),
                    });
                }
            }
        }

        let mut order = Vec::with_capacity(descriptors.len());
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        for name in descriptors.keys() {
            topological_sort(name, &descriptors, &mut visited, &mut path, &mut order)?;
        }

        let mut dependents: HashMap<String, Vec<String>> = descriptors
            .keys()
            .map(|name| (name.clone(), Vec::new()))
            .collect();
        for descriptor in descriptors.values() {
            for edge in &descriptor.depends_on {
                if let Some(list) = dependents.get_mut(&edge.target) {
                    if !list.contains(&descriptor.name) {
                        list.push(descriptor.name.clone());
                    }
                }
            }
        }

        Ok(Self {
            descriptors,
            dependents,
            order,
        })
    }

    pub fn descriptor(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.descriptors.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.descriptors.contains_key(name)
    }

    /// Direct dependency edges of a service
    pub fn dependencies(&self, name: &str) -> &[DependencyEdge] {
        self.descriptors
            .get(name)
            .map(|d| d.depends_on.as_slice())
            .unwrap_or(&[])
    }

    /// Services with an edge pointing at `name`
    pub fn dependents(&self, name: &str) -> &[String] {
        self.dependents
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All descriptors, by name
    pub fn services(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.descriptors.values()
    }

    /// Topological order: every service after all of its dependencies
    pub fn start_order(&self) -> &[String] {
        &self.order
    }

    /// Reverse topological order: dependents before dependencies
    pub fn stop_order(&self) -> Vec<String> {
        self.order.iter().rev().cloned().collect()
    }

    /// Group services by dependency depth.
    ///
    /// Level 0 holds services without dependencies; every other service sits
    /// one level above its deepest dependency.
    pub fn levels(&self) -> Vec<Vec<String>> {
        let mut depth: HashMap<&str, usize> = HashMap::new();
        let mut levels: Vec<Vec<String>> = Vec::new();

        for name in &self.order {
            let level = self
                .dependencies(name)
                .iter()
                .filter_map(|edge| depth.get(edge.target.as_str()))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(name, level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(name.clone());
        }

        for level in &mut levels {
            level.sort();
        }
        levels
    }

    /// Every service that depends on `name`, directly or not, in start order
    pub fn transitive_dependents(&self, name: &str) -> Vec<String> {
        let reached = self.reach(name, |n| self.dependents(n).iter().map(String::as_str).collect());
        self.in_start_order(&reached)
    }

    /// Every service `name` depends on, directly or not, in start order
    pub fn transitive_dependencies(&self, name: &str) -> Vec<String> {
        let reached = self.reach(name, |n| {
            self.dependencies(n).iter().map(|e| e.target.as_str()).collect()
        });
        self.in_start_order(&reached)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    fn reach<'a, F>(&'a self, start: &'a str, next: F) -> HashSet<&'a str>
    where
        F: Fn(&'a str) -> Vec<&'a str>,
    {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<&str> = next(start).into();
        while let Some(name) = queue.pop_front() {
            if seen.insert(name) {
                queue.extend(next(name));
            }
        }
        seen
    }

    fn in_start_order(&self, names: &HashSet<&str>) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| names.contains(name.as_str()))
            .cloned()
            .collect()
    }
}

/// Depth-first post-order walk; `path` holds the services being visited
fn topological_sort(
    service: &str,
    descriptors: &BTreeMap<String, ServiceDescriptor>,
    visited: &mut HashSet<String>,
    path: &mut Vec<String>,
    order: &mut Vec<String>,
) -> Result<()> {
    if visited.contains(service) {
        return Ok(());
    }

    if let Some(pos) = path.iter().position(|s| s == service) {
        let mut cycle = path[pos..].to_vec();
        cycle.push(service.to_string());
        return Err(MusterError::DependencyCycle { cycle });
    }

    path.push(service.to_string());

    if let Some(descriptor) = descriptors.get(service) {
        for edge in &descriptor.depends_on {
            topological_sort(&edge.target, descriptors, visited, path, order)?;
        }
    }

    path.pop();
    visited.insert(service.to_string());
    order.push(service.to_string());

    Ok(())
}
