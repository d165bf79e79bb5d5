//! Dependency graph of a stack.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::ServiceSpec;
use crate::error::{Error, Result};

/// Validated, acyclic dependency graph with a deterministic start order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Topology {
    order: Vec<String>,
    dependencies: BTreeMap<String, Vec<String>>,
    dependents: BTreeMap<String, Vec<String>>,
}

impl Topology {
    /// Builds the graph, sorting services topologically with ties broken by name.
    ///
    /// # Errors
    ///
    /// Returns an error for duplicate names, unknown dependencies and cycles.
    pub fn build(services: &[ServiceSpec]) -> Result<Self> {
        let mut dependencies: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for service in services {
            let mut deps: Vec<String> = service.depends_on.clone();
            deps.sort();
            deps.dedup();

            if dependencies.insert(service.name.clone(), deps).is_some() {
                return Err(Error::DuplicateService(service.name.clone()));
            }
        }

        let mut dependents: BTreeMap<String, Vec<String>> = dependencies
            .keys()
            .map(|name| (name.clone(), Vec::new()))
            .collect();

        for (name, deps) in &dependencies {
            for dependency in deps {
                let Some(entry) = dependents.get_mut(dependency) else {
                    return Err(Error::UnknownDependency {
                        service: name.clone(),
                        dependency: dependency.clone(),
                    });
                };
                entry.push(name.clone());
            }
        }

        let mut unresolved: BTreeMap<String, usize> = dependencies
            .iter()
            .map(|(name, deps)| (name.clone(), deps.len()))
            .collect();

        let mut ready: BTreeSet<String> = unresolved
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| name.clone())
            .collect();

        let mut order = Vec::with_capacity(dependencies.len());

        while let Some(name) = ready.pop_first() {
            unresolved.remove(&name);

            for dependent in &dependents[&name] {
                if let Some(count) = unresolved.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(dependent.clone());
                    }
                }
            }

            order.push(name);
        }

        if !unresolved.is_empty() {
            return Err(Error::DependencyCycle(find_cycle(&dependencies, &unresolved)));
        }

        Ok(Self {
            order,
            dependencies,
            dependents,
        })
    }

    /// Returns services in start order.
    #[must_use]
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Returns the direct dependencies of a service.
    #[must_use]
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.dependencies.get(name).map_or(&[], Vec::as_slice)
    }

    /// Returns the services that depend directly on a service.
    #[must_use]
    pub fn dependents(&self, name: &str) -> &[String] {
        self.dependents.get(name).map_or(&[], Vec::as_slice)
    }
}

/// Follows unresolved dependency edges from the first unresolved service until
/// one repeats. Every unresolved service has an unresolved dependency, so the
/// walk always closes a cycle.
fn find_cycle(
    dependencies: &BTreeMap<String, Vec<String>>,
    unresolved: &BTreeMap<String, usize>,
) -> Vec<String> {
    let mut path: Vec<&str> = Vec::new();
    let mut current = unresolved.keys().next().map(String::as_str);

    while let Some(name) = current {
        if let Some(start) = path.iter().position(|visited| *visited == name) {
            let mut cycle: Vec<String> = path[start..].iter().map(|s| (*s).to_string()).collect();
            cycle.push(name.to_string());
            return cycle;
        }

        path.push(name);
        current = dependencies.get(name).and_then(|deps| {
            deps.iter()
                .map(String::as_str)
                .find(|dep| unresolved.contains_key(*dep))
        });
    }

    path.into_iter().map(str::to_string).collect()
}
