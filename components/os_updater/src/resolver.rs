//! Dependency resolver for partial upgrades
//!
//! Staging a single package is not enough when first-party packages must
//! move in lockstep, and staging everything is too invasive for a one-package
//! patch. The resolver walks the candidate's dependency groups, recursing only
//! through first-party packages, and narrows each package's acceptable
//! versions to what every dependent accepts.

use crate::cache::PackageCache;
use crate::error::{CacheError, Result, UpdaterError};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

/// Package name to the versions every dependent accepts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyClosure {
    packages: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyClosure {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a package's acceptable versions, replacing any previous set
    pub fn insert<I, S>(&mut self, name: impl Into<String>, versions: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages
            .insert(name.into(), versions.into_iter().map(Into::into).collect());
    }

    /// Add a constraint: seeds a new package, intersects an existing one
    ///
    /// Returns true if the package was not in the closure before.
    pub fn constrain<'v, I>(&mut self, name: &str, versions: I) -> bool
    where
        I: IntoIterator<Item = &'v String>,
    {
        let versions: BTreeSet<String> = versions.into_iter().cloned().collect();
        match self.packages.get_mut(name) {
            Some(existing) => {
                existing.retain(|v| versions.contains(v));
                false
            }
            None => {
                self.packages.insert(name.to_string(), versions);
                true
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.packages.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.packages.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.packages.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.packages.keys().map(String::as_str)
    }

    /// Packages no single version can satisfy
    pub fn unsatisfiable(&self) -> Vec<&str> {
        self.packages
            .iter()
            .filter(|(_, versions)| versions.is_empty())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

/// Name prefixes that mark a package as first-party
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageFamily {
    prefixes: Vec<String>,
}

impl PackageFamily {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            prefixes: prefixes.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.prefixes.iter().any(|prefix| name.starts_with(prefix.as_str()))
    }
}

pub struct Resolver<'a, C> {
    cache: &'a C,
    family: &'a PackageFamily,
}

impl<'a, C: PackageCache> Resolver<'a, C> {
    pub fn new(cache: &'a C, family: &'a PackageFamily) -> Self {
        Self { cache, family }
    }

    /// Closure of every target, accumulated into one mapping
    ///
    /// Every target's own dependencies are walked, even when an earlier
    /// target already pulled it in, so the result does not depend on the
    /// order of `targets`.
    pub async fn closure_for(&self, targets: &[String]) -> Result<DependencyClosure> {
        let mut closure = DependencyClosure::new();
        let mut walked = BTreeSet::new();
        for target in targets {
            self.add_target(target, &mut closure, &mut walked).await?;
        }
        Ok(closure)
    }

    /// Pin `name` to its candidate version and pull in its dependencies
    async fn add_target(
        &self,
        name: &str,
        closure: &mut DependencyClosure,
        walked: &mut BTreeSet<String>,
    ) -> Result<()> {
        let package = self
            .cache
            .package(name)
            .await?
            .ok_or_else(|| CacheError::UnknownPackage(name.to_string()))?;
        let candidate = package
            .candidate
            .ok_or_else(|| UpdaterError::NoCandidate(name.to_string()))?;

        closure.constrain(name, [&candidate.version]);
        self.resolve(name, closure, walked).await
    }

    /// Walk the dependencies of `name`, recursing through first-party
    /// packages only. Packages in `walked` are not visited twice.
    async fn resolve(
        &self,
        name: &str,
        closure: &mut DependencyClosure,
        walked: &mut BTreeSet<String>,
    ) -> Result<()> {
        let mut pending = VecDeque::from([name.to_string()]);

        while let Some(caller) = pending.pop_front() {
            if !walked.insert(caller.clone()) {
                continue;
            }
            let Some(candidate) = self
                .cache
                .package(&caller)
                .await?
                .and_then(|package| package.candidate)
            else {
                debug!("{} has no candidate, nothing to resolve", caller);
                continue;
            };

            for group in &candidate.dependencies {
                if group.iter().all(|target| target.target_versions.is_empty()) {
                    continue;
                }

                for target in group {
                    let added = closure.constrain(&target.name, &target.target_versions);
                    if added && self.family.contains(&caller) && self.family.contains(&target.name)
                    {
                        debug!("{} -> {} (first-party, descending)", caller, target.name);
                        pending.push_back(target.name.clone());
                    }
                }
            }
        }

        Ok(())
    }
}
