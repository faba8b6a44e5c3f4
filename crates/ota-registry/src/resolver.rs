//! Candidate validation against a registry snapshot
//!
//! Checks run in a fixed order and stop at the first failure:
//!
//! 1. existence of every dependency
//! 2. version compatibility of every dependency
//! 3. acyclicity with the candidate inserted
//! 4. name/version collision
//!
//! A candidate whose exact content is already Active short-circuits to
//! [`Resolution::AlreadyActive`] before any check runs. Validation is a pure
//! function of its inputs, so the injection pipeline can repeat it against
//! fresh snapshots as often as it needs to.

use crate::descriptor::ServiceDescriptor;
use crate::error::ValidationError;
use crate::graph::DependencyGraph;
use crate::registry::RegistryState;
use crate::version::CompatibilityPolicy;

/// Successful validation outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The candidate may be committed
    Admissible,
    /// The identical descriptor is already Active; nothing to do
    AlreadyActive,
}

/// Dependency-aware validator
#[derive(Debug, Clone, Copy, Default)]
pub struct Resolver {
    policy: CompatibilityPolicy,
}

impl Resolver {
    /// Create a resolver using `policy` for open-ended constraints
    #[inline]
    #[must_use]
    pub const fn new(policy: CompatibilityPolicy) -> Self {
        Self { policy }
    }

    /// Policy in effect
    #[inline]
    #[must_use]
    pub const fn policy(&self) -> CompatibilityPolicy {
        self.policy
    }

    /// Validate `candidate` against `snapshot`
    ///
    /// # Errors
    /// The first [`ValidationError`] found, in check order.
    pub fn validate(
        &self,
        candidate: &ServiceDescriptor,
        snapshot: &RegistryState,
    ) -> Result<Resolution, ValidationError> {
        let current = snapshot.get(candidate.name());
        if current.is_some_and(|e| e.descriptor().same_content(candidate)) {
            return Ok(Resolution::AlreadyActive);
        }

        self.check_dependencies(candidate, snapshot)?;

        if let Some(path) = DependencyGraph::with_candidate(snapshot, candidate).find_cycle_from(candidate.name()) {
            return Err(ValidationError::CyclicDependency { path });
        }

        if let Some(entry) = current.filter(|e| e.version() == candidate.version()) {
            return Err(ValidationError::DuplicateVersion {
                name: entry.name().to_string(),
                version: entry.version().clone(),
            });
        }

        Ok(Resolution::Admissible)
    }

    fn check_dependencies(&self, candidate: &ServiceDescriptor, snapshot: &RegistryState) -> Result<(), ValidationError> {
        // all existence failures are reported before any version failure
        for dep in candidate.dependencies() {
            if dep.name != candidate.name() && !snapshot.contains(&dep.name) {
                return Err(ValidationError::DependencyMissing(dep.name.clone()));
            }
        }

        for dep in candidate.dependencies() {
            let Some(found) = snapshot.get(&dep.name) else {
                continue;
            };
            if !dep.constraint.matches(found.version(), self.policy) {
                return Err(ValidationError::VersionIncompatible {
                    name: dep.name.clone(),
                    required: dep.constraint.to_string(),
                    found: found.version().clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Language;
    use crate::registry::{ServiceRegistry, Snapshot};
    use semver::Version;

    fn svc(name: &str, version: &str, deps: &[(&str, &str)]) -> ServiceDescriptor {
        deps.iter()
            .fold(
                ServiceDescriptor::builder(name, Language::Python, Version::parse(version).unwrap()).interface("call"),
                |b, (n, c)| b.depends_on(*n, *c),
            )
            .build()
            .unwrap()
    }

    fn registry_with(services: &[ServiceDescriptor]) -> (ServiceRegistry, Snapshot) {
        let registry = ServiceRegistry::new();
        for d in services {
            let txn = registry.begin_transaction(&registry.snapshot()).unwrap();
            registry.commit(txn, d.clone()).unwrap();
        }
        let snap = registry.snapshot();
        (registry, snap)
    }

    #[test]
    fn independent_service_is_admissible() {
        let (_, snap) = registry_with(&[]);
        let result = Resolver::default().validate(&svc("A", "1.0.0", &[]), &snap);
        assert_eq!(result, Ok(Resolution::Admissible));
    }

    #[test]
    fn missing_dependency() {
        let (_, snap) = registry_with(&[]);
        let err = Resolver::default()
            .validate(&svc("B", "1.0.0", &[("A", ">=1.0.0")]), &snap)
            .unwrap_err();
        assert_eq!(err, ValidationError::DependencyMissing("A".into()));
    }

    #[test]
    fn existence_is_checked_before_versions() {
        let (_, snap) = registry_with(&[svc("A", "1.0.0", &[])]);
        let err = Resolver::default()
            .validate(&svc("C", "1.0.0", &[("A", ">=2.0.0"), ("Z", "*")]), &snap)
            .unwrap_err();
        assert_eq!(err, ValidationError::DependencyMissing("Z".into()));
    }

    #[test]
    fn incompatible_version() {
        let (_, snap) = registry_with(&[svc("A", "1.0.0", &[])]);
        let err = Resolver::default()
            .validate(&svc("B", "1.0.0", &[("A", ">=2.0.0")]), &snap)
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::VersionIncompatible {
                name: "A".into(),
                required: ">=2.0.0".into(),
                found: Version::new(1, 0, 0),
            }
        );
    }

    #[test]
    fn policy_changes_the_verdict() {
        let (_, snap) = registry_with(&[svc("A", "2.1.0", &[])]);
        let candidate = svc("B", "1.0.0", &[("A", ">=1.0.0")]);

        assert!(Resolver::new(CompatibilityPolicy::SameMajorMinimum)
            .validate(&candidate, &snap)
            .is_err());
        assert_eq!(
            Resolver::new(CompatibilityPolicy::Minimum).validate(&candidate, &snap),
            Ok(Resolution::Admissible)
        );
    }

    #[test]
    fn cycle_through_active_services() {
        let (_, snap) = registry_with(&[svc("C", "1.0.0", &[]), svc("D", "1.0.0", &[("C", "*")])]);
        let err = Resolver::default()
            .validate(&svc("C", "1.1.0", &[("D", "*")]), &snap)
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::CyclicDependency {
                path: vec!["C".into(), "D".into(), "C".into()]
            }
        );
    }

    #[test]
    fn self_dependency_is_cyclic() {
        let (_, snap) = registry_with(&[]);
        let err = Resolver::default()
            .validate(&svc("A", "1.0.0", &[("A", "*")]), &snap)
            .unwrap_err();
        assert!(matches!(err, ValidationError::CyclicDependency { .. }));
    }

    #[test]
    fn identical_reinjection_is_a_no_op() {
        let a = svc("A", "1.0.0", &[]);
        let (_, snap) = registry_with(&[a.clone()]);
        assert_eq!(Resolver::default().validate(&a, &snap), Ok(Resolution::AlreadyActive));
    }

    #[test]
    fn same_version_different_content_is_rejected() {
        let (_, snap) = registry_with(&[svc("A", "1.0.0", &[])]);
        let changed = ServiceDescriptor::builder("A", Language::Python, Version::new(1, 0, 0))
            .interface("other")
            .build()
            .unwrap();
        let err = Resolver::default().validate(&changed, &snap).unwrap_err();
        assert_eq!(err.tag(), "DuplicateVersion");
    }

    #[test]
    fn older_version_may_replace_newer() {
        let (_, snap) = registry_with(&[svc("A", "1.1.0", &[])]);
        assert_eq!(
            Resolver::default().validate(&svc("A", "1.0.0", &[]), &snap),
            Ok(Resolution::Admissible)
        );
    }

    #[test]
    fn validation_does_not_mutate() {
        let (registry, snap) = registry_with(&[svc("A", "1.0.0", &[])]);
        let _ = Resolver::default().validate(&svc("B", "1.0.0", &[("A", "^1.0.0")]), &snap);
        assert_eq!(registry.version(), snap.version());
        assert!(registry.snapshot().ptr_eq(&snap));
    }
}
