//! Human-readable registry report

use crate::registry::RegistryState;
use crate::version::CompatibilityPolicy;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Dependencies of Active services that the same state does not satisfy
///
/// Keyed by dependent name; each value lists `dep (constraint)` strings.
/// Empty for any state produced by validated commits.
#[must_use]
pub fn unsatisfied_dependencies(state: &RegistryState, policy: CompatibilityPolicy) -> BTreeMap<String, Vec<String>> {
    let mut out = BTreeMap::new();
    for entry in state.entries() {
        let broken: Vec<String> = entry
            .descriptor()
            .dependencies()
            .iter()
            .filter(|dep| {
                state
                    .get(&dep.name)
                    .map_or(true, |found| !dep.constraint.matches(found.version(), policy))
            })
            .map(|dep| format!("{} ({})", dep.name, dep.constraint))
            .collect();
        if !broken.is_empty() {
            out.insert(entry.name().to_string(), broken);
        }
    }
    out
}

/// Render the Active services and any unsatisfied dependencies
#[must_use]
pub fn render(state: &RegistryState, policy: CompatibilityPolicy) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Service registry v{}", state.version());
    let _ = writeln!(out, "Active services: {}", state.len());

    for entry in state.entries() {
        let d = entry.descriptor();
        let _ = writeln!(out);
        let _ = writeln!(out, "  * {}", d.name());
        let _ = writeln!(out, "    Language: {}", d.language());
        let _ = writeln!(out, "    Version: {}", d.version());
        let _ = writeln!(out, "    Activated: {}", entry.activated_at().to_rfc3339());
        let _ = writeln!(out, "    Digest: {}", d.digest().short());
        if !d.interfaces().is_empty() {
            let names: Vec<_> = d.interfaces().iter().map(String::as_str).collect();
            let _ = writeln!(out, "    Interfaces: {}", names.join(", "));
        }
        if !d.dependencies().is_empty() {
            let deps: Vec<_> = d
                .dependencies()
                .iter()
                .map(|dep| format!("{} {}", dep.name, dep.constraint))
                .collect();
            let _ = writeln!(out, "    Dependencies: {}", deps.join(", "));
        }
        let retired = state.history(d.name()).count();
        if retired > 0 {
            let _ = writeln!(out, "    Retired versions: {retired}");
        }
    }

    let missing = unsatisfied_dependencies(state, policy);
    if !missing.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "Unsatisfied dependencies:");
        for (service, deps) in missing {
            let _ = writeln!(out, "  * {service}: {}", deps.join(", "));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Language, ServiceDescriptor};
    use crate::registry::ServiceRegistry;
    use semver::Version;

    fn install(registry: &ServiceRegistry, d: ServiceDescriptor) {
        let txn = registry.begin_transaction(&registry.snapshot()).unwrap();
        registry.commit(txn, d).unwrap();
    }

    #[test]
    fn report_lists_services_and_flags_broken_edges() {
        let registry = ServiceRegistry::new();
        install(
            &registry,
            ServiceDescriptor::builder("A", Language::Java, Version::new(1, 0, 0))
                .interface("get")
                .build()
                .unwrap(),
        );
        // committed directly, bypassing the resolver
        install(
            &registry,
            ServiceDescriptor::builder("B", Language::C, Version::new(1, 0, 0))
                .depends_on("A", ">=2.0.0")
                .depends_on("Z", "*")
                .build()
                .unwrap(),
        );

        let snap = registry.snapshot();
        let missing = unsatisfied_dependencies(&snap, CompatibilityPolicy::default());
        assert_eq!(missing["B"], vec!["A (>=2.0.0)".to_string(), "Z (*)".to_string()]);

        let text = render(&snap, CompatibilityPolicy::default());
        assert!(text.contains("Service registry v2"));
        assert!(text.contains("Interfaces: get"));
        assert!(text.contains("Unsatisfied dependencies:"));
        assert!(text.contains("  * B: A (>=2.0.0), Z (*)"));
    }

    #[test]
    fn healthy_registry_has_no_warning_section() {
        let registry = ServiceRegistry::new();
        install(
            &registry,
            ServiceDescriptor::builder("A", Language::Rust, Version::new(1, 0, 0))
                .build()
                .unwrap(),
        );
        let text = render(&registry.snapshot(), CompatibilityPolicy::default());
        assert!(!text.contains("Unsatisfied"));
    }
}
