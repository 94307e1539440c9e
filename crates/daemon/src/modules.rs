use std::collections::{HashMap, VecDeque};

use thiserror::Error;

/// Compile-time declaration of one butler module.
///
/// Modules are enumerated statically rather than discovered at runtime;
/// each names its dependencies and the tools it contributes.
#[derive(Debug, Clone)]
pub struct ModuleDef {
    pub name: &'static str,
    pub dependencies: &'static [&'static str],
    /// Migration chain applied for this module, when it owns tables.
    pub migration_chain: Option<&'static str>,
    pub tools: &'static [&'static str],
}

/// The built-in module catalog.
///
/// `mailbox` has no dependencies; `memory` consolidates mailbox content and
/// so initializes after it; `delivery` is the messenger butler's engine.
pub const BUILTIN_MODULES: &[ModuleDef] = &[
    ModuleDef {
        name: "mailbox",
        dependencies: &[],
        migration_chain: Some("mailbox"),
        tools: &["mailbox_post", "mailbox_list"],
    },
    ModuleDef {
        name: "memory",
        dependencies: &["mailbox"],
        migration_chain: Some("memory"),
        tools: &[],
    },
    ModuleDef {
        name: "delivery",
        dependencies: &[],
        migration_chain: Some("delivery"),
        tools: &[
            "delivery_dead_letter_list",
            "delivery_dead_letter_inspect",
            "delivery_dead_letter_replay",
            "delivery_dead_letter_discard",
        ],
    },
    ModuleDef {
        name: "triage",
        dependencies: &[],
        migration_chain: Some("switchboard"),
        tools: &[],
    },
];

/// Errors resolving the module set for one butler.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModuleRegistryError {
    #[error("unknown module: {0}")]
    UnknownModule(String),

    #[error("module dependency cycle involving: {0:?}")]
    DependencyCycle(Vec<String>),
}

/// Registry resolving a butler's enabled modules into initialization order.
#[derive(Debug)]
pub struct ModuleRegistry {
    catalog: HashMap<&'static str, ModuleDef>,
}

impl ModuleRegistry {
    /// Registry over the built-in catalog.
    #[must_use]
    pub fn builtin() -> Self {
        Self::from_catalog(BUILTIN_MODULES)
    }

    /// Registry over an explicit catalog (tests).
    #[must_use]
    pub fn from_catalog(modules: &[ModuleDef]) -> Self {
        Self {
            catalog: modules.iter().map(|m| (m.name, m.clone())).collect(),
        }
    }

    /// Look up one module.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ModuleDef> {
        self.catalog.get(name)
    }

    /// Resolve `enabled` (plus transitive dependencies) into initialization
    /// order via Kahn's algorithm. Fails loudly on unknown modules or
    /// cycles.
    pub fn resolve(&self, enabled: &[String]) -> Result<Vec<ModuleDef>, ModuleRegistryError> {
        // Collect the closure of enabled modules and their dependencies.
        let mut selected: HashMap<&'static str, &ModuleDef> = HashMap::new();
        let mut queue: VecDeque<&str> = enabled.iter().map(String::as_str).collect();
        while let Some(name) = queue.pop_front() {
            let def = self
                .catalog
                .get(name)
                .ok_or_else(|| ModuleRegistryError::UnknownModule(name.to_owned()))?;
            if selected.insert(def.name, def).is_none() {
                queue.extend(def.dependencies.iter().copied());
            }
        }

        // Kahn: count in-degrees within the selected set.
        let mut in_degree: HashMap<&str, usize> = selected
            .values()
            .map(|def| (def.name, def.dependencies.len()))
            .collect();
        let mut ready: VecDeque<&str> = {
            let mut roots: Vec<&str> = in_degree
                .iter()
                .filter(|(_, degree)| **degree == 0)
                .map(|(name, _)| *name)
                .collect();
            roots.sort_unstable();
            roots.into()
        };

        let mut ordered = Vec::with_capacity(selected.len());
        while let Some(name) = ready.pop_front() {
            ordered.push(selected[name].clone());
            let mut unlocked: Vec<&str> = Vec::new();
            for def in selected.values() {
                if def.dependencies.contains(&name) {
                    let degree = in_degree
                        .get_mut(def.name)
                        .expect("selected modules have degrees");
                    *degree -= 1;
                    if *degree == 0 {
                        unlocked.push(def.name);
                    }
                }
            }
            unlocked.sort_unstable();
            ready.extend(unlocked);
        }

        if ordered.len() != selected.len() {
            let mut stuck: Vec<String> = selected
                .keys()
                .filter(|name| !ordered.iter().any(|m| m.name == **name))
                .map(|s| (*s).to_owned())
                .collect();
            stuck.sort_unstable();
            return Err(ModuleRegistryError::DependencyCycle(stuck));
        }

        Ok(ordered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_resolution_orders_dependencies() {
        let registry = ModuleRegistry::builtin();
        let ordered = registry
            .resolve(&["memory".to_owned(), "mailbox".to_owned()])
            .unwrap();
        let names: Vec<&str> = ordered.iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["mailbox", "memory"]);
    }

    #[test]
    fn dependencies_are_pulled_in_transitively() {
        let registry = ModuleRegistry::builtin();
        let ordered = registry.resolve(&["memory".to_owned()]).unwrap();
        let names: Vec<&str> = ordered.iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["mailbox", "memory"]);
    }

    #[test]
    fn unknown_module_is_loud() {
        let registry = ModuleRegistry::builtin();
        let err = registry.resolve(&["time-travel".to_owned()]).unwrap_err();
        assert_eq!(err, ModuleRegistryError::UnknownModule("time-travel".into()));
    }

    #[test]
    fn cycles_fail_loudly() {
        const CYCLIC: &[ModuleDef] = &[
            ModuleDef {
                name: "a",
                dependencies: &["b"],
                migration_chain: None,
                tools: &[],
            },
            ModuleDef {
                name: "b",
                dependencies: &["a"],
                migration_chain: None,
                tools: &[],
            },
        ];
        let registry = ModuleRegistry::from_catalog(CYCLIC);
        let err = registry.resolve(&["a".to_owned()]).unwrap_err();
        assert_eq!(
            err,
            ModuleRegistryError::DependencyCycle(vec!["a".into(), "b".into()])
        );
    }

    #[test]
    fn empty_selection_is_empty() {
        let registry = ModuleRegistry::builtin();
        assert!(registry.resolve(&[]).unwrap().is_empty());
    }
}
