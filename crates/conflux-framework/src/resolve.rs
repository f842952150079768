//! Dependency resolution.
//!
//! Turns the plugin definitions handed to an agent into a closed set (pulling
//! in definitions referenced as dependencies) and computes start **layers**
//! with Kahn's algorithm.  Plugins within one layer have no edges between them
//! and may start concurrently; stop order is the reversed list of layers.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{CyclicDependencyError, ResolveError};
use crate::plugin::{Dependency, PluginDefinition};

/// Collects `roots` and every definition they reference, transitively.
///
/// Registration order is kept: each root comes before the dependencies it
/// introduces.  The same definition reached twice is kept once.
///
/// # Errors
///
/// [`ResolveError::DuplicatePlugin`] when two *different* definitions share a
/// name.
pub fn collect(roots: &[PluginDefinition]) -> Result<Vec<PluginDefinition>, ResolveError> {
    let mut collected: Vec<PluginDefinition> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut pending: Vec<PluginDefinition> = roots.iter().rev().cloned().collect();

    while let Some(def) = pending.pop() {
        if let Some(&existing) = index.get(def.name()) {
            if collected[existing].ptr_eq(&def) {
                continue;
            }
            return Err(ResolveError::DuplicatePlugin(def.name().to_owned()));
        }
        index.insert(def.name().to_owned(), collected.len());
        for dep in def.dependencies().iter().rev() {
            if let Dependency::Definition(dep) = dep {
                pending.push(dep.clone());
            }
        }
        collected.push(def);
    }
    Ok(collected)
}

/// Computes start layers as indices into `plugins`.
///
/// # Errors
///
/// - [`ResolveError::UnknownDependency`] when a dependency names no plugin.
/// - [`ResolveError::Cycle`] naming one concrete cycle.
pub fn topological_layers(plugins: &[PluginDefinition]) -> Result<Vec<Vec<usize>>, ResolveError> {
    let n = plugins.len();
    let index: HashMap<&str, usize> = plugins
        .iter()
        .enumerate()
        .map(|(i, p)| (p.name(), i))
        .collect();

    // requires[i]: plugins i depends on; dependents[j]: plugins depending on j.
    let mut requires: Vec<Vec<usize>> = vec![vec![]; n];
    let mut dependents: Vec<Vec<usize>> = vec![vec![]; n];
    let mut in_degree: Vec<usize> = vec![0; n];

    for (i, plugin) in plugins.iter().enumerate() {
        for dep in plugin.dependencies() {
            let Some(&j) = index.get(dep.name()) else {
                return Err(ResolveError::UnknownDependency {
                    plugin: plugin.name().to_owned(),
                    dependency: dep.name().to_owned(),
                });
            };
            if requires[i].contains(&j) {
                continue;
            }
            requires[i].push(j);
            dependents[j].push(i);
            in_degree[i] += 1;
        }
    }

    let mut layers: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut processed = 0;

    while !current.is_empty() {
        processed += current.len();
        let mut next: Vec<usize> = Vec::new();
        for &i in &current {
            for &j in &dependents[i] {
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    next.push(j);
                }
            }
        }
        next.sort_unstable();
        layers.push(current);
        current = next;
    }

    if processed != n {
        let cycle = find_cycle(plugins, &requires, &in_degree);
        return Err(CyclicDependencyError { cycle }.into());
    }

    debug!(
        layers = ?layers
            .iter()
            .map(|l| l.iter().map(|&i| plugins[i].name()).collect::<Vec<_>>())
            .collect::<Vec<_>>(),
        "Resolved plugin start order"
    );
    Ok(layers)
}

/// Walks unresolved nodes along their unresolved dependencies until one repeats.
///
/// Every node left with a positive in-degree after Kahn's pass still has at
/// least one unresolved dependency, so the walk cannot dead-end.
fn find_cycle(plugins: &[PluginDefinition], requires: &[Vec<usize>], in_degree: &[usize]) -> Vec<String> {
    let Some(start) = (0..plugins.len()).find(|&i| in_degree[i] > 0) else {
        return Vec::new();
    };
    let mut path: Vec<usize> = vec![start];
    let mut position: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut node = start;
    loop {
        let Some(&next) = requires[node].iter().find(|&&j| in_degree[j] > 0) else {
            return Vec::new();
        };
        if let Some(&at) = position.get(&next) {
            let mut cycle: Vec<String> = path[at..]
                .iter()
                .map(|&i| plugins[i].name().to_owned())
                .collect();
            cycle.push(plugins[next].name().to_owned());
            return cycle;
        }
        position.insert(next, path.len());
        path.push(next);
        node = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(name: &str, deps: &[&str]) -> PluginDefinition {
        PluginDefinition::builder(name)
            .dependencies(deps.iter().copied())
            .build()
            .unwrap()
    }

    fn names(plugins: &[PluginDefinition], layers: &[Vec<usize>]) -> Vec<Vec<String>> {
        layers
            .iter()
            .map(|l| l.iter().map(|&i| plugins[i].name().to_owned()).collect())
            .collect()
    }

    #[test]
    fn test_layers_respect_dependencies() {
        let plugins = vec![def("c", &["a", "b"]), def("b", &["a"]), def("a", &[]), def("d", &[])];
        let layers = topological_layers(&plugins).unwrap();
        assert_eq!(
            names(&plugins, &layers),
            vec![vec!["a", "d"], vec!["b"], vec!["c"]]
        );
    }

    #[test]
    fn test_every_dependency_in_earlier_layer() {
        let plugins = vec![
            def("e", &["d", "a"]),
            def("d", &["c"]),
            def("c", &["b", "a"]),
            def("b", &["a"]),
            def("a", &[]),
        ];
        let layers = topological_layers(&plugins).unwrap();
        let layer_of: HashMap<&str, usize> = layers
            .iter()
            .enumerate()
            .flat_map(|(li, l)| l.iter().map(move |&i| (i, li)))
            .map(|(i, li)| (plugins[i].name(), li))
            .collect();
        for plugin in &plugins {
            for dep in plugin.dependencies() {
                assert!(layer_of[dep.name()] < layer_of[plugin.name()]);
            }
        }
    }

    #[test]
    fn test_two_node_cycle_named() {
        let plugins = vec![def("a", &["b"]), def("b", &["a"])];
        let err = topological_layers(&plugins).unwrap_err();
        match err {
            ResolveError::Cycle(cycle) => assert_eq!(cycle.cycle, vec!["a", "b", "a"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let plugins = vec![def("a", &["a"])];
        let err = topological_layers(&plugins).unwrap_err();
        assert_eq!(err.to_string(), "cyclic plugin dependency: a -> a");
    }

    #[test]
    fn test_long_cycle_behind_acyclic_prefix() {
        let plugins = vec![
            def("root", &[]),
            def("x", &["root", "z"]),
            def("y", &["x"]),
            def("z", &["y"]),
        ];
        let err = topological_layers(&plugins).unwrap_err();
        match err {
            ResolveError::Cycle(cycle) => {
                assert_eq!(cycle.cycle.len(), 4);
                assert_eq!(cycle.cycle.first(), cycle.cycle.last());
                assert!(!cycle.cycle.contains(&"root".to_owned()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_dependency() {
        let plugins = vec![def("a", &["ghost"])];
        assert!(matches!(
            topological_layers(&plugins),
            Err(ResolveError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_collect_pulls_in_definitions_once() {
        let base = def("base", &[]);
        let left = PluginDefinition::builder("left").dependencies([&base]).build().unwrap();
        let right = PluginDefinition::builder("right").dependencies([&base]).build().unwrap();
        let all = collect(&[left, right]).unwrap();
        let names: Vec<_> = all.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["left", "base", "right"]);
    }

    #[test]
    fn test_collect_rejects_conflicting_names() {
        let err = collect(&[def("a", &[]), def("a", &[])]).unwrap_err();
        assert!(matches!(err, ResolveError::DuplicatePlugin(name) if name == "a"));
    }
}
