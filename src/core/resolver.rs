//! Dependency resolution: provides/requires edges to a commit order and to
//! levels of modules that may commit concurrently.
//!
//! Edges point from a module to what it depends on (`X requires Y` gives
//! `X -> Y`). A depth-first walk finishes `Y` before `X`, so the finish order
//! is already the commit order. Visitation colors live in a map owned by the
//! walk, never on the modules.

use crate::core::error::CommitError;
use crate::core::registry::{self, Registry};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet};

/// Module -> modules it must commit after.
pub type DependencyGraph = BTreeMap<String, BTreeSet<String>>;

/// The resolved, read-only ordering for one process invocation.
#[derive(Debug, Clone)]
pub struct CommitPlan {
    order: Vec<String>,
    levels: Vec<Vec<String>>,
    position: FxHashMap<String, usize>,
    level_of: FxHashMap<String, usize>,
    graph: DependencyGraph,
}

/// Inclusive span of commit-order positions selected by a commit range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitRange {
    pub start: usize,
    pub end: usize,
}

impl CommitRange {
    pub fn contains(&self, position: usize) -> bool {
        (self.start..=self.end).contains(&position)
    }
}

impl CommitPlan {
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    pub fn position(&self, module: &str) -> Option<usize> {
        self.position.get(module).copied()
    }

    pub fn level_of(&self, module: &str) -> Option<usize> {
        self.level_of.get(module).copied()
    }

    pub fn dependencies(&self, module: &str) -> Option<&BTreeSet<String>> {
        self.graph.get(module)
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Parse `<module>` or `<module1>-<module2>` into positions.
    pub fn range(&self, spec: &str) -> Result<CommitRange, CommitError> {
        let (from, to) = match spec.split_once('-') {
            Some((from, to)) => (from.trim(), to.trim()),
            None => (spec.trim(), spec.trim()),
        };
        let lookup = |name: &str| {
            self.position(name).ok_or_else(|| {
                CommitError::NotFound(format!("module '{}' in commit range '{}'", name, spec))
            })
        };
        let start = lookup(from)?;
        let end = lookup(to)?;
        if start > end {
            return Err(CommitError::ValidationError(format!(
                "commit range '{}' is reversed: '{}' commits after '{}'",
                spec, from, to
            )));
        }
        Ok(CommitRange { start, end })
    }
}

/// Run both resolution steps and build the plan.
pub fn resolve(registry: &Registry) -> Result<CommitPlan, CommitError> {
    let graph = match_states(registry)?;
    let order = commit_order(&graph)?;
    let levels = partition_levels(&order, &graph);

    let position = order
        .iter()
        .enumerate()
        .map(|(i, m)| (m.clone(), i))
        .collect();
    let level_of = levels
        .iter()
        .enumerate()
        .flat_map(|(l, mods)| mods.iter().map(move |m| (m.clone(), l)))
        .collect();

    tracing::debug!(
        modules = order.len(),
        levels = levels.len(),
        "resolved commit order"
    );
    Ok(CommitPlan {
        order,
        levels,
        position,
        level_of,
        graph,
    })
}

/// Expand anchors, first/last flags and provides/requires into direct
/// module-to-module edges.
pub fn match_states(registry: &Registry) -> Result<DependencyGraph, CommitError> {
    let mut graph: DependencyGraph = registry
        .modules()
        .map(|m| (m.name.clone(), BTreeSet::new()))
        .collect();
    add_edge(&mut graph, registry::FIRST, registry::SYS);
    add_edge(&mut graph, registry::LAST, registry::FIRST);
    add_edge(&mut graph, registry::DONE, registry::LAST);

    for module in registry.modules() {
        let name = module.name.as_str();
        if registry::is_anchor(name) {
            continue;
        }
        if module.options.commit_first {
            add_edge(&mut graph, name, registry::SYS);
            add_edge(&mut graph, registry::FIRST, name);
        } else if module.options.commit_last {
            add_edge(&mut graph, name, registry::LAST);
            add_edge(&mut graph, registry::DONE, name);
        } else {
            add_edge(&mut graph, name, registry::FIRST);
            add_edge(&mut graph, registry::LAST, name);
        }
    }

    let mut providers: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (module, state) in registry.provides() {
        if !registry.contains(module) {
            return Err(CommitError::RegistrationError(format!(
                "state '{}' provided by unknown module '{}'",
                state, module
            )));
        }
        providers.entry(state.as_str()).or_default().push(module.as_str());
    }
    for module in registry.modules() {
        providers.entry(module.name.as_str()).or_default().push(module.name.as_str());
    }

    for (module, state) in registry.requires() {
        if !registry.contains(module) {
            return Err(CommitError::RegistrationError(format!(
                "requirement '{}' registered for unknown module '{}'",
                state, module
            )));
        }
        let Some(found) = providers.get(state.as_str()) else {
            return Err(CommitError::RegistrationError(format!(
                "module '{}' requires '{}' but nothing provides it",
                module, state
            )));
        };
        for provider in found {
            add_edge(&mut graph, module, provider);
        }
    }

    Ok(graph)
}

fn add_edge(graph: &mut DependencyGraph, from: &str, to: &str) {
    if from != to {
        graph.entry(from.to_string()).or_default().insert(to.to_string());
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Depth-first topological sort; a back edge is a fatal cycle naming both
/// ends of the edge.
pub fn commit_order(graph: &DependencyGraph) -> Result<Vec<String>, CommitError> {
    let mut colors: FxHashMap<&str, Color> =
        graph.keys().map(|k| (k.as_str(), Color::White)).collect();
    let mut order = Vec::with_capacity(graph.len());

    fn visit<'g>(
        node: &'g str,
        graph: &'g DependencyGraph,
        colors: &mut FxHashMap<&'g str, Color>,
        order: &mut Vec<String>,
    ) -> Result<(), CommitError> {
        colors.insert(node, Color::Gray);
        if let Some(deps) = graph.get(node) {
            for dep in deps {
                match colors.get(dep.as_str()).copied().unwrap_or(Color::White) {
                    Color::White => visit(dep, graph, colors, order)?,
                    Color::Gray => {
                        return Err(CommitError::RegistrationError(format!(
                            "dependency cycle between '{}' and '{}'",
                            node, dep
                        )));
                    }
                    Color::Black => {}
                }
            }
        }
        colors.insert(node, Color::Black);
        order.push(node.to_string());
        Ok(())
    }

    for node in graph.keys() {
        if colors.get(node.as_str()) == Some(&Color::White) {
            visit(node, graph, &mut colors, &mut order)?;
        }
    }
    Ok(order)
}

/// Bucket each module one level above its highest dependency.
pub fn partition_levels(order: &[String], graph: &DependencyGraph) -> Vec<Vec<String>> {
    let mut level_of: FxHashMap<&str, usize> = FxHashMap::default();
    let mut levels: Vec<Vec<String>> = Vec::new();

    for module in order {
        let level = graph
            .get(module)
            .into_iter()
            .flatten()
            .filter_map(|dep| level_of.get(dep.as_str()))
            .map(|l| l + 1)
            .max()
            .unwrap_or(0);
        level_of.insert(module.as_str(), level);
        if levels.len() <= level {
            levels.resize_with(level + 1, Vec::new);
        }
        levels[level].push(module.clone());
    }
    levels
}
