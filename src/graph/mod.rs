use crate::error::DeclarationError;
use crate::module::{AccountRef, DeploymentFuture, FutureId, FutureRef, Module, is_valid_identifier};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Validated dependency DAG over every future reachable from a module.
///
/// Imported modules are flattened in depth first, so declaration order is
/// "imports before importers, then source order".
#[derive(Debug, Clone)]
pub struct DeploymentGraph {
    module_id: String,
    futures: Vec<DeploymentFuture>,
    /// Fingerprint of each future, by declaration index.
    fingerprints: Vec<String>,
    index: HashMap<FutureId, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    exports: BTreeMap<String, FutureRef>,
}

impl DeploymentGraph {
    pub fn build(module: &Module) -> Result<Self, DeclarationError> {
        let mut seen: HashMap<&str, &Module> = HashMap::new();
        let mut stack: Vec<String> = Vec::new();
        let mut futures: Vec<DeploymentFuture> = Vec::new();
        flatten(module, &mut seen, &mut stack, &mut futures)?;

        let mut index = HashMap::with_capacity(futures.len());
        for (position, future) in futures.iter().enumerate() {
            if index.insert(future.id.clone(), position).is_some() {
                return Err(DeclarationError::DuplicateIdentifier(future.id.to_string()));
            }
        }

        let mut dependencies = vec![Vec::new(); futures.len()];
        let mut dependents = vec![Vec::new(); futures.len()];
        for (position, future) in futures.iter().enumerate() {
            for dependency in future.all_dependencies() {
                let Some(&target) = index.get(&dependency) else {
                    return Err(DeclarationError::UnresolvedReference {
                        from: future.id.to_string(),
                        missing: dependency.to_string(),
                    });
                };
                if target == position {
                    return Err(DeclarationError::CyclicDependency(vec![
                        future.id.to_string(),
                        future.id.to_string(),
                    ]));
                }
                dependencies[position].push(target);
                dependents[target].push(position);
            }
        }

        for (name, export) in &module.exports {
            if !index.contains_key(export.id()) {
                return Err(DeclarationError::UnresolvedReference {
                    from: format!("{} export {name}", module.id),
                    missing: export.id().to_string(),
                });
            }
        }

        let fingerprints = futures
            .iter()
            .map(DeploymentFuture::fingerprint)
            .collect::<Result<Vec<_>, _>>()?;

        let graph = Self {
            module_id: module.id.clone(),
            futures,
            fingerprints,
            index,
            dependencies,
            dependents,
            exports: module.exports.clone(),
        };
        graph.validate_cycle_free()?;
        Ok(graph)
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    /// All futures in declaration order.
    pub fn futures(&self) -> &[DeploymentFuture] {
        &self.futures
    }

    pub fn len(&self) -> usize {
        self.futures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.futures.is_empty()
    }

    pub fn future(&self, id: &FutureId) -> Option<&DeploymentFuture> {
        self.position(id).map(|position| &self.futures[position])
    }

    /// Definition fingerprint journaled with the future's progress.
    pub fn fingerprint(&self, id: &FutureId) -> Option<&str> {
        self.position(id).map(|position| self.fingerprints[position].as_str())
    }

    /// Declaration index, used as the stable tie-break everywhere.
    pub fn position(&self, id: &FutureId) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn contains(&self, id: &FutureId) -> bool {
        self.index.contains_key(id)
    }

    pub fn exports(&self) -> &BTreeMap<String, FutureRef> {
        &self.exports
    }

    pub fn sender(&self, id: &FutureId) -> Option<AccountRef> {
        self.future(id).and_then(DeploymentFuture::sender)
    }

    pub fn dependencies(&self, id: &FutureId) -> Vec<&DeploymentFuture> {
        self.neighbors(id, &self.dependencies)
    }

    pub fn dependents(&self, id: &FutureId) -> Vec<&DeploymentFuture> {
        self.neighbors(id, &self.dependents)
    }

    /// Every future that directly or transitively depends on `id`, in
    /// declaration order.
    pub fn transitive_dependents(&self, id: &FutureId) -> Vec<&DeploymentFuture> {
        let Some(start) = self.position(id) else {
            return Vec::new();
        };

        let mut reached = BTreeSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            for &dependent in &self.dependents[current] {
                if reached.insert(dependent) {
                    queue.push_back(dependent);
                }
            }
        }

        reached
            .into_iter()
            .map(|position| &self.futures[position])
            .collect()
    }

    /// Kahn's algorithm; among ready futures the earliest declared goes first.
    pub fn topological_order(&self) -> Vec<&DeploymentFuture> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut queue: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter_map(|(position, degree)| (*degree == 0).then_some(position))
            .collect();

        let mut sorted = Vec::with_capacity(self.futures.len());
        while let Some(position) = queue.pop_first() {
            sorted.push(&self.futures[position]);
            for &dependent in &self.dependents[position] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.insert(dependent);
                }
            }
        }
        sorted
    }

    fn neighbors(&self, id: &FutureId, edges: &[Vec<usize>]) -> Vec<&DeploymentFuture> {
        self.position(id)
            .map(|position| {
                edges[position]
                    .iter()
                    .map(|&neighbor| &self.futures[neighbor])
                    .collect()
            })
            .unwrap_or_default()
    }

    fn validate_cycle_free(&self) -> Result<(), DeclarationError> {
        let mut states = vec![None; self.futures.len()];
        let mut stack = Vec::new();

        for position in 0..self.futures.len() {
            if states[position].is_some() {
                continue;
            }
            if let Some(path) = self.detect_cycle(position, &mut states, &mut stack) {
                return Err(DeclarationError::CyclicDependency(
                    path.into_iter()
                        .map(|position| self.futures[position].id.to_string())
                        .collect(),
                ));
            }
        }
        Ok(())
    }

    fn detect_cycle(
        &self,
        position: usize,
        states: &mut [Option<NodeState>],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        states[position] = Some(NodeState::Visiting);
        stack.push(position);

        for &neighbor in &self.dependencies[position] {
            match states[neighbor] {
                Some(NodeState::Visiting) => {
                    let start = stack
                        .iter()
                        .position(|&entry| entry == neighbor)
                        .unwrap_or_default();
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(neighbor);
                    return Some(cycle);
                }
                Some(NodeState::Visited) => {}
                None => {
                    if let Some(path) = self.detect_cycle(neighbor, states, stack) {
                        return Some(path);
                    }
                }
            }
        }

        stack.pop();
        states[position] = Some(NodeState::Visited);
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Visiting,
    Visited,
}

fn flatten<'m>(
    module: &'m Module,
    seen: &mut HashMap<&'m str, &'m Module>,
    stack: &mut Vec<String>,
    futures: &mut Vec<DeploymentFuture>,
) -> Result<(), DeclarationError> {
    if let Some(index) = stack.iter().position(|entry| *entry == module.id) {
        let mut cycle = stack[index..].to_vec();
        cycle.push(module.id.clone());
        return Err(DeclarationError::CyclicDependency(cycle));
    }
    if let Some(known) = seen.get(module.id.as_str()) {
        if *known == module {
            return Ok(());
        }
        return Err(DeclarationError::DuplicateIdentifier(module.id.clone()));
    }
    if !is_valid_identifier(&module.id) {
        return Err(DeclarationError::InvalidIdentifier(module.id.clone()));
    }

    stack.push(module.id.clone());
    for submodule in &module.submodules {
        flatten(submodule, seen, stack, futures)?;
    }
    stack.pop();

    for future in &module.futures {
        if future.id.module() != module.id || !is_valid_identifier(future.id.local()) {
            return Err(DeclarationError::InvalidIdentifier(future.id.to_string()));
        }
        futures.push(future.clone());
    }
    seen.insert(module.id.as_str(), module);
    Ok(())
}
