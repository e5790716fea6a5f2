//! Stage registry and dependency-order resolution.
//!
//! Stages never name each other. Stage A depends on stage B iff one of
//! A's inputs is an output of B; the registry derives that graph from the
//! artifact declarations and sorts it topologically.

use super::definition::{PipelineDefinition, StageDefinition};
use crate::core::Artifact;
use crate::errors::{
    ContractErrorInfo, CycleDetectedError, DefinitionError, PipelineValidationError,
    UnknownArtifactError,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;

/// Registered stages plus the artifacts they produce.
#[derive(Debug, Clone, Default)]
pub struct StageRegistry {
    /// Stages in registration order.
    stages: Vec<StageDefinition>,
    /// Stage name -> index into `stages`.
    index: HashMap<String, usize>,
    /// Output artifact id -> index of the producing stage.
    producers: HashMap<String, usize>,
    /// Output path -> artifact id, to catch two artifacts sharing a location.
    paths: HashMap<PathBuf, String>,
    /// Artifact ids supplied from outside the pipeline.
    supplied: HashSet<String>,
}

impl StageRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from every stage of a definition, in order.
    ///
    /// # Errors
    ///
    /// Returns the first registration error.
    pub fn from_definition(definition: &PipelineDefinition) -> Result<Self, DefinitionError> {
        if definition.stages.is_empty() {
            return Err(PipelineValidationError::new(format!(
                "Pipeline '{}' has no stages",
                definition.name
            ))
            .with_error_info(
                ContractErrorInfo::new("PIPELINE-EMPTY", "Cannot run an empty pipeline")
                    .with_fix_hint("Add at least one stage to the pipeline definition."),
            )
            .into());
        }

        let mut registry = Self::new();
        for stage in &definition.stages {
            registry.register(stage.clone())?;
        }
        Ok(registry)
    }

    /// Marks artifact ids as supplied from outside the pipeline.
    #[must_use]
    pub fn with_supplied<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supplied.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Marks one artifact id as supplied from outside the pipeline.
    pub fn supply(&mut self, id: impl Into<String>) {
        self.supplied.insert(id.into());
    }

    /// Registers a stage.
    ///
    /// The stage is validated in isolation, then checked against the
    /// stages already registered.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage is invalid, its name is taken, or one
    /// of its outputs reuses another stage's artifact id or path.
    pub fn register(&mut self, mut stage: StageDefinition) -> Result<(), DefinitionError> {
        stage.validate()?;
        stage.claim_outputs();

        if self.index.contains_key(&stage.name) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' is registered twice",
                stage.name
            ))
            .with_stages(vec![stage.name.clone()])
            .with_error_info(
                ContractErrorInfo::new(
                    "PIPELINE-DUPLICATE-STAGE",
                    format!("Stage name '{}' is not unique", stage.name),
                )
                .with_fix_hint("Rename one of the stages."),
            )
            .into());
        }

        let mut new_paths: Vec<(PathBuf, &str)> = Vec::new();
        for artifact in &stage.outputs {
            if let Some(&owner) = self.producers.get(&artifact.id) {
                let other = &self.stages[owner].name;
                return Err(conflict(
                    "PIPELINE-DUPLICATE-ARTIFACT",
                    format!(
                        "Artifact '{}' is produced by both '{}' and '{}'",
                        artifact.id, other, stage.name
                    ),
                    vec![other.clone(), stage.name.clone()],
                ));
            }
            let path = artifact.path.clone();
            let shared = self
                .paths
                .get(&path)
                .map(String::as_str)
                .or_else(|| new_paths.iter().find(|(p, _)| *p == path).map(|(_, id)| *id));
            if let Some(existing) = shared {
                return Err(conflict(
                    "PIPELINE-DUPLICATE-PATH",
                    format!(
                        "Artifacts '{}' and '{}' share the path '{}'",
                        existing,
                        artifact.id,
                        path.display()
                    ),
                    vec![stage.name.clone()],
                ));
            }
            new_paths.push((path, artifact.id.as_str()));
        }

        let position = self.stages.len();
        for (path, id) in new_paths {
            self.paths.insert(path, id.to_string());
        }
        for artifact in &stage.outputs {
            self.producers.insert(artifact.id.clone(), position);
        }
        self.index.insert(stage.name.clone(), position);
        self.stages.push(stage);
        Ok(())
    }

    /// Returns the registered stages in registration order.
    #[must_use]
    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    /// Returns the stage with the given name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StageDefinition> {
        self.index.get(name).map(|&i| &self.stages[i])
    }

    /// Returns the stage that produces the artifact.
    #[must_use]
    pub fn producer_of(&self, artifact: &str) -> Option<&StageDefinition> {
        self.producers.get(artifact).map(|&i| &self.stages[i])
    }

    /// Returns the declared output artifact with the given id.
    #[must_use]
    pub fn output_artifact(&self, artifact: &str) -> Option<&Artifact> {
        self.producer_of(artifact)
            .and_then(|stage| stage.output_artifact(artifact))
    }

    /// Returns the number of registered stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if no stage is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Returns the names of the stages `stage` depends on, in registration order.
    #[must_use]
    pub fn dependencies_of(&self, stage: &str) -> Vec<&str> {
        self.index
            .get(stage)
            .map(|&i| {
                self.upstream(i)
                    .into_iter()
                    .map(|j| self.stages[j].name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolves the execution order.
    ///
    /// Returns the stages in topological order over the artifact graph;
    /// among stages whose dependencies are all satisfied, the one
    /// registered first comes first.
    ///
    /// # Errors
    ///
    /// Returns `DefinitionError::UnknownArtifact` if an input is neither
    /// produced nor supplied, `DefinitionError::Invalid` if a supplied id is
    /// also produced, and `DefinitionError::Cycle` if the graph is cyclic.
    pub fn resolve_order(&self) -> Result<Vec<&StageDefinition>, DefinitionError> {
        self.check_artifacts()?;

        let mut in_degree: Vec<usize> = Vec::with_capacity(self.stages.len());
        let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); self.stages.len()];
        for i in 0..self.stages.len() {
            let upstream = self.upstream(i);
            in_degree.push(upstream.len());
            for j in upstream {
                downstream[j].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &degree)| degree == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.stages.len());

        while let Some(next) = ready.pop_first() {
            order.push(&self.stages[next]);
            for &child in &downstream[next] {
                in_degree[child] -= 1;
                if in_degree[child] == 0 {
                    ready.insert(child);
                }
            }
        }

        if order.len() < self.stages.len() {
            let cycle = self.find_cycle().unwrap_or_else(|| {
                in_degree
                    .iter()
                    .enumerate()
                    .filter(|(_, &degree)| degree > 0)
                    .map(|(i, _)| self.stages[i].name.clone())
                    .collect()
            });
            return Err(CycleDetectedError::new(cycle).into());
        }

        Ok(order)
    }

    /// Returns the resolved order as stage names.
    ///
    /// # Errors
    ///
    /// See [`StageRegistry::resolve_order`].
    pub fn resolve_names(&self) -> Result<Vec<String>, DefinitionError> {
        Ok(self
            .resolve_order()?
            .into_iter()
            .map(|stage| stage.name.clone())
            .collect())
    }

    fn check_artifacts(&self) -> Result<(), DefinitionError> {
        let mut supplied: Vec<&String> = self.supplied.iter().collect();
        supplied.sort();
        for id in supplied {
            if let Some(&owner) = self.producers.get(id) {
                let stage = &self.stages[owner].name;
                return Err(conflict(
                    "PIPELINE-SUPPLIED-AND-PRODUCED",
                    format!("Artifact '{id}' is supplied as an input but also produced by '{stage}'"),
                    vec![stage.clone()],
                ));
            }
        }

        for stage in &self.stages {
            for input in &stage.inputs {
                if !self.producers.contains_key(input) && !self.supplied.contains(input) {
                    return Err(UnknownArtifactError::new(&stage.name, input).into());
                }
            }
        }
        Ok(())
    }

    /// Indices of the stages producing `i`'s inputs, deduplicated and sorted.
    fn upstream(&self, i: usize) -> BTreeSet<usize> {
        self.stages[i]
            .inputs
            .iter()
            .filter_map(|input| self.producers.get(input).copied())
            .collect()
    }

    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        (0..self.stages.len()).find_map(|i| {
            if visited.contains(&i) {
                None
            } else {
                self.dfs_cycle(i, &mut visited, &mut rec_stack, &mut path)
            }
        })
    }

    fn dfs_cycle(
        &self,
        node: usize,
        visited: &mut HashSet<usize>,
        rec_stack: &mut HashSet<usize>,
        path: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        visited.insert(node);
        rec_stack.insert(node);
        path.push(node);

        for dep in self.upstream(node) {
            if !visited.contains(&dep) {
                if let Some(cycle) = self.dfs_cycle(dep, visited, rec_stack, path) {
                    return Some(cycle);
                }
            } else if rec_stack.contains(&dep) {
                let start = path.iter().position(|&n| n == dep).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..]
                    .iter()
                    .map(|&n| self.stages[n].name.clone())
                    .collect();
                cycle.push(self.stages[dep].name.clone());
                return Some(cycle);
            }
        }

        path.pop();
        rec_stack.remove(&node);
        None
    }
}

fn conflict(code: &str, message: String, stages: Vec<String>) -> DefinitionError {
    PipelineValidationError::new(message.clone())
        .with_stages(stages)
        .with_error_info(
            ContractErrorInfo::new(code, message)
                .with_fix_hint("Give every produced artifact a unique id and path."),
        )
        .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Invocation;
    use pretty_assertions::assert_eq;

    /// A stage that reads `inputs` and writes one file output named `output`.
    fn stage(name: &str, inputs: &[&str], output: &str) -> StageDefinition {
        let mut invocation = Invocation::new("tool").output(output);
        let mut definition = StageDefinition::new(name);
        for input in inputs {
            definition = definition.input(*input);
            invocation = invocation.input(*input);
        }
        definition
            .output(Artifact::file(output, format!("{output}.dat")))
            .invocation(invocation)
    }

    fn assert_respects_edges(registry: &StageRegistry, order: &[String]) {
        for (position, name) in order.iter().enumerate() {
            for dep in registry.dependencies_of(name) {
                let dep_position = order.iter().position(|n| n == dep).unwrap();
                assert!(dep_position < position, "{dep} must precede {name}");
            }
        }
    }

    #[test]
    fn test_linear_chain_order() {
        let mut registry = StageRegistry::new().with_supplied(["reads"]);
        registry.register(stage("call", &["sorted"], "vcf")).unwrap();
        registry.register(stage("sort", &["bam"], "sorted")).unwrap();
        registry.register(stage("align", &["reads"], "bam")).unwrap();

        assert_eq!(registry.resolve_names().unwrap(), vec!["align", "sort", "call"]);
    }

    #[test]
    fn test_ties_broken_by_registration_order() {
        let mut registry = StageRegistry::new().with_supplied(["reads", "reference"]);
        registry.register(stage("quality-check", &["reads"], "quality")).unwrap();
        registry.register(stage("align", &["reads", "reference"], "bam")).unwrap();
        registry.register(stage("index-ref", &["reference"], "fai")).unwrap();
        registry.register(stage("call", &["bam", "fai"], "vcf")).unwrap();

        let order = registry.resolve_names().unwrap();
        assert_eq!(order, vec!["quality-check", "align", "index-ref", "call"]);
        assert_respects_edges(&registry, &order);
    }

    #[test]
    fn test_diamond_respects_all_edges() {
        let mut registry = StageRegistry::new().with_supplied(["src"]);
        registry.register(stage("d", &["b_out", "c_out"], "d_out")).unwrap();
        registry.register(stage("c", &["a_out"], "c_out")).unwrap();
        registry.register(stage("b", &["a_out"], "b_out")).unwrap();
        registry.register(stage("a", &["src"], "a_out")).unwrap();

        let order = registry.resolve_names().unwrap();
        assert_eq!(order, vec!["a", "c", "b", "d"]);
        assert_respects_edges(&registry, &order);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let build = || {
            let mut registry = StageRegistry::new().with_supplied(["x"]);
            registry.register(stage("p", &["x"], "p_out")).unwrap();
            registry.register(stage("q", &["x"], "q_out")).unwrap();
            registry.register(stage("r", &["p_out", "q_out"], "r_out")).unwrap();
            registry.resolve_names().unwrap()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn test_cycle_detected() {
        let mut registry = StageRegistry::new();
        registry.register(stage("a", &["c_out"], "a_out")).unwrap();
        registry.register(stage("b", &["a_out"], "b_out")).unwrap();
        registry.register(stage("c", &["b_out"], "c_out")).unwrap();

        let err = registry.resolve_order().unwrap_err();
        let DefinitionError::Cycle(cycle) = err else {
            panic!("expected a cycle error, got {err:?}");
        };
        let mut stages = cycle.stages().to_vec();
        stages.sort();
        assert_eq!(stages, vec!["a", "b", "c"]);
        assert_eq!(cycle.cycle_path.first(), cycle.cycle_path.last());
    }

    #[test]
    fn test_cycle_reported_only_for_cyclic_part() {
        let mut registry = StageRegistry::new().with_supplied(["reads"]);
        registry.register(stage("align", &["reads"], "bam")).unwrap();
        registry.register(stage("x", &["bam", "y_out"], "x_out")).unwrap();
        registry.register(stage("y", &["x_out"], "y_out")).unwrap();

        let err = registry.resolve_order().unwrap_err();
        let stages = err.stages();
        assert!(stages.contains(&"x".to_string()));
        assert!(!stages.contains(&"align".to_string()));
    }

    #[test]
    fn test_self_cycle_detected() {
        let mut registry = StageRegistry::new();
        registry
            .register(
                StageDefinition::new("loop")
                    .input("state")
                    .output(Artifact::file("state", "state.json"))
                    .invocation(Invocation::new("tool").input("state").output("state")),
            )
            .unwrap();

        let err = registry.resolve_order().unwrap_err();
        assert!(matches!(err, DefinitionError::Cycle(_)));
        assert_eq!(err.stages(), vec!["loop".to_string()]);
    }

    #[test]
    fn test_unknown_artifact() {
        let mut registry = StageRegistry::new();
        registry.register(stage("sort", &["aligned_bam"], "sorted")).unwrap();

        let err = registry.resolve_order().unwrap_err();
        let DefinitionError::UnknownArtifact(unknown) = err else {
            panic!("expected an unknown artifact error, got {err:?}");
        };
        assert_eq!(unknown.stage, "sort");
        assert_eq!(unknown.artifact, "aligned_bam");
    }

    #[test]
    fn test_supplied_input_satisfies_dependency() {
        let mut registry = StageRegistry::new();
        registry.register(stage("sort", &["aligned_bam"], "sorted")).unwrap();
        registry.supply("aligned_bam");

        assert_eq!(registry.resolve_names().unwrap(), vec!["sort"]);
    }

    #[test]
    fn test_supplied_and_produced_rejected() {
        let mut registry = StageRegistry::new().with_supplied(["reads", "bam"]);
        registry.register(stage("align", &["reads"], "bam")).unwrap();

        let err = registry.resolve_order().unwrap_err();
        assert_eq!(
            err.error_info().map(|i| i.code.as_str()),
            Some("PIPELINE-SUPPLIED-AND-PRODUCED")
        );
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let mut registry = StageRegistry::new();
        registry.register(stage("align", &[], "bam")).unwrap();
        let err = registry.register(stage("align", &[], "bam2")).unwrap_err();

        assert_eq!(err.error_info().map(|i| i.code.as_str()), Some("PIPELINE-DUPLICATE-STAGE"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_artifact_rejected() {
        let mut registry = StageRegistry::new();
        registry.register(stage("a", &[], "bam")).unwrap();
        let err = registry.register(stage("b", &[], "bam")).unwrap_err();

        assert_eq!(err.error_info().map(|i| i.code.as_str()), Some("PIPELINE-DUPLICATE-ARTIFACT"));
        assert_eq!(err.stages(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_duplicate_path_rejected() {
        let mut registry = StageRegistry::new();
        registry.register(stage("a", &[], "bam")).unwrap();
        let clash = StageDefinition::new("b")
            .output(Artifact::file("other", "bam.dat"))
            .invocation(Invocation::new("tool").output("other"));

        let err = registry.register(clash).unwrap_err();
        assert_eq!(err.error_info().map(|i| i.code.as_str()), Some("PIPELINE-DUPLICATE-PATH"));
    }

    #[test]
    fn test_invalid_stage_rejected_at_registration() {
        let mut registry = StageRegistry::new();
        let err = registry
            .register(StageDefinition::new("empty").invocation(Invocation::new("true")))
            .unwrap_err();
        assert!(matches!(err, DefinitionError::Invalid(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_from_empty_definition() {
        let err = StageRegistry::from_definition(&PipelineDefinition::new("empty")).unwrap_err();
        assert_eq!(err.error_info().map(|i| i.code.as_str()), Some("PIPELINE-EMPTY"));
    }

    #[test]
    fn test_lookup_helpers() {
        let mut registry = StageRegistry::new().with_supplied(["reads"]);
        registry.register(stage("align", &["reads"], "bam")).unwrap();

        assert_eq!(registry.producer_of("bam").map(|s| s.name.as_str()), Some("align"));
        assert_eq!(
            registry.output_artifact("bam").and_then(|a| a.produced_by.as_deref()),
            Some("align")
        );
        assert!(registry.get("align").is_some());
        assert!(registry.producer_of("reads").is_none());
    }
}
