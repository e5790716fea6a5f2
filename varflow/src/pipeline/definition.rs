//! Declarative stage and pipeline definitions.

use crate::core::{Artifact, Invocation};
use crate::errors::{ContractErrorInfo, PipelineValidationError, VarflowError};
use crate::store::{staged_name, STAGING_DIR};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsStr;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// A named unit of work: required inputs, produced outputs and the
/// commands that turn one into the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Unique stage name.
    pub name: String,

    /// Free-form description shown in logs and reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Artifact ids that must exist before the stage runs, in order.
    #[serde(default)]
    pub inputs: Vec<String>,

    /// Artifacts the stage produces, in order.
    pub outputs: Vec<Artifact>,

    /// Commands executed in order to produce the outputs.
    pub invocations: Vec<Invocation>,
}

impl StageDefinition {
    /// Creates an empty stage definition.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            invocations: Vec::new(),
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Adds a required input.
    #[must_use]
    pub fn input(mut self, artifact: impl Into<String>) -> Self {
        self.inputs.push(artifact.into());
        self
    }

    /// Adds a produced output, recording this stage as its producer.
    #[must_use]
    pub fn output(mut self, artifact: Artifact) -> Self {
        let name = self.name.clone();
        self.outputs.push(artifact.with_producer(name));
        self
    }

    /// Appends an invocation.
    #[must_use]
    pub fn invocation(mut self, invocation: Invocation) -> Self {
        self.invocations.push(invocation);
        self
    }

    /// Returns the declared output with the given id.
    #[must_use]
    pub fn output_artifact(&self, id: &str) -> Option<&Artifact> {
        self.outputs.iter().find(|artifact| artifact.id == id)
    }

    /// Returns every parameter name the invocations reference.
    #[must_use]
    pub fn referenced_params(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.invocations
            .iter()
            .flat_map(Invocation::referenced_params)
            .filter(|name| seen.insert(*name))
            .collect()
    }

    /// Sets every output's producer to this stage.
    pub(crate) fn claim_outputs(&mut self) {
        for artifact in &mut self.outputs {
            artifact.produced_by = Some(self.name.clone());
        }
    }

    /// Validates the stage in isolation.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is blank or is not a single path
    /// segment, the stage declares no outputs or no invocations, an output
    /// id repeats, an output path leaves the output directory or clashes in
    /// staging, an output is never written by any invocation, or an
    /// invocation references an artifact the stage does not declare.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new("Stage name cannot be empty or whitespace-only")
                .with_error_info(ContractErrorInfo::new("STAGE-EMPTY-NAME", "Stage has no name")));
        }

        if matches!(self.name.as_str(), "." | "..") || self.name.contains(['/', '\\']) {
            return Err(self.error(
                "STAGE-BAD-NAME",
                format!("Stage name '{}' is not a plain name", self.name),
                "Stage names become directory names; drop path separators and '.'/'..'.",
            ));
        }

        if self.outputs.is_empty() {
            return Err(self.error(
                "STAGE-NO-OUTPUTS",
                format!("Stage '{}' declares no outputs", self.name),
                "Declare at least one output artifact; stages without outputs cannot be resumed.",
            ));
        }

        if self.invocations.is_empty() {
            return Err(self.error(
                "STAGE-NO-INVOCATIONS",
                format!("Stage '{}' has no invocations", self.name),
                "Add the command that produces the stage's outputs.",
            ));
        }

        let mut output_ids = HashSet::new();
        let mut staged = HashSet::new();
        for artifact in &self.outputs {
            if !output_ids.insert(artifact.id.as_str()) {
                return Err(self.error(
                    "STAGE-DUPLICATE-OUTPUT",
                    format!("Stage '{}' declares output '{}' twice", self.name, artifact.id),
                    "Give every output a distinct id.",
                ));
            }

            if let Some(problem) = output_path_problem(&artifact.path) {
                return Err(self.error(
                    "STAGE-BAD-PATH",
                    format!(
                        "Output '{}' of stage '{}' has path '{}', which {problem}",
                        artifact.id,
                        self.name,
                        artifact.path.display()
                    ),
                    "Use a path inside the output directory, or an absolute path without '..'.",
                ));
            }

            if !staged.insert(staged_name(artifact)) {
                return Err(self.error(
                    "STAGE-STAGING-COLLISION",
                    format!(
                        "Output '{}' of stage '{}' shares its staging location with another output",
                        artifact.id, self.name
                    ),
                    "Absolute outputs are staged by file name; give them distinct file names.",
                ));
            }
        }

        let written: HashSet<&str> = self
            .invocations
            .iter()
            .flat_map(Invocation::referenced_outputs)
            .collect();

        if let Some(artifact) = self.outputs.iter().find(|a| !written.contains(a.id.as_str())) {
            return Err(self.error(
                "STAGE-UNWRITTEN-OUTPUT",
                format!(
                    "Output '{}' of stage '{}' is not written by any invocation",
                    artifact.id, self.name
                ),
                "Reference the output as {out:<id>} in an argument or as a stdout target.",
            ));
        }

        if let Some(id) = written.iter().find(|id| !output_ids.contains(*id)) {
            return Err(self.error(
                "STAGE-UNDECLARED-OUTPUT",
                format!("Stage '{}' writes undeclared output '{id}'", self.name),
                "Add the artifact to the stage's outputs.",
            ));
        }

        let inputs: HashSet<&str> = self.inputs.iter().map(String::as_str).collect();
        let read = self.invocations.iter().flat_map(Invocation::referenced_inputs);
        for id in read {
            if !inputs.contains(id) {
                return Err(self.error(
                    "STAGE-UNDECLARED-INPUT",
                    format!("Stage '{}' reads undeclared input '{id}'", self.name),
                    "Add the artifact to the stage's inputs so ordering and precondition checks see it.",
                ));
            }
        }

        Ok(())
    }

    fn error(&self, code: &str, message: String, hint: &str) -> PipelineValidationError {
        PipelineValidationError::new(message.clone())
            .with_stages(vec![self.name.clone()])
            .with_error_info(
                ContractErrorInfo::new(code, message)
                    .with_fix_hint(hint)
                    .with_context_entry("stage", self.name.clone()),
            )
    }
}

/// Describes why `path` cannot hold a produced output, if it cannot.
fn output_path_problem(path: &Path) -> Option<&'static str> {
    if path.components().any(|c| c == Component::ParentDir) {
        return Some("contains '..'");
    }
    if !matches!(path.components().next_back(), Some(Component::Normal(_))) {
        return Some("does not name a file or directory");
    }
    let first = path.components().find(|c| matches!(c, Component::Normal(_)));
    if !path.is_absolute() && first == Some(Component::Normal(OsStr::new(STAGING_DIR))) {
        return Some("is reserved for staged outputs");
    }
    None
}

/// A complete pipeline: stages plus default parameter values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name.
    pub name: String,

    /// Stages in registration order.
    pub stages: Vec<StageDefinition>,

    /// Default values for `{param:...}` placeholders. Runner parameters
    /// take precedence.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl PipelineDefinition {
    /// Creates an empty pipeline definition.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            params: BTreeMap::new(),
        }
    }

    /// Appends a stage.
    #[must_use]
    pub fn stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    /// Sets a default parameter value.
    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    /// Returns the stage with the given name.
    #[must_use]
    pub fn get_stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    /// Returns every distinct program the pipeline invokes, in first-use order.
    #[must_use]
    pub fn programs(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.stages
            .iter()
            .flat_map(|stage| &stage.invocations)
            .map(|invocation| invocation.program.as_str())
            .filter(|program| seen.insert(*program))
            .collect()
    }

    /// Parses a definition from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or an argument template
    /// is invalid.
    pub fn from_json_str(json: &str) -> Result<Self, VarflowError> {
        let mut definition: Self = serde_json::from_str(json)?;
        for stage in &mut definition.stages {
            stage.claim_outputs();
        }
        Ok(definition)
    }

    /// Reads a definition from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, VarflowError> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Serializes the definition as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, VarflowError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Artifacts supplied to a run from outside the pipeline, such as raw
/// reads and the reference genome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineInputs {
    artifacts: Vec<Artifact>,
}

impl PipelineInputs {
    /// Creates an empty input set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Supplies a file input. A later entry with the same id replaces an earlier one.
    #[must_use]
    pub fn file(self, id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.with(Artifact::file(id, path))
    }

    /// Supplies a directory input.
    #[must_use]
    pub fn directory(self, id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.with(Artifact::directory(id, path))
    }

    /// Supplies an artifact.
    #[must_use]
    pub fn with(mut self, mut artifact: Artifact) -> Self {
        artifact.produced_by = None;
        self.artifacts.retain(|existing| existing.id != artifact.id);
        self.artifacts.push(artifact);
        self
    }

    /// Returns the supplied artifact with the given id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Artifact> {
        self.artifacts.iter().find(|artifact| artifact.id == id)
    }

    /// Returns true if an artifact with the given id is supplied.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Iterates over the supplied artifacts.
    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.artifacts.iter()
    }

    /// Iterates over the supplied artifact ids.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.artifacts.iter().map(|artifact| artifact.id.as_str())
    }

    /// Returns the number of supplied artifacts.
    #[must_use]
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    /// Returns true if nothing is supplied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ArtifactKind;
    use pretty_assertions::assert_eq;

    fn sort_stage() -> StageDefinition {
        StageDefinition::new("sort")
            .input("aligned_bam")
            .output(Artifact::file("sorted_bam", "aligned_sorted.bam"))
            .invocation(
                Invocation::new("samtools")
                    .args(["sort", "-o"])
                    .output("sorted_bam")
                    .input("aligned_bam"),
            )
    }

    #[test]
    fn test_builder_records_producer() {
        let stage = sort_stage();
        assert_eq!(stage.outputs[0].produced_by.as_deref(), Some("sort"));
        assert!(stage.validate().is_ok());
    }

    #[test]
    fn test_stage_without_outputs_rejected() {
        let stage = StageDefinition::new("noop").invocation(Invocation::new("true"));
        let err = stage.validate().unwrap_err();
        assert_eq!(err.code(), Some("STAGE-NO-OUTPUTS"));
        assert_eq!(err.stages, vec!["noop".to_string()]);
    }

    #[test]
    fn test_stage_without_invocations_rejected() {
        let stage = StageDefinition::new("sort").output(Artifact::file("sorted_bam", "s.bam"));
        assert_eq!(stage.validate().unwrap_err().code(), Some("STAGE-NO-INVOCATIONS"));
    }

    #[test]
    fn test_unwritten_output_rejected() {
        let stage = sort_stage().output(Artifact::file("sorted_bam_index", "aligned_sorted.bam.bai"));
        assert_eq!(stage.validate().unwrap_err().code(), Some("STAGE-UNWRITTEN-OUTPUT"));
    }

    #[test]
    fn test_stdout_target_counts_as_written() {
        let stage = StageDefinition::new("call-variants")
            .input("reference")
            .input("sorted_bam")
            .output(Artifact::file("variants_vcf", "variants.vcf"))
            .invocation(
                Invocation::new("freebayes")
                    .arg("-f")
                    .input("reference")
                    .input("sorted_bam")
                    .stdout_to("variants_vcf"),
            );
        assert!(stage.validate().is_ok());
    }

    #[test]
    fn test_undeclared_input_rejected() {
        let stage = StageDefinition::new("sort")
            .output(Artifact::file("sorted_bam", "s.bam"))
            .invocation(Invocation::new("samtools").output("sorted_bam").input("aligned_bam"));
        assert_eq!(stage.validate().unwrap_err().code(), Some("STAGE-UNDECLARED-INPUT"));
    }

    #[test]
    fn test_undeclared_output_rejected() {
        let stage = sort_stage().invocation(Invocation::new("samtools").output("stray"));
        assert_eq!(stage.validate().unwrap_err().code(), Some("STAGE-UNDECLARED-OUTPUT"));
    }

    #[test]
    fn test_duplicate_output_rejected() {
        let stage = sort_stage().output(Artifact::file("sorted_bam", "other.bam"));
        assert_eq!(stage.validate().unwrap_err().code(), Some("STAGE-DUPLICATE-OUTPUT"));
    }

    #[test]
    fn test_stage_names_must_be_plain() {
        for name in ["..", ".", "qc/../..", "align\\tmp"] {
            let mut stage = sort_stage();
            stage.name = name.to_string();
            assert_eq!(stage.validate().unwrap_err().code(), Some("STAGE-BAD-NAME"), "{name}");
        }
        let mut stage = sort_stage();
        stage.name = "call-variants.v2".to_string();
        assert!(stage.validate().is_ok());
    }

    #[test]
    fn test_output_paths_stay_inside_output_directory() {
        for path in ["../../escaped.txt", "calls/../../x.vcf", "/data/../etc/x", "", ".", ".varflow-staging/sort/x.bam"] {
            let stage = StageDefinition::new("sort")
                .input("aligned_bam")
                .output(Artifact::file("sorted_bam", path))
                .invocation(Invocation::new("samtools").output("sorted_bam").input("aligned_bam"));
            assert_eq!(stage.validate().unwrap_err().code(), Some("STAGE-BAD-PATH"), "{path}");
        }

        let stage = StageDefinition::new("sort")
            .input("aligned_bam")
            .output(Artifact::file("sorted_bam", "./bam/aligned_sorted.bam"))
            .output(Artifact::file("archived_bam", "/archive/aligned_sorted.bam.md5"))
            .invocation(
                Invocation::new("samtools")
                    .output("sorted_bam")
                    .output("archived_bam")
                    .input("aligned_bam"),
            );
        assert!(stage.validate().is_ok());
    }

    #[test]
    fn test_absolute_outputs_with_same_file_name_rejected() {
        let stage = StageDefinition::new("call-variants")
            .output(Artifact::file("raw", "/a/x.vcf"))
            .output(Artifact::file("filtered", "/b/x.vcf"))
            .invocation(Invocation::new("freebayes").output("raw").output("filtered"));
        assert_eq!(stage.validate().unwrap_err().code(), Some("STAGE-STAGING-COLLISION"));

        let stage = StageDefinition::new("call-variants")
            .output(Artifact::file("raw", "x.vcf"))
            .output(Artifact::file("filtered", "/b/x.vcf"))
            .invocation(Invocation::new("freebayes").output("raw").output("filtered"));
        assert_eq!(stage.validate().unwrap_err().code(), Some("STAGE-STAGING-COLLISION"));
    }

    #[test]
    fn test_definition_json_round_trip_claims_outputs() {
        let json = r#"{
            "name": "custom",
            "params": {"threads": "2"},
            "stages": [{
                "name": "quality-check",
                "inputs": ["reads_r1"],
                "outputs": [{"id": "quality_report", "path": "quality", "kind": "directory"}],
                "invocations": [{"program": "fastqc", "args": ["-o", "{out:quality_report}", "{in:reads_r1}"]}]
            }]
        }"#;

        let definition = PipelineDefinition::from_json_str(json).unwrap();
        let stage = definition.get_stage("quality-check").unwrap();

        assert_eq!(stage.outputs[0].kind, ArtifactKind::Directory);
        assert_eq!(stage.outputs[0].produced_by.as_deref(), Some("quality-check"));
        assert_eq!(definition.params.get("threads").map(String::as_str), Some("2"));
        assert_eq!(definition.programs(), vec!["fastqc"]);
        assert!(stage.validate().is_ok());
    }

    #[test]
    fn test_definition_rejects_bad_template() {
        let json = r#"{"name": "bad", "stages": [{
            "name": "s", "outputs": [{"id": "o", "path": "o"}],
            "invocations": [{"program": "x", "args": ["{out:}"]}]
        }]}"#;
        assert!(matches!(
            PipelineDefinition::from_json_str(json),
            Err(VarflowError::Serialization(_))
        ));
    }

    #[test]
    fn test_pipeline_inputs_replace_by_id() {
        let inputs = PipelineInputs::new()
            .file("reference", "old.fasta")
            .file("reference", "ref.fasta")
            .file("reads_r1", "sample.R1.fq");

        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs.get("reference").unwrap().path, PathBuf::from("ref.fasta"));
        assert!(!inputs.get("reference").unwrap().is_produced());
        assert_eq!(inputs.ids().collect::<Vec<_>>(), vec!["reference", "reads_r1"]);
    }
}
