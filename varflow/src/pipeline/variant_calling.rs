//! The built-in paired-end variant-calling pipeline.
//!
//! Four stages: read quality control, alignment, sort and index,
//! variant calling.

use super::config::RunnerConfig;
use super::definition::{PipelineDefinition, PipelineInputs, StageDefinition};
use crate::core::{Artifact, Invocation};
use crate::store::{derived_path, PathTransform};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Read quality control.
pub const FASTQC_TAG: &str = "fastqc";
/// Reference indexing and read alignment.
pub const BWA_TAG: &str = "bwa";
/// SAM/BAM conversion, sorting and indexing.
pub const SAMTOOLS_TAG: &str = "samtools";
/// Variant calling.
pub const FREEBAYES_TAG: &str = "freebayes";

/// Name of the built-in pipeline.
pub const PIPELINE_NAME: &str = "variant-calling";

/// Stage names.
pub const QUALITY_STAGE: &str = "quality-check";
#[allow(missing_docs)]
pub const ALIGN_STAGE: &str = "align";
#[allow(missing_docs)]
pub const SORT_STAGE: &str = "sort";
#[allow(missing_docs)]
pub const CALL_STAGE: &str = "call-variants";

/// Forward reads (supplied).
pub const READS_R1: &str = "reads_r1";
/// Reverse reads (supplied).
pub const READS_R2: &str = "reads_r2";
/// Reference genome FASTA (supplied).
pub const REFERENCE: &str = "reference";
/// Quality report directory.
pub const QUALITY_REPORT: &str = "quality_report";
/// Raw alignment.
pub const ALIGNED_SAM: &str = "aligned_sam";
/// Binary alignment.
pub const ALIGNED_BAM: &str = "aligned_bam";
/// Coordinate-sorted alignment.
pub const SORTED_BAM: &str = "sorted_bam";
/// Index of the sorted alignment.
pub const SORTED_BAM_INDEX: &str = "sorted_bam_index";
/// Called variants.
pub const VARIANTS_VCF: &str = "variants_vcf";

/// Output locations relative to the output directory.
pub const QUALITY_DIR: &str = "quality";
#[allow(missing_docs)]
pub const ALIGNED_SAM_PATH: &str = "aligned.sam";
#[allow(missing_docs)]
pub const ALIGNED_BAM_PATH: &str = "aligned.bam";
#[allow(missing_docs)]
pub const VARIANTS_VCF_PATH: &str = "variants.vcf";

/// Inputs and settings for one variant-calling run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantCallingConfig {
    /// Forward reads.
    pub reads_r1: PathBuf,
    /// Reverse reads.
    pub reads_r2: PathBuf,
    /// Reference genome.
    pub reference: PathBuf,
    /// Directory that receives every output.
    pub out_dir: PathBuf,
    /// Thread hint passed to the aligner.
    pub threads: usize,
    /// Program substitutions.
    pub tool_overrides: BTreeMap<String, String>,
}

impl VariantCallingConfig {
    /// Creates a configuration with the default thread hint.
    #[must_use]
    pub fn new(
        reads_r1: impl Into<PathBuf>,
        reads_r2: impl Into<PathBuf>,
        reference: impl Into<PathBuf>,
        out_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            reads_r1: reads_r1.into(),
            reads_r2: reads_r2.into(),
            reference: reference.into(),
            out_dir: out_dir.into(),
            threads: super::config::DEFAULT_THREADS,
            tool_overrides: BTreeMap::new(),
        }
    }

    /// Sets the thread hint.
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Substitutes `program` with `replacement` at invocation time.
    #[must_use]
    pub fn with_tool_override(mut self, program: impl Into<String>, replacement: impl Into<String>) -> Self {
        self.tool_overrides.insert(program.into(), replacement.into());
        self
    }

    /// Returns the externally supplied artifacts: both read files and the reference.
    #[must_use]
    pub fn inputs(&self) -> PipelineInputs {
        PipelineInputs::new()
            .file(READS_R1, &self.reads_r1)
            .file(READS_R2, &self.reads_r2)
            .file(REFERENCE, &self.reference)
    }

    /// Returns a runner configuration writing under `out_dir`.
    #[must_use]
    pub fn runner_config(&self) -> RunnerConfig {
        self.tool_overrides.iter().fold(
            RunnerConfig::new(&self.out_dir).with_threads(self.threads),
            |config, (program, replacement)| config.with_tool_override(program, replacement),
        )
    }

    /// Returns the pipeline definition.
    #[must_use]
    pub fn definition(&self) -> PipelineDefinition {
        definition()
    }
}

/// Returns the sorted BAM path derived from the aligned BAM path.
#[must_use]
pub fn sorted_bam_path(aligned_bam: &Path) -> PathBuf {
    derived_path(aligned_bam, &PathTransform::Suffix("_sorted".to_string()))
}

/// Returns the BAM index path for a BAM file.
#[must_use]
pub fn bam_index_path(bam: &Path) -> PathBuf {
    derived_path(bam, &PathTransform::AppendExtension("bai".to_string()))
}

/// Builds the variant-calling pipeline definition.
#[must_use]
pub fn definition() -> PipelineDefinition {
    let sorted_bam = sorted_bam_path(Path::new(ALIGNED_BAM_PATH));
    let sorted_index = bam_index_path(&sorted_bam);

    let quality = StageDefinition::new(QUALITY_STAGE)
        .with_description("Read quality report for both read files")
        .input(READS_R1)
        .input(READS_R2)
        .output(Artifact::directory(QUALITY_REPORT, QUALITY_DIR))
        .invocation(
            Invocation::new(FASTQC_TAG)
                .arg("-o")
                .output(QUALITY_REPORT)
                .input(READS_R1)
                .input(READS_R2),
        );

    let align = StageDefinition::new(ALIGN_STAGE)
        .with_description("Index the reference, align reads, convert to BAM")
        .input(READS_R1)
        .input(READS_R2)
        .input(REFERENCE)
        .output(Artifact::file(ALIGNED_SAM, ALIGNED_SAM_PATH))
        .output(Artifact::file(ALIGNED_BAM, ALIGNED_BAM_PATH))
        .invocation(Invocation::new(BWA_TAG).arg("index").input(REFERENCE))
        .invocation(
            Invocation::new(BWA_TAG)
                .args(["mem", "-t"])
                .param(super::config::THREADS_PARAM)
                .input(REFERENCE)
                .input(READS_R1)
                .input(READS_R2)
                .stdout_to(ALIGNED_SAM),
        )
        .invocation(
            Invocation::new(SAMTOOLS_TAG)
                .args(["view", "-b", "-o"])
                .output(ALIGNED_BAM)
                .output(ALIGNED_SAM),
        );

    let sort = StageDefinition::new(SORT_STAGE)
        .with_description("Coordinate-sort and index the alignment")
        .input(ALIGNED_BAM)
        .output(Artifact::file(SORTED_BAM, sorted_bam))
        .output(Artifact::file(SORTED_BAM_INDEX, sorted_index))
        .invocation(
            Invocation::new(SAMTOOLS_TAG)
                .args(["sort", "-o"])
                .output(SORTED_BAM)
                .input(ALIGNED_BAM),
        )
        .invocation(
            Invocation::new(SAMTOOLS_TAG)
                .args(["index", "-o"])
                .output(SORTED_BAM_INDEX)
                .output(SORTED_BAM),
        );

    let call = StageDefinition::new(CALL_STAGE)
        .with_description("Call variants against the reference")
        .input(REFERENCE)
        .input(SORTED_BAM)
        .input(SORTED_BAM_INDEX)
        .output(Artifact::file(VARIANTS_VCF, VARIANTS_VCF_PATH))
        .invocation(
            Invocation::new(FREEBAYES_TAG)
                .arg("-f")
                .input(REFERENCE)
                .input(SORTED_BAM)
                .stdout_to(VARIANTS_VCF),
        );

    PipelineDefinition::new(PIPELINE_NAME)
        .with_param(super::config::THREADS_PARAM, super::config::DEFAULT_THREADS.to_string())
        .stage(quality)
        .stage(align)
        .stage(sort)
        .stage(call)
}
