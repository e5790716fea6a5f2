//! External command descriptors and their argument templates.
//!
//! An argument template is literal text with embedded placeholders:
//!
//! - `{in:<artifact>}` resolves to the path of a stage input,
//! - `{out:<artifact>}` resolves to the path a stage output is written to,
//! - `{param:<name>}` resolves to a run parameter such as `threads`.
//!
//! Anything else, including unrelated braces, is kept verbatim.

use crate::errors::{ContractErrorInfo, PipelineValidationError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

#[allow(clippy::expect_used)]
fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{(in|out|param):([A-Za-z0-9_.\-]+)\}").expect("placeholder pattern is valid")
    })
}

/// One segment of an argument template.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArgPart {
    /// Verbatim text.
    Literal(String),
    /// Path of a stage input artifact.
    Input(String),
    /// Path of a stage output artifact.
    Output(String),
    /// A run parameter.
    Param(String),
}

/// A single command-line argument, possibly built from placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArgTemplate {
    parts: Vec<ArgPart>,
}

impl ArgTemplate {
    /// Creates a literal argument.
    #[must_use]
    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            parts: vec![ArgPart::Literal(text.into())],
        }
    }

    /// Creates an argument that resolves to an input artifact path.
    #[must_use]
    pub fn input(artifact: impl Into<String>) -> Self {
        Self {
            parts: vec![ArgPart::Input(artifact.into())],
        }
    }

    /// Creates an argument that resolves to an output artifact path.
    #[must_use]
    pub fn output(artifact: impl Into<String>) -> Self {
        Self {
            parts: vec![ArgPart::Output(artifact.into())],
        }
    }

    /// Creates an argument that resolves to a run parameter.
    #[must_use]
    pub fn param(name: impl Into<String>) -> Self {
        Self {
            parts: vec![ArgPart::Param(name.into())],
        }
    }

    /// Parses template text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text contains a placeholder prefix that is
    /// not a well-formed placeholder (for example `{in:}`).
    pub fn parse(text: &str) -> Result<Self, PipelineValidationError> {
        let mut parts = Vec::new();
        let mut cursor = 0;

        for caps in placeholder_regex().captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            if whole.start() > cursor {
                parts.push(ArgPart::Literal(text[cursor..whole.start()].to_string()));
            }
            let name = caps[2].to_string();
            parts.push(match &caps[1] {
                "in" => ArgPart::Input(name),
                "out" => ArgPart::Output(name),
                _ => ArgPart::Param(name),
            });
            cursor = whole.end();
        }
        if cursor < text.len() || parts.is_empty() {
            parts.push(ArgPart::Literal(text[cursor..].to_string()));
        }

        for part in &parts {
            if let ArgPart::Literal(literal) = part {
                if ["{in:", "{out:", "{param:"].iter().any(|p| literal.contains(p)) {
                    return Err(PipelineValidationError::new(format!(
                        "Malformed placeholder in argument '{text}'"
                    ))
                    .with_error_info(
                        ContractErrorInfo::new("PIPELINE-BAD-TEMPLATE", "Malformed placeholder")
                            .with_fix_hint("Placeholders look like {in:id}, {out:id} or {param:name}."),
                    ));
                }
            }
        }

        Ok(Self { parts })
    }

    /// Returns the template segments.
    #[must_use]
    pub fn parts(&self) -> &[ArgPart] {
        &self.parts
    }

    /// Returns the input artifact ids referenced by this argument.
    pub fn inputs(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|part| match part {
            ArgPart::Input(id) => Some(id.as_str()),
            _ => None,
        })
    }

    /// Returns the output artifact ids referenced by this argument.
    pub fn outputs(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|part| match part {
            ArgPart::Output(id) => Some(id.as_str()),
            _ => None,
        })
    }

    /// Returns the parameter names referenced by this argument.
    pub fn params(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|part| match part {
            ArgPart::Param(name) => Some(name.as_str()),
            _ => None,
        })
    }

    /// Renders the argument, asking `resolve` for each placeholder.
    ///
    /// Returns the first placeholder `resolve` could not satisfy as the error.
    pub fn render<F>(&self, mut resolve: F) -> Result<String, ArgPart>
    where
        F: FnMut(&ArgPart) -> Option<String>,
    {
        let mut rendered = String::new();
        for part in &self.parts {
            match part {
                ArgPart::Literal(text) => rendered.push_str(text),
                other => rendered.push_str(&resolve(other).ok_or_else(|| other.clone())?),
            }
        }
        Ok(rendered)
    }
}

impl fmt::Display for ArgTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for part in &self.parts {
            match part {
                ArgPart::Literal(text) => write!(f, "{text}")?,
                ArgPart::Input(id) => write!(f, "{{in:{id}}}")?,
                ArgPart::Output(id) => write!(f, "{{out:{id}}}")?,
                ArgPart::Param(name) => write!(f, "{{param:{name}}}")?,
            }
        }
        Ok(())
    }
}

impl TryFrom<String> for ArgTemplate {
    type Error = PipelineValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ArgTemplate> for String {
    fn from(value: ArgTemplate) -> Self {
        value.to_string()
    }
}

/// One external-process execution within a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    /// Program name or path. Names are looked up on `PATH` unless the
    /// runner configuration overrides them.
    pub program: String,

    /// Argument templates, in order.
    #[serde(default)]
    pub args: Vec<ArgTemplate>,

    /// Output artifact that receives the program's standard output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,

    /// Time limit overriding the runner default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

impl Invocation {
    /// Creates an invocation of `program` with no arguments.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdout: None,
            timeout_secs: None,
        }
    }

    /// Appends a literal argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(ArgTemplate::literal(arg));
        self
    }

    /// Appends several literal arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(ArgTemplate::literal));
        self
    }

    /// Appends an argument resolving to an input artifact path.
    #[must_use]
    pub fn input(mut self, artifact: impl Into<String>) -> Self {
        self.args.push(ArgTemplate::input(artifact));
        self
    }

    /// Appends an argument resolving to an output artifact path.
    #[must_use]
    pub fn output(mut self, artifact: impl Into<String>) -> Self {
        self.args.push(ArgTemplate::output(artifact));
        self
    }

    /// Appends an argument resolving to a run parameter.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.args.push(ArgTemplate::param(name));
        self
    }

    /// Appends a pre-built template.
    #[must_use]
    pub fn template(mut self, template: ArgTemplate) -> Self {
        self.args.push(template);
        self
    }

    /// Redirects standard output into an output artifact.
    #[must_use]
    pub fn stdout_to(mut self, artifact: impl Into<String>) -> Self {
        self.stdout = Some(artifact.into());
        self
    }

    /// Sets a time limit for this invocation.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    /// Returns the time limit for this invocation, if set.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Returns every output artifact id this invocation writes, including
    /// the stdout target.
    pub fn referenced_outputs(&self) -> impl Iterator<Item = &str> {
        self.args
            .iter()
            .flat_map(|arg| arg.outputs())
            .chain(self.stdout.as_deref())
    }

    /// Returns every input artifact id this invocation reads.
    pub fn referenced_inputs(&self) -> impl Iterator<Item = &str> {
        self.args.iter().flat_map(|arg| arg.inputs())
    }

    /// Returns every parameter name this invocation uses.
    pub fn referenced_params(&self) -> impl Iterator<Item = &str> {
        self.args.iter().flat_map(|arg| arg.params())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_mixed_template() {
        let template = ArgTemplate::parse("--fasta={in:reference}").unwrap();
        assert_eq!(
            template.parts(),
            &[
                ArgPart::Literal("--fasta=".to_string()),
                ArgPart::Input("reference".to_string()),
            ]
        );
        assert_eq!(template.to_string(), "--fasta={in:reference}");
    }

    #[test]
    fn test_parse_plain_literal_keeps_braces() {
        let template = ArgTemplate::parse("{not_a_placeholder}").unwrap();
        assert_eq!(
            template.parts(),
            &[ArgPart::Literal("{not_a_placeholder}".to_string())]
        );
    }

    #[test]
    fn test_parse_empty_argument() {
        let template = ArgTemplate::parse("").unwrap();
        assert_eq!(template.parts(), &[ArgPart::Literal(String::new())]);
    }

    #[test]
    fn test_parse_rejects_malformed_placeholder() {
        let err = ArgTemplate::parse("{in:}").unwrap_err();
        assert_eq!(err.code(), Some("PIPELINE-BAD-TEMPLATE"));
    }

    #[test]
    fn test_render_resolves_placeholders() {
        let template = ArgTemplate::parse("{out:prefix}.{param:threads}").unwrap();
        let rendered = template
            .render(|part| match part {
                ArgPart::Output(_) => Some("/tmp/out".to_string()),
                ArgPart::Param(_) => Some("8".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(rendered, "/tmp/out.8");
    }

    #[test]
    fn test_render_reports_unresolved_placeholder() {
        let template = ArgTemplate::param("threads");
        let missing = template.render(|_| None).unwrap_err();
        assert_eq!(missing, ArgPart::Param("threads".to_string()));
    }

    #[test]
    fn test_invocation_references() {
        let invocation = Invocation::new("bwa")
            .arg("mem")
            .arg("-t")
            .param("threads")
            .input("reference")
            .input("reads_r1")
            .stdout_to("aligned_sam");

        assert_eq!(invocation.referenced_outputs().collect::<Vec<_>>(), vec!["aligned_sam"]);
        assert_eq!(
            invocation.referenced_inputs().collect::<Vec<_>>(),
            vec!["reference", "reads_r1"]
        );
        assert_eq!(invocation.referenced_params().collect::<Vec<_>>(), vec!["threads"]);
    }

    #[test]
    fn test_invocation_deserializes_templates() {
        let invocation: Invocation = serde_json::from_str(
            r#"{"program": "samtools", "args": ["sort", "-o", "{out:sorted_bam}", "{in:aligned_bam}"]}"#,
        )
        .unwrap();

        assert_eq!(invocation.args.len(), 4);
        assert_eq!(invocation.referenced_outputs().collect::<Vec<_>>(), vec!["sorted_bam"]);
        assert!(invocation.stdout.is_none());
    }
}
