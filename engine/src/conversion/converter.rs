//! Converter records
//!
//! A converter is plain data: the formats it supports, how to probe for the
//! tool, the command template to run and two optional hooks. Specialized
//! converters differ only in these values.

use sdk::errors::{EngineError, Result};
use sdk::workflow::{ConverterDecl, ConverterKind};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::ConversionContext;
use crate::config::ConverterConfig;
use crate::executor::{BoundedExecutor, CallerIdentity, CommandSpec};

/// Formats whose look pandoc takes from a reference document
const STYLED_FORMATS: &[&str] = &["docx", "odt", "pptx"];

/// How the tool produces its result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Writes a distinct output file
    SeparateOutput,
    /// Rewrites its input; the pipeline hands it a copy at the output path
    InPlace,
}

/// Command pattern with `{input}`, `{output}` and `{format}` placeholders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
    /// Appended only when a reference document is set; may use `{reference_doc}`
    pub reference_args: Vec<String>,
}

impl CommandTemplate {
    pub fn render(
        &self,
        input: &Path,
        output: &Path,
        format: &str,
        reference_doc: Option<&Path>,
    ) -> Result<CommandSpec> {
        if self.program.trim().is_empty() {
            return Err(EngineError::ExternalTool(
                "converter command has no program".to_string(),
            ));
        }
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        let reference = reference_doc.map(|p| p.to_string_lossy().into_owned());

        let fill = |arg: &str| {
            let mut arg = arg
                .replace("{input}", &input)
                .replace("{output}", &output)
                .replace("{format}", format);
            if let Some(reference) = &reference {
                arg = arg.replace("{reference_doc}", reference);
            }
            arg
        };

        let mut spec = CommandSpec::new(&self.program).args(self.args.iter().map(|a| fill(a)));
        if reference.is_some() {
            spec = spec.args(self.reference_args.iter().map(|a| fill(a)));
        }
        Ok(spec)
    }
}

/// Adjusts the context before the tool runs
pub type PrepareHook = fn(&mut ConversionContext);

/// Edits the list of intermediates about to be deleted
pub type CleanupHook = fn(&ConversionContext, &mut Vec<PathBuf>);

#[derive(Debug, Clone)]
pub struct Converter {
    pub name: String,
    pub formats: Vec<String>,
    /// Arguments of the availability probe, e.g. `--version`
    pub probe_args: Vec<String>,
    pub template: CommandTemplate,
    pub mode: ExecutionMode,
    /// Copy an existing output to `<output>.bak` before overwriting it
    pub backup: bool,
    pub timeout: Duration,
    pub prepare: Option<PrepareHook>,
    pub before_cleanup: Option<CleanupHook>,
}

impl Converter {
    /// Plain pandoc conversion
    pub fn pandoc(program: &str, timeout: Duration) -> Self {
        Self {
            name: "pandoc".to_string(),
            formats: vec!["docx".to_string(), "html".to_string(), "pdf".to_string()],
            probe_args: vec!["--version".to_string()],
            template: CommandTemplate {
                program: program.to_string(),
                args: vec![
                    "{input}".to_string(),
                    "--standalone".to_string(),
                    "-o".to_string(),
                    "{output}".to_string(),
                ],
                reference_args: vec!["--reference-doc={reference_doc}".to_string()],
            },
            mode: ExecutionMode::SeparateOutput,
            backup: true,
            timeout,
            prepare: Some(style_office_formats),
            before_cleanup: None,
        }
    }

    /// Pandoc producing slide decks
    ///
    /// The style reference is applied only to `pptx` and intermediates are
    /// kept next to the output for inspection.
    pub fn presentation(program: &str, timeout: Duration) -> Self {
        Self {
            name: "presentation".to_string(),
            formats: vec!["pptx".to_string(), "html".to_string(), "pdf".to_string()],
            prepare: Some(style_slide_decks),
            before_cleanup: Some(retain_intermediates),
            ..Self::pandoc(program, timeout)
        }
    }

    /// Converter selected by a workflow's declaration
    pub fn for_workflow(decl: &ConverterDecl, config: &ConverterConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs);
        let mut converter = match decl.kind {
            ConverterKind::Pandoc => Self::pandoc(&config.pandoc_path, timeout),
            ConverterKind::Presentation => Self::presentation(&config.pandoc_path, timeout),
        };
        converter.formats = decl.formats.clone();
        converter
    }

    pub fn supports(&self, format: &str) -> bool {
        self.formats.iter().any(|f| f == format)
    }

    /// Probe for the tool; a nonzero exit means it is unavailable
    pub async fn detect(&self, executor: &BoundedExecutor, caller: &CallerIdentity) -> Result<()> {
        let spec = CommandSpec::new(&self.template.program).args(self.probe_args.clone());
        let output = executor
            .run_command(caller, &spec, Some(self.timeout))
            .await
            .map_err(|e| match e {
                EngineError::ExternalTool(detail) => EngineError::ExternalTool(format!(
                    "{} is not available: {}",
                    self.template.program, detail
                )),
                other => other,
            })?;
        if !output.success() {
            return Err(EngineError::ExternalTool(format!(
                "{} is not available (probe exited with {:?})",
                self.template.program, output.code
            )));
        }
        debug!("Detected {}: {}", self.name, output.stdout_text().lines().next().unwrap_or(""));
        Ok(())
    }
}

fn style_office_formats(ctx: &mut ConversionContext) {
    if ctx.reference_doc.is_none() && STYLED_FORMATS.contains(&ctx.format.as_str()) {
        ctx.reference_doc = ctx.style_reference.clone();
    }
}

fn style_slide_decks(ctx: &mut ConversionContext) {
    if ctx.format == "pptx" {
        ctx.reference_doc = ctx.style_reference.clone();
    } else {
        ctx.reference_doc = None;
    }
}

fn retain_intermediates(_ctx: &ConversionContext, doomed: &mut Vec<PathBuf>) {
    doomed.clear();
}
