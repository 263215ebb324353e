//! Conversion pipeline
//!
//! Turns a collection's main document into output formats:
//!
//! 1. resolve the enabled processors (caller choice, else the workflow's
//!    configured or declared defaults)
//! 2. run them in order, writing one intermediate file per step
//! 3. run the converter's command on the last intermediate through the
//!    bounded executor; nonzero exit or timeout fails the attempt
//! 4. collect outputs and artifacts
//! 5. delete the pipeline's own intermediates unless the converter's cleanup
//!    hook retains them
//!
//! A failed attempt deletes nothing, so partial outputs and intermediates
//! stay available for debugging.

use sdk::errors::{EngineError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ResolvedConfig;
use crate::executor::{BoundedExecutor, CallerIdentity};
use crate::storage::{FsStorage, StorageAdapter};
use crate::workflow::WorkflowEngine;

pub mod converter;
pub mod processors;

pub use converter::{CommandTemplate, Converter, ExecutionMode};
pub use processors::{ProcessStep, ProcessOutput, Processor, ProcessorRegistry};

/// Directory inside a collection that receives formatted outputs
pub const FORMATTED_DIR: &str = "formatted";

/// Inputs of one conversion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionContext {
    pub workflow: String,
    pub input: PathBuf,
    pub output: PathBuf,
    pub format: String,
    /// Enabled processors, in order
    pub processors: Vec<String>,
    /// Reference document handed to the tool
    pub reference_doc: Option<PathBuf>,
    /// Reference document available to prepare hooks
    pub style_reference: Option<PathBuf>,
    /// Where intermediates and side files are written
    pub work_dir: PathBuf,
}

/// Outcome of a successful conversion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversionResult {
    pub outputs: Vec<PathBuf>,
    /// Side files created by processors
    pub artifacts: Vec<PathBuf>,
    /// Intermediates left on disk by the cleanup policy
    pub retained: Vec<PathBuf>,
    /// Copy of the previous output, if one was overwritten
    pub backup: Option<PathBuf>,
}

/// What the caller asked `format` for
#[derive(Debug, Clone, Default)]
pub struct FormatRequest {
    /// Empty means the configured default formats
    pub formats: Vec<String>,
    /// `Some` overrides the workflow's default processors
    pub processors: Option<Vec<String>>,
}

/// Per-format outcome of formatting one collection
#[derive(Debug)]
pub struct FormatOutcome {
    pub format: String,
    pub result: Result<ConversionResult>,
}

#[derive(Debug)]
pub struct FormatReport {
    pub collection_id: String,
    pub outcomes: Vec<FormatOutcome>,
}

impl FormatReport {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }
}

#[derive(Debug, Clone)]
pub struct ConversionPipeline {
    storage: Arc<dyn StorageAdapter>,
    executor: BoundedExecutor,
    caller: CallerIdentity,
    registry: ProcessorRegistry,
}

impl ConversionPipeline {
    pub fn new(
        storage: Arc<dyn StorageAdapter>,
        executor: BoundedExecutor,
        caller: CallerIdentity,
        registry: ProcessorRegistry,
    ) -> Self {
        Self {
            storage,
            executor,
            caller,
            registry,
        }
    }

    /// Pipeline over real storage with the builtin processors
    pub fn from_config(
        config: &ResolvedConfig,
        executor: BoundedExecutor,
        caller: CallerIdentity,
    ) -> Self {
        let converter = &config.system.converter;
        let registry = ProcessorRegistry::with_builtins(
            &converter.mermaid_path,
            std::time::Duration::from_secs(converter.timeout_secs),
        );
        Self::new(Arc::new(FsStorage::new()), executor, caller, registry)
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    /// Probe the tool, then convert
    pub async fn convert(
        &self,
        converter: &Converter,
        ctx: ConversionContext,
    ) -> Result<ConversionResult> {
        converter.detect(&self.executor, &self.caller).await?;
        self.run(converter, ctx).await
    }

    /// Convert without probing for the tool first
    pub async fn run(
        &self,
        converter: &Converter,
        mut ctx: ConversionContext,
    ) -> Result<ConversionResult> {
        if !converter.supports(&ctx.format) {
            return Err(EngineError::Validation(format!(
                "{} cannot produce '{}' (supported: {})",
                converter.name,
                ctx.format,
                converter.formats.join(", ")
            )));
        }
        let processors = self.registry.resolve(&ctx.processors)?;
        if let Some(prepare) = converter.prepare {
            prepare(&mut ctx);
        }

        let stem = ctx
            .input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("document")
            .to_string();
        self.storage.mkdir(&ctx.work_dir, true).await?;

        // Processors
        let mut current = ctx.input.clone();
        let mut intermediates = Vec::new();
        let mut result = ConversionResult::default();
        if !processors.is_empty() {
            let mut text = self.storage.read_to_string(&ctx.input).await?;
            let step = ProcessStep {
                work_dir: &ctx.work_dir,
                stem: &stem,
                storage: self.storage.as_ref(),
                executor: &self.executor,
                caller: &self.caller,
            };
            for (index, processor) in processors.iter().enumerate() {
                debug!("Running processor '{}' on {}", processor.name(), stem);
                let output = processor.process(&text, &step).await?;
                result.artifacts.extend(output.artifacts);
                text = output.text;

                let path = ctx
                    .work_dir
                    .join(format!(".{}.{}.{}.md", stem, index, processor.name()));
                self.storage.write(&path, text.as_bytes()).await?;
                intermediates.push(path.clone());
                current = path;
            }
        }

        // Backup
        if converter.backup && self.storage.exists(&ctx.output).await {
            let backup = PathBuf::from(format!("{}.bak", ctx.output.display()));
            self.storage.copy(&ctx.output, &backup).await?;
            debug!("Backed up {} to {}", ctx.output.display(), backup.display());
            result.backup = Some(backup);
        }

        // External tool; in-place tools work on a staged copy so a failed
        // run leaves the previous output alone
        let staged = ctx
            .work_dir
            .join(format!(".{}.inplace.{}", stem, ctx.format));
        let spec = match converter.mode {
            ExecutionMode::SeparateOutput => converter.template.render(
                &current,
                &ctx.output,
                &ctx.format,
                ctx.reference_doc.as_deref(),
            )?,
            ExecutionMode::InPlace => {
                self.storage.copy(&current, &staged).await?;
                converter.template.render(
                    &staged,
                    &staged,
                    &ctx.format,
                    ctx.reference_doc.as_deref(),
                )?
            }
        };
        let spec = spec.current_dir(&ctx.work_dir);
        let ran = self
            .executor
            .run_checked(&self.caller, &spec, Some(converter.timeout))
            .await;

        if converter.mode == ExecutionMode::InPlace {
            if ran.is_ok() {
                self.storage.copy(&staged, &ctx.output).await?;
            }
            if let Err(e) = self.storage.remove(&staged).await {
                warn!("Failed to remove staged {}: {}", staged.display(), e);
            }
        }
        ran?;

        if !self.storage.exists(&ctx.output).await {
            return Err(EngineError::ExternalTool(format!(
                "{} reported success but wrote no {} output",
                converter.name, ctx.format
            )));
        }
        result.outputs.push(ctx.output.clone());

        // Cleanup
        let mut doomed = intermediates.clone();
        if let Some(hook) = converter.before_cleanup {
            hook(&ctx, &mut doomed);
        }
        doomed.retain(|p| intermediates.contains(p));
        for path in &doomed {
            if let Err(e) = self.storage.remove(path).await {
                warn!("Failed to remove intermediate {}: {}", path.display(), e);
            }
        }
        result.retained = intermediates
            .into_iter()
            .filter(|p| !doomed.contains(p))
            .collect();

        info!(
            "Converted {} to {} with {}",
            stem, ctx.format, converter.name
        );
        Ok(result)
    }

    /// Convert a collection's main document into each requested format
    ///
    /// Per-format failures are reported in the outcome; the call itself
    /// fails only when nothing can be attempted.
    pub async fn format_collection(
        &self,
        engine: &WorkflowEngine,
        workflow: &str,
        id: &str,
        request: &FormatRequest,
    ) -> Result<FormatReport> {
        let def = engine.workflow(workflow).await?;
        let collection = engine.get_collection(workflow, id).await?;
        let config = engine.config();
        let overrides = config.workflow(&def.name);
        let converter = Converter::for_workflow(&def.converter, &config.system.converter);

        let template = def.main_template().ok_or_else(|| {
            EngineError::Validation(format!("workflow '{}' has no templates to format", def.name))
        })?;
        let document = engine
            .template_vars(&def, &collection.metadata)
            .render(&template.output);

        let env = engine.environment();
        let input = env
            .resolve_path(&collection.path.join(&document))
            .ok_or_else(|| {
                EngineError::Validation(format!(
                    "collection '{}' is not stored on disk and cannot be converted",
                    id
                ))
            })?;
        let work_dir = env
            .resolve_path(&collection.path.join(FORMATTED_DIR))
            .ok_or_else(|| {
                EngineError::Validation(format!("collection '{}' has no on-disk location", id))
            })?;

        let formats = if request.formats.is_empty() {
            let defaults: Vec<String> = config
                .system
                .output_formats
                .iter()
                .filter(|f| converter.supports(f))
                .cloned()
                .collect();
            if defaults.is_empty() {
                return Err(EngineError::Validation(format!(
                    "none of the default formats ({}) are supported by {}",
                    config.system.output_formats.join(", "),
                    converter.name
                )));
            }
            defaults
        } else {
            request.formats.clone()
        };

        let processors = request
            .processors
            .clone()
            .or(overrides.processors.clone())
            .unwrap_or_else(|| def.processors.clone());
        self.registry.resolve(&processors)?;

        let style_reference = match overrides
            .reference_doc
            .as_deref()
            .or(def.converter.reference_doc.as_deref())
        {
            Some(rel) => {
                let located = env.locate_workflow_file(&def.name, Path::new(rel)).await?;
                if located.is_none() {
                    warn!("Reference document '{}' not found for '{}'", rel, def.name);
                }
                located
            }
            None => None,
        };

        converter.detect(&self.executor, &self.caller).await?;

        let stem = Path::new(&document)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("document")
            .to_string();
        let mut outcomes = Vec::new();
        for format in formats {
            let ctx = ConversionContext {
                workflow: def.name.clone(),
                input: input.clone(),
                output: work_dir.join(format!("{}.{}", stem, format)),
                format: format.clone(),
                processors: processors.clone(),
                reference_doc: None,
                style_reference: style_reference.clone(),
                work_dir: work_dir.clone(),
            };
            let result = self.run(&converter, ctx).await;
            if let Err(e) = &result {
                warn!("Formatting {} as {} failed: {}", id, format, e);
            }
            outcomes.push(FormatOutcome { format, result });
        }

        Ok(FormatReport {
            collection_id: collection.metadata.collection_id,
            outcomes,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Executable stand-in for the conversion tool
    fn fake_tool(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn pipeline() -> ConversionPipeline {
        ConversionPipeline::new(
            Arc::new(FsStorage::new()),
            BoundedExecutor::default(),
            CallerIdentity::current("test"),
            ProcessorRegistry::with_builtins("mmdc", Duration::from_secs(5)),
        )
    }

    fn context(temp: &TempDir, format: &str, processors: &[&str]) -> ConversionContext {
        let input = temp.path().join("deck.md");
        std::fs::write(&input, "# Launch :rocket:\n").unwrap();
        let work_dir = temp.path().join("formatted");
        ConversionContext {
            workflow: "presentation".to_string(),
            output: work_dir.join(format!("deck.{}", format)),
            input,
            format: format.to_string(),
            processors: processors.iter().map(|s| s.to_string()).collect(),
            reference_doc: None,
            style_reference: None,
            work_dir,
        }
    }

    // "$1" is the input and "$4" the output in the pandoc template
    const COPY: &str = "[ \"$1\" = \"--version\" ] && exit 0\ncp \"$1\" \"$4\"";

    #[tokio::test]
    async fn test_processors_run_and_intermediates_cleaned() {
        let temp = TempDir::new().unwrap();
        let tool = fake_tool(temp.path(), "fake-pandoc", COPY);
        let converter = Converter::pandoc(&tool, Duration::from_secs(10));

        let result = pipeline()
            .convert(&converter, context(&temp, "html", &["emoji"]))
            .await
            .unwrap();

        let output = &result.outputs[0];
        assert_eq!(std::fs::read_to_string(output).unwrap(), "# Launch 🚀\n");
        assert!(result.retained.is_empty());
        assert!(!temp.path().join("formatted/.deck.0.emoji.md").exists());
        // The source document is never touched
        assert_eq!(
            std::fs::read_to_string(temp.path().join("deck.md")).unwrap(),
            "# Launch :rocket:\n"
        );
    }

    #[tokio::test]
    async fn test_presentation_retains_intermediates_and_backs_up() {
        let temp = TempDir::new().unwrap();
        let tool = fake_tool(temp.path(), "fake-pandoc", COPY);
        let converter = Converter::presentation(&tool, Duration::from_secs(10));
        let pipeline = pipeline();

        pipeline
            .run(&converter, context(&temp, "html", &["emoji"]))
            .await
            .unwrap();
        let second = pipeline
            .run(&converter, context(&temp, "html", &["emoji"]))
            .await
            .unwrap();

        assert_eq!(second.retained.len(), 1);
        assert!(second.retained[0].exists());
        let backup = second.backup.unwrap();
        assert!(backup.to_string_lossy().ends_with("deck.html.bak"));
        assert!(backup.exists());
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_and_keeps_intermediates() {
        let temp = TempDir::new().unwrap();
        let tool = fake_tool(temp.path(), "broken-pandoc", "echo boom >&2\nexit 3");
        let converter = Converter::pandoc(&tool, Duration::from_secs(10));

        let result = pipeline()
            .run(&converter, context(&temp, "html", &["emoji"]))
            .await;
        assert!(matches!(result, Err(EngineError::ExternalTool(_))));
        assert!(temp.path().join("formatted/.deck.0.emoji.md").exists());
    }

    #[tokio::test]
    async fn test_timeout_kills_tool() {
        let temp = TempDir::new().unwrap();
        let tool = fake_tool(temp.path(), "slow-pandoc", "exec sleep 30");
        let converter = Converter::pandoc(&tool, Duration::from_millis(300));

        let started = std::time::Instant::now();
        let result = pipeline().run(&converter, context(&temp, "html", &[])).await;
        assert!(matches!(result, Err(EngineError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_in_place_mode() {
        let temp = TempDir::new().unwrap();
        // Appends a footer to the file it is given
        let tool = fake_tool(temp.path(), "stamp", "echo '-- stamped' >> \"$1\"");
        let mut converter = Converter::pandoc(&tool, Duration::from_secs(10));
        converter.mode = ExecutionMode::InPlace;
        converter.template.args = vec!["{input}".to_string()];
        converter.formats = vec!["md".to_string()];

        let result = pipeline()
            .run(&converter, context(&temp, "md", &[]))
            .await
            .unwrap();
        let text = std::fs::read_to_string(&result.outputs[0]).unwrap();
        assert_eq!(text, "# Launch :rocket:\n-- stamped\n");
    }

    #[tokio::test]
    async fn test_failed_in_place_run_keeps_previous_output() {
        let temp = TempDir::new().unwrap();
        let tool = fake_tool(temp.path(), "broken-stamp", "echo '-- partial' >> \"$1\"\nexit 1");
        let mut converter = Converter::pandoc(&tool, Duration::from_secs(10));
        converter.mode = ExecutionMode::InPlace;
        converter.backup = false;
        converter.template.args = vec!["{input}".to_string()];
        converter.formats = vec!["md".to_string()];

        let ctx = context(&temp, "md", &[]);
        std::fs::create_dir_all(&ctx.work_dir).unwrap();
        std::fs::write(&ctx.output, "previous\n").unwrap();
        let output = ctx.output.clone();

        let result = pipeline().run(&converter, ctx).await;
        assert!(matches!(result, Err(EngineError::ExternalTool(_))));
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "previous\n");
        assert!(!temp.path().join("formatted/.deck.inplace.md").exists());
    }

    #[tokio::test]
    async fn test_unsupported_format_and_unknown_processor() {
        let temp = TempDir::new().unwrap();
        let converter = Converter::pandoc("pandoc", Duration::from_secs(10));
        assert!(matches!(
            pipeline().run(&converter, context(&temp, "epub", &[])).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            pipeline()
                .run(&converter, context(&temp, "html", &["spellcheck"]))
                .await,
            Err(EngineError::Validation(_))
        ));
    }
}
