//! Pre-conversion processors
//!
//! A processor turns one intermediate document into the next and reports any
//! side files it created. Processors are looked up by name in a
//! [`ProcessorRegistry`].

use async_trait::async_trait;
use regex::{Captures, Regex};
use sdk::errors::{EngineError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info};

use crate::executor::{BoundedExecutor, CallerIdentity, CommandSpec};
use crate::storage::StorageAdapter;

/// What a processor may use while running
pub struct ProcessStep<'a> {
    /// Directory for side files; links are written relative to it
    pub work_dir: &'a Path,
    /// Base name for side files
    pub stem: &'a str,
    pub storage: &'a dyn StorageAdapter,
    pub executor: &'a BoundedExecutor,
    pub caller: &'a CallerIdentity,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub text: String,
    /// Side files created by this step
    pub artifacts: Vec<PathBuf>,
}

#[async_trait]
pub trait Processor: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    async fn process(&self, input: &str, step: &ProcessStep<'_>) -> Result<ProcessOutput>;
}

/// Renders fenced `mermaid` blocks to PNG images with `mmdc`
#[derive(Debug, Clone)]
pub struct MermaidProcessor {
    program: String,
    timeout: Duration,
}

static MERMAID_BLOCK: OnceLock<Regex> = OnceLock::new();

fn mermaid_block() -> &'static Regex {
    MERMAID_BLOCK.get_or_init(|| {
        Regex::new(r"(?ms)^```mermaid[ \t]*\r?\n(.*?)^```[ \t]*$").expect("Invalid mermaid pattern")
    })
}

impl MermaidProcessor {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Processor for MermaidProcessor {
    fn name(&self) -> &str {
        "mermaid"
    }

    async fn process(&self, input: &str, step: &ProcessStep<'_>) -> Result<ProcessOutput> {
        let mut text = String::with_capacity(input.len());
        let mut artifacts = Vec::new();
        let mut last = 0;

        for (index, caps) in mermaid_block().captures_iter(input).enumerate() {
            let (Some(block), Some(source)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let base = format!("{}-diagram-{}", step.stem, index + 1);
            let mmd = step.work_dir.join(format!("{}.mmd", base));
            let png = step.work_dir.join(format!("{}.png", base));

            step.storage.write(&mmd, source.as_str().as_bytes()).await?;
            artifacts.push(mmd.clone());

            let spec = CommandSpec::new(&self.program)
                .current_dir(step.work_dir)
                .arg("-i")
                .arg(mmd.to_string_lossy())
                .arg("-o")
                .arg(png.to_string_lossy());
            step.executor
                .run_checked(step.caller, &spec, Some(self.timeout))
                .await?;
            artifacts.push(png);

            text.push_str(&input[last..block.start()]);
            text.push_str(&format!("![Diagram {}]({}.png)", index + 1, base));
            last = block.end();
        }
        text.push_str(&input[last..]);

        if !artifacts.is_empty() {
            info!("Rendered {} mermaid diagram(s)", artifacts.len() / 2);
        }
        Ok(ProcessOutput { text, artifacts })
    }
}

/// Replaces `:shortcode:` emoji with their characters
#[derive(Debug, Clone)]
pub struct EmojiProcessor {
    table: BTreeMap<&'static str, &'static str>,
}

static SHORTCODE: OnceLock<Regex> = OnceLock::new();

fn shortcode() -> &'static Regex {
    SHORTCODE.get_or_init(|| Regex::new(r":([a-z0-9_+\-]+):").expect("Invalid shortcode pattern"))
}

impl Default for EmojiProcessor {
    fn default() -> Self {
        let table = [
            ("smile", "😄"),
            ("grin", "😁"),
            ("wink", "😉"),
            ("heart", "❤️"),
            ("thumbsup", "👍"),
            ("+1", "👍"),
            ("thumbsdown", "👎"),
            ("-1", "👎"),
            ("rocket", "🚀"),
            ("tada", "🎉"),
            ("star", "⭐"),
            ("fire", "🔥"),
            ("warning", "⚠️"),
            ("check", "✔️"),
            ("white_check_mark", "✅"),
            ("x", "❌"),
            ("bulb", "💡"),
            ("memo", "📝"),
            ("chart_with_upwards_trend", "📈"),
            ("calendar", "📅"),
            ("email", "📧"),
            ("phone", "📞"),
            ("briefcase", "💼"),
            ("point_right", "👉"),
        ]
        .into_iter()
        .collect();
        Self { table }
    }
}

#[async_trait]
impl Processor for EmojiProcessor {
    fn name(&self) -> &str {
        "emoji"
    }

    async fn process(&self, input: &str, _step: &ProcessStep<'_>) -> Result<ProcessOutput> {
        let text = shortcode()
            .replace_all(input, |caps: &Captures| match self.table.get(&caps[1]) {
                Some(emoji) => (*emoji).to_string(),
                None => caps[0].to_string(),
            })
            .into_owned();
        Ok(ProcessOutput {
            text,
            artifacts: Vec::new(),
        })
    }
}

/// Named processors available to the pipeline
#[derive(Debug, Clone, Default)]
pub struct ProcessorRegistry {
    processors: BTreeMap<String, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `mermaid` and `emoji`
    pub fn with_builtins(mermaid_program: &str, timeout: Duration) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(MermaidProcessor::new(mermaid_program, timeout)));
        registry.register(Arc::new(EmojiProcessor::default()));
        registry
    }

    pub fn register(&mut self, processor: Arc<dyn Processor>) {
        debug!("Registering processor '{}'", processor.name());
        self.processors
            .insert(processor.name().to_string(), processor);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Processor>> {
        self.processors.get(name).cloned().ok_or_else(|| {
            EngineError::Validation(format!(
                "unknown processor '{}' (available: {})",
                name,
                self.names().join(", ")
            ))
        })
    }

    /// Look up every name, failing on the first unknown one
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn Processor>>> {
        names.iter().map(|n| self.get(n)).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.processors.keys().map(String::as_str).collect()
    }
}
