//! Project bootstrap and initialization
//!
//! [`Workspace::open`] performs the full startup sequence: locate the system
//! installation and the enclosing project, build the merged environment,
//! then resolve the configuration from both layers plus runtime overrides.
//! [`init_project`] creates the local layer of a new project.

use sdk::errors::{EngineError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::discovery::{find_project_root, find_system_root, SystemSearch};
use crate::config::{ConfigOverrides, ResolvedConfig};
use crate::conversion::ConversionPipeline;
use crate::environment::{
    Environment, EnvironmentLayout, FilesystemEnvironment, MergedEnvironment, PROJECT_MARKER,
};
use crate::executor::{BoundedExecutor, CallerIdentity, ExecutionLimits};
use crate::git::GitCommitter;
use crate::storage::{FsStorage, StorageAdapter};
use crate::workflow::WorkflowEngine;
use sdk::manifest::WorkflowOrigin;

/// Project config template shipped with the installation
pub const PROJECT_CONFIG_TEMPLATE: &str = "templates/project-config.toml";

const DEFAULT_PROJECT_CONFIG: &str = r#"# docflow project configuration
#
# Values here override the installation's config.toml.
# Every key is optional.

[user]
# name = ""
# preferred_name = ""
# email = ""
# phone = ""

[system]
# output_formats = ["docx"]

[system.git]
# auto_commit = false

[system.collection_id]
# max_length = 50

# [workflows.job]
# processors = []
"#;

/// Where to start looking and what to override
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    pub cwd: PathBuf,
    /// Pinned system root (`--system-root`)
    pub system_root: Option<PathBuf>,
    pub overrides: ConfigOverrides,
}

/// An opened installation, optionally with the project around `cwd`
#[derive(Debug, Clone)]
pub struct Workspace {
    pub system_root: PathBuf,
    pub project_root: Option<PathBuf>,
    pub system_env: Arc<FilesystemEnvironment>,
    /// Merged project-over-system environment, or the system one outside a project
    pub env: Arc<dyn Environment>,
    pub config: Arc<ResolvedConfig>,
    executor: BoundedExecutor,
    caller: CallerIdentity,
}

impl Workspace {
    /// Open using the real filesystem
    pub async fn open(options: &OpenOptions) -> Result<Self> {
        let search = SystemSearch::for_invocation(options.system_root.clone(), &options.cwd);
        Self::open_with(Arc::new(FsStorage::new()), &search, options).await
    }

    /// Open over an arbitrary storage adapter
    ///
    /// Being outside a project is not an error here; commands that need one
    /// call [`Workspace::require_project`].
    pub async fn open_with(
        storage: Arc<dyn StorageAdapter>,
        search: &SystemSearch,
        options: &OpenOptions,
    ) -> Result<Self> {
        let system_root = find_system_root(storage.as_ref(), search).await?;
        let system_env = Arc::new(
            FilesystemEnvironment::with_storage(
                Arc::clone(&storage),
                &system_root,
                EnvironmentLayout::system(),
            )
            .with_origin(WorkflowOrigin::Global),
        );

        let project_root = match find_project_root(storage.as_ref(), &options.cwd).await {
            Ok(root) => Some(root),
            Err(EngineError::ProjectNotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let (env, project_env): (Arc<dyn Environment>, Option<Arc<FilesystemEnvironment>>) =
            match &project_root {
                Some(root) => {
                    let local = Arc::new(
                        FilesystemEnvironment::with_storage(
                            Arc::clone(&storage),
                            root,
                            EnvironmentLayout::project(),
                        )
                        .with_origin(WorkflowOrigin::Local),
                    );
                    let merged = MergedEnvironment::new(
                        Arc::clone(&local) as Arc<dyn Environment>,
                        Arc::clone(&system_env) as Arc<dyn Environment>,
                    );
                    (Arc::new(merged), Some(local))
                }
                None => (Arc::clone(&system_env) as Arc<dyn Environment>, None),
            };

        let config = ResolvedConfig::resolve(
            system_env.as_ref(),
            project_env.as_deref().map(|e| e as &dyn Environment),
            &options.overrides,
        )
        .await?;

        info!(
            "Opened system root {} (project: {})",
            system_root.display(),
            project_root
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string())
        );

        let executor =
            BoundedExecutor::new(ExecutionLimits::from_config(&config.system.execution));
        Ok(Self {
            system_root,
            project_root,
            system_env,
            env,
            config: Arc::new(config),
            executor,
            caller: CallerIdentity::current("cli"),
        })
    }

    /// The project root, or `ProjectNotFound` when outside a project
    pub fn require_project(&self, cwd: &Path) -> Result<&Path> {
        self.project_root
            .as_deref()
            .ok_or_else(|| EngineError::ProjectNotFound(cwd.to_path_buf()))
    }

    /// Lifecycle engine over the merged environment
    pub fn engine(&self) -> Result<WorkflowEngine> {
        let git = self
            .project_root
            .as_deref()
            .and_then(|root| GitCommitter::detect(root, &self.config.system.git));
        Ok(WorkflowEngine::new(Arc::clone(&self.env), Arc::clone(&self.config))?
            .with_executor(self.executor.clone())
            .with_caller(self.caller.clone())
            .with_git(git))
    }

    /// Conversion pipeline sharing this workspace's executor
    pub fn pipeline(&self) -> ConversionPipeline {
        ConversionPipeline::from_config(&self.config, self.executor.clone(), self.caller.clone())
    }
}

/// Options of [`init_project`]
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Workflows to prepare stage directories for; `None` means all
    pub workflows: Option<Vec<String>>,
    /// Rewrite the config of an already initialized project
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitReport {
    pub project_root: PathBuf,
    pub config_path: PathBuf,
    /// True when the config came from the installation's template
    pub config_from_template: bool,
    pub workflows: Vec<String>,
    /// Stage directories, relative to the project root
    pub stage_dirs: Vec<PathBuf>,
}

/// Create the local layer of a project rooted at `target`
///
/// Existing collections are never touched; `force` only rewrites the config.
pub async fn init_project(
    storage: Arc<dyn StorageAdapter>,
    target: &Path,
    system_root: &Path,
    options: &InitOptions,
) -> Result<InitReport> {
    let marker = target.join(PROJECT_MARKER);
    if storage.exists(&marker).await && !options.force {
        return Err(EngineError::Validation(format!(
            "{} is already a docflow project; use --force to rewrite its config",
            target.display()
        )));
    }

    let system_env = FilesystemEnvironment::with_storage(
        Arc::clone(&storage),
        system_root,
        EnvironmentLayout::system(),
    );
    let available = system_env.manifest().await?;
    let selected = match &options.workflows {
        Some(names) => {
            for name in names {
                if !available.contains(name) {
                    return Err(EngineError::Validation(format!(
                        "unknown workflow '{}' (available: {})",
                        name,
                        available.names().collect::<Vec<_>>().join(", ")
                    )));
                }
            }
            names.clone()
        }
        None => available.names().map(str::to_string).collect(),
    };

    let layout = EnvironmentLayout::project();
    storage
        .mkdir(&target.join(&layout.workflows_dir), true)
        .await?;

    let template_path = system_root.join(PROJECT_CONFIG_TEMPLATE);
    let (config_text, config_from_template) = match storage.read(&template_path).await {
        Ok(bytes) => (bytes, true),
        Err(e) if e.kind() == sdk::ErrorKind::NotFound => {
            debug!("No project config template, writing the default");
            (DEFAULT_PROJECT_CONFIG.as_bytes().to_vec(), false)
        }
        Err(e) => return Err(e),
    };
    let config_path = target.join(&layout.config_file);
    storage.write(&config_path, &config_text).await?;

    let project_env = FilesystemEnvironment::with_storage(Arc::clone(&storage), target, layout);
    let mut stage_dirs = Vec::new();
    for name in &selected {
        let def = system_env.get_workflow(name).await?;
        for stage in def.stage_names() {
            let rel = Path::new(&def.name).join(stage);
            project_env.mkdir(&rel).await?;
            stage_dirs.push(rel);
        }
    }

    info!(
        "Initialized project at {} with {} workflow(s)",
        target.display(),
        selected.len()
    );
    Ok(InitReport {
        project_root: target.to_path_buf(),
        config_path,
        config_from_template,
        workflows: selected,
        stage_dirs,
    })
}
