//! Workflow and collection lifecycle engine
//!
//! Collections live in stage subdirectories of their workflow:
//!
//! ```text
//! <collections_dir>/<workflow>/<stage>/<collection_id>/collection.yml
//! ```
//!
//! A collection's stage is where its directory is. `advance` moves the
//! directory with a single rename and appends to the status history, which is
//! never rewritten.
//!
//! # Known Limitation
//!
//! Nothing locks a collection. Two writers mutating the same collection id
//! in one project race, and the last write wins.

use sdk::errors::{EngineError, Result};
use sdk::types::{CollectionMetadata, METADATA_FILE, REQUIRED_FIELDS};
use sdk::workflow::WorkflowDefinition;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ResolvedConfig;
use crate::environment::{checked_workflow_name, Environment};
use crate::executor::{BoundedExecutor, CallerIdentity, ExecutionLimits};
use crate::git::GitCommitter;
use crate::scraper::Scraper;

pub mod clock;
pub mod collection_id;
pub mod templates;

pub use clock::{Clock, GenerationContext};
pub use collection_id::{generate_collection_id, sanitize};
pub use templates::TemplateVars;

/// File a downloaded posting is stored in
pub const DOWNLOAD_FILE: &str = "job_description.html";

/// A collection as found on storage
#[derive(Debug, Clone, PartialEq)]
pub struct Collection {
    pub metadata: CollectionMetadata,
    /// Stage directory the collection was found in
    pub stage: String,
    /// Directory relative to the environment's collections root
    pub path: PathBuf,
}

impl Collection {
    pub fn id(&self) -> &str {
        &self.metadata.collection_id
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.path.join(METADATA_FILE)
    }
}

/// A collection that could not be loaded during a scan
#[derive(Debug)]
pub struct LoadFailure {
    pub path: PathBuf,
    pub error: EngineError,
}

/// Result of scanning one workflow
#[derive(Debug, Default)]
pub struct CollectionListing {
    /// Sorted by collection id
    pub collections: Vec<Collection>,
    pub failures: Vec<LoadFailure>,
}

/// Optional inputs of [`WorkflowEngine::create`]
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Posting to download into the new collection
    pub url: Option<String>,
    pub template_variant: Option<String>,
}

pub struct WorkflowEngine {
    env: Arc<dyn Environment>,
    config: Arc<ResolvedConfig>,
    ctx: GenerationContext,
    executor: BoundedExecutor,
    caller: CallerIdentity,
    scraper: Scraper,
    git: Option<GitCommitter>,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("env", &self.env.describe())
            .field("ctx", &self.ctx)
            .field("git", &self.git.is_some())
            .finish()
    }
}

impl WorkflowEngine {
    pub fn new(env: Arc<dyn Environment>, config: Arc<ResolvedConfig>) -> Result<Self> {
        let ctx = GenerationContext::from_config(&config)?;
        let executor = BoundedExecutor::new(ExecutionLimits::from_config(&config.system.execution));
        let scraper = Scraper::from_config(&config.system)?;
        Ok(Self {
            env,
            config,
            ctx,
            executor,
            caller: CallerIdentity::current("docflow"),
            scraper,
            git: None,
        })
    }

    pub fn with_context(mut self, ctx: GenerationContext) -> Self {
        self.ctx = ctx;
        self
    }

    /// Share an executor (and its registry) with other components
    pub fn with_executor(mut self, executor: BoundedExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_caller(mut self, caller: CallerIdentity) -> Self {
        self.caller = caller;
        self
    }

    pub fn with_git(mut self, git: Option<GitCommitter>) -> Self {
        self.git = git;
        self
    }

    pub fn environment(&self) -> &Arc<dyn Environment> {
        &self.env
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn context(&self) -> &GenerationContext {
        &self.ctx
    }

    pub fn executor(&self) -> &BoundedExecutor {
        &self.executor
    }

    pub fn caller(&self) -> &CallerIdentity {
        &self.caller
    }

    /// Load a workflow definition; unknown names are a validation error
    pub async fn workflow(&self, name: &str) -> Result<WorkflowDefinition> {
        checked_workflow_name(name)?;
        match self.env.get_workflow(name).await {
            Err(EngineError::WorkflowNotFound(_)) => Err(EngineError::Validation(format!(
                "unknown workflow '{}'",
                name
            ))),
            other => other,
        }
    }

    /// Create a collection from its identity field values
    ///
    /// `values` are matched positionally to the workflow's identity fields.
    pub async fn create(
        &self,
        workflow: &str,
        values: &[&str],
        options: &CreateOptions,
    ) -> Result<Collection> {
        let def = self.workflow(workflow).await?;
        if values.len() != def.identity_fields.len() {
            return Err(EngineError::Validation(format!(
                "workflow '{}' expects {} identifying value(s) ({}), got {}",
                def.name,
                def.identity_fields.len(),
                def.identity_fields.join(", "),
                values.len()
            )));
        }

        let id = generate_collection_id(values, &self.config.system.collection_id, &self.ctx)?;
        for stage in def.stage_names() {
            let existing = collection_dir(&def.name, stage, &id);
            if !self.env.exists(&existing).await? {
                continue;
            }
            if self.env.exists(&existing.join(METADATA_FILE)).await? {
                return Err(EngineError::Validation(format!(
                    "collection '{}' already exists in stage '{}'",
                    id, stage
                )));
            }
            // Leftover of an interrupted create
            warn!(
                "Removing {} which has no {}",
                existing.display(),
                METADATA_FILE
            );
            self.env.remove(&existing).await?;
        }

        let now = self.ctx.now();
        let stage = def.initial_stage().to_string();
        let mut metadata = CollectionMetadata::new(&id, &def.name, &stage, now);
        for (field, value) in def.identity_fields.iter().zip(values) {
            metadata.extra.insert(field.clone(), (*value).into());
        }
        if let Some(url) = &options.url {
            metadata.extra.insert("url".to_string(), url.as_str().into());
        }
        if let Some(variant) = &options.template_variant {
            metadata
                .extra
                .insert("template_variant".to_string(), variant.as_str().into());
        }
        for (key, value) in self.config.workflow(&def.name).custom_fields {
            if REQUIRED_FIELDS.contains(&key.as_str()) || metadata.extra.contains_key(&key) {
                warn!("Ignoring custom field '{}' that shadows a collection field", key);
                continue;
            }
            let value = serde_yaml::to_value(&value).map_err(|e| {
                EngineError::Config(format!("custom field '{}' is not representable: {}", key, e))
            })?;
            metadata.extra.insert(key, value);
        }

        // Render everything before touching storage so a bad template leaves nothing behind
        let vars = self.template_vars(&def, &metadata);

        let mut seeded = Vec::new();
        for template in &def.templates {
            let file = template.file_for(options.template_variant.as_deref());
            let body = self
                .env
                .read_workflow_file(&def.name, Path::new(file))
                .await?;
            let body = match String::from_utf8(body) {
                Ok(text) => vars.render(&text).into_bytes(),
                Err(raw) => raw.into_bytes(),
            };
            let output = vars.render(&template.output);
            crate::environment::checked_relative(Path::new(&output))?;
            seeded.push((output, body));
        }

        let dir = collection_dir(&def.name, &stage, &id);
        self.env.mkdir(&dir).await?;
        let collection = match self.populate(&dir, seeded, metadata, stage, options).await {
            Ok(collection) => collection,
            Err(e) => {
                if let Err(cleanup) = self.env.remove(&dir).await {
                    warn!("Failed to remove partial {}: {}", dir.display(), cleanup);
                }
                return Err(e);
            }
        };
        info!("Created collection {}/{}", def.name, id);

        self.auto_commit("create", &def.name, &id).await;
        Ok(collection)
    }

    /// Fill a freshly made collection directory; metadata goes last
    async fn populate(
        &self,
        dir: &Path,
        seeded: Vec<(String, Vec<u8>)>,
        mut metadata: CollectionMetadata,
        stage: String,
        options: &CreateOptions,
    ) -> Result<Collection> {
        for (output, body) in &seeded {
            self.env.write_file(&dir.join(output), body).await?;
            debug!("Seeded {}", dir.join(output).display());
        }

        if let Some(url) = &options.url {
            match self.scraper.fetch(&self.executor, &self.caller, url).await {
                Ok(body) => {
                    self.env.write_file(&dir.join(DOWNLOAD_FILE), &body).await?;
                }
                Err(e) => {
                    warn!("Download of {} failed: {}", url, e);
                    metadata
                        .extra
                        .insert("download_error".to_string(), e.to_string().into());
                }
            }
        }

        let collection = Collection {
            metadata,
            stage,
            path: dir.to_path_buf(),
        };
        self.write_metadata(&collection).await?;
        Ok(collection)
    }

    /// Scan every stage of a workflow
    ///
    /// Unreadable metadata is reported in `failures` without aborting the
    /// scan. The same id in two stages is a consistency error.
    pub async fn get_collections(&self, workflow: &str) -> Result<CollectionListing> {
        let def = self.workflow(workflow).await?;
        let mut listing = CollectionListing::default();
        let mut seen: HashMap<String, String> = HashMap::new();

        for stage in def.stage_names() {
            let stage_dir = Path::new(&def.name).join(stage);
            let entries = match self.env.list(&stage_dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == sdk::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };

            for entry in entries.into_iter().filter(|e| e.is_directory) {
                if let Some(other) = seen.get(&entry.name) {
                    return Err(duplicate_error(&def.name, &entry.name, other, stage));
                }
                seen.insert(entry.name.clone(), stage.to_string());

                let path = stage_dir.join(&entry.name);
                match self.load(&def, stage, &path).await {
                    Ok(Some(collection)) => listing.collections.push(collection),
                    Ok(None) => debug!("Skipping {} without metadata", path.display()),
                    Err(error) => {
                        warn!("Failed to load {}: {}", path.display(), error);
                        listing.failures.push(LoadFailure { path, error });
                    }
                }
            }
        }

        listing
            .collections
            .sort_by(|a, b| a.metadata.collection_id.cmp(&b.metadata.collection_id));
        debug!(
            "Workflow '{}': {} collection(s), {} failure(s)",
            def.name,
            listing.collections.len(),
            listing.failures.len()
        );
        Ok(listing)
    }

    /// Load one collection by id
    pub async fn get_collection(&self, workflow: &str, id: &str) -> Result<Collection> {
        let def = self.workflow(workflow).await?;
        self.find(&def, id).await
    }

    /// Move a collection to `target`
    ///
    /// Moving backwards requires `force`. Advancing to the current stage
    /// records a history entry without moving anything.
    pub async fn advance(
        &self,
        workflow: &str,
        id: &str,
        target: &str,
        force: bool,
    ) -> Result<Collection> {
        let def = self.workflow(workflow).await?;
        let target_index = def.stage_index(target).ok_or_else(|| {
            EngineError::Validation(format!(
                "unknown stage '{}' for workflow '{}' (stages: {})",
                target,
                def.name,
                def.stage_names().collect::<Vec<_>>().join(", ")
            ))
        })?;

        let mut collection = self.find(&def, id).await?;
        let current_index = def.stage_index(&collection.stage).unwrap_or(0);
        if target_index < current_index && !force {
            return Err(EngineError::Validation(format!(
                "cannot move '{}' back from '{}' to '{}' without --force",
                id, collection.stage, target
            )));
        }

        collection.metadata.record_status(target, self.ctx.now());
        if collection.stage != target {
            let to = collection_dir(&def.name, target, id);
            self.env.rename(&collection.path, &to).await?;
            info!(
                "Moved {}/{} from '{}' to '{}'",
                def.name, id, collection.stage, target
            );
            collection.path = to;
            collection.stage = target.to_string();
        }
        self.write_metadata(&collection).await?;

        self.auto_commit("advance", &def.name, id).await;
        Ok(collection)
    }

    /// Merge extension fields into a collection's metadata
    pub async fn update_fields(
        &self,
        workflow: &str,
        id: &str,
        fields: &BTreeMap<String, String>,
    ) -> Result<Collection> {
        if let Some(key) = fields.keys().find(|k| REQUIRED_FIELDS.contains(&k.as_str())) {
            return Err(EngineError::Validation(format!(
                "'{}' is managed by docflow and cannot be updated",
                key
            )));
        }

        let def = self.workflow(workflow).await?;
        let mut collection = self.find(&def, id).await?;
        for (key, value) in fields {
            collection
                .metadata
                .extra
                .insert(key.clone(), value.as_str().into());
        }
        collection.metadata.touch(self.ctx.now());
        self.write_metadata(&collection).await?;

        info!("Updated {} field(s) of {}/{}", fields.len(), def.name, id);
        self.auto_commit("update", &def.name, id).await;
        Ok(collection)
    }

    /// Remove a collection and all of its files
    pub async fn delete(&self, workflow: &str, id: &str) -> Result<()> {
        let def = self.workflow(workflow).await?;
        let collection = self.find(&def, id).await?;
        self.env.remove(&collection.path).await?;
        info!("Deleted collection {}/{}", def.name, id);
        self.auto_commit("delete", &def.name, id).await;
        Ok(())
    }

    /// Variables a collection's templates and file names are rendered with
    pub fn template_vars(
        &self,
        def: &WorkflowDefinition,
        metadata: &CollectionMetadata,
    ) -> TemplateVars {
        let mut vars = TemplateVars::new();
        vars.extend(self.config.user.template_vars());
        for field in &def.identity_fields {
            if let Some(value) = metadata.field_str(field) {
                vars.insert(field.clone(), value);
            }
        }
        vars.insert("collection_id", metadata.collection_id.clone());
        vars.insert(
            "date",
            metadata.date_created.format("%Y-%m-%d").to_string(),
        );
        vars
    }

    /// Persist a collection's metadata file
    pub async fn write_metadata(&self, collection: &Collection) -> Result<()> {
        let yaml = collection.metadata.to_yaml().map_err(|e| {
            EngineError::Validation(format!(
                "cannot serialize metadata of {}: {}",
                collection.id(),
                e
            ))
        })?;
        self.env
            .write_file(&collection.metadata_path(), yaml.as_bytes())
            .await
    }

    async fn find(&self, def: &WorkflowDefinition, id: &str) -> Result<Collection> {
        checked_collection_id(id)?;

        let mut found: Option<Collection> = None;
        for stage in def.stage_names() {
            let path = collection_dir(&def.name, stage, id);
            if !self.env.exists(&path).await? {
                continue;
            }
            if let Some(first) = &found {
                return Err(duplicate_error(&def.name, id, &first.stage, stage));
            }
            found = self.load(def, stage, &path).await?;
        }

        found.ok_or_else(|| EngineError::CollectionNotFound {
            workflow: def.name.clone(),
            id: id.to_string(),
        })
    }

    /// Load a collection directory; `None` when it has no metadata file
    async fn load(
        &self,
        def: &WorkflowDefinition,
        stage: &str,
        path: &Path,
    ) -> Result<Option<Collection>> {
        let meta_path = path.join(METADATA_FILE);
        let bytes = match self.env.read_file(&meta_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == sdk::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        let malformed = |reason: String| EngineError::MalformedMetadata {
            path: meta_path.clone(),
            reason,
        };
        let text = String::from_utf8(bytes).map_err(|_| malformed("not UTF-8".to_string()))?;
        let metadata = CollectionMetadata::from_yaml(&text).map_err(|e| malformed(e.to_string()))?;
        metadata
            .validate(def)
            .map_err(|e| malformed(e.to_string()))?;

        let dir_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if metadata.collection_id != dir_name {
            return Err(malformed(format!(
                "collection_id '{}' does not match directory '{}'",
                metadata.collection_id, dir_name
            )));
        }
        if metadata.status != stage {
            warn!(
                "{}/{} has status '{}' but lives in '{}'; using the directory",
                def.name, metadata.collection_id, metadata.status, stage
            );
        }

        Ok(Some(Collection {
            metadata,
            stage: stage.to_string(),
            path: path.to_path_buf(),
        }))
    }

    async fn auto_commit(&self, action: &str, workflow: &str, id: &str) {
        let Some(git) = &self.git else {
            return;
        };
        let Some(workflow_path) = self.env.resolve_path(Path::new(workflow)) else {
            return;
        };
        let message = git.message(action, workflow, id);
        git.commit(&self.executor, &self.caller, &[workflow_path], &message)
            .await;
    }
}

fn collection_dir(workflow: &str, stage: &str, id: &str) -> PathBuf {
    Path::new(workflow).join(stage).join(id)
}

fn checked_collection_id(id: &str) -> Result<&str> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains('/')
        && !id.contains('\\');
    if !valid {
        return Err(EngineError::Validation(format!(
            "invalid collection id '{}'",
            id
        )));
    }
    Ok(id)
}

fn duplicate_error(workflow: &str, id: &str, first: &str, second: &str) -> EngineError {
    EngineError::Consistency(format!(
        "collection '{}/{}' exists in both '{}' and '{}'",
        workflow, id, first, second
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{EnvironmentLayout, MemoryEnvironment};
    use chrono::{Duration, TimeZone, Utc};

    const JOB: &str = r#"
name: job
stages:
  - name: active
  - name: submitted
  - name: interview
  - name: rejected
identity_fields: [company, role]
templates:
  - name: cover
    file: templates/cover.md
    output: cover_letter.md
    variants:
      short: templates/cover_short.md
"#;

    const BLOG: &str = r#"
name: blog
stages:
  - name: draft
  - name: published
identity_fields: [title]
"#;

    fn env() -> Arc<MemoryEnvironment> {
        Arc::new(
            MemoryEnvironment::new(EnvironmentLayout::project())
                .with_workflow("job", JOB)
                .with_workflow_file(
                    "job",
                    "templates/cover.md",
                    "Dear {{company}},\n{{user.name}} for {{role}} ({{collection_id}}, {{date}}) {{unknown}}\n",
                )
                .with_workflow_file("job", "templates/cover_short.md", "Hi {{company}}")
                .with_workflow("blog", BLOG),
        )
    }

    fn engine_on(env: Arc<MemoryEnvironment>) -> WorkflowEngine {
        let config = ResolvedConfig::from_layers(vec![toml::from_str(
            "[user]\nname = \"Ada Lovelace\"\n[workflows.job.custom_fields]\nsource = \"referral\"\n",
        )
        .unwrap()])
        .unwrap();
        WorkflowEngine::new(env, Arc::new(config))
            .unwrap()
            .with_context(GenerationContext::frozen(
                Utc.with_ymd_and_hms(2025, 7, 30, 10, 0, 0).unwrap(),
            ))
    }

    #[tokio::test]
    async fn test_create_seeds_metadata_and_template() {
        let env = env();
        let engine = engine_on(Arc::clone(&env));

        let created = engine
            .create("job", &["Google Inc", "Software Engineer"], &CreateOptions::default())
            .await
            .unwrap();
        assert_eq!(created.id(), "google_inc_software_engineer_20250730");
        assert_eq!(created.stage, "active");
        assert_eq!(created.metadata.status_history.len(), 1);
        assert_eq!(created.metadata.field_str("company"), Some("Google Inc"));
        assert_eq!(created.metadata.field_str("source"), Some("referral"));

        let cover = env
            .read_file(&created.path.join("cover_letter.md"))
            .await
            .unwrap();
        assert_eq!(
            String::from_utf8(cover).unwrap(),
            "Dear Google Inc,\nAda Lovelace for Software Engineer (google_inc_software_engineer_20250730, 2025-07-30) {{unknown}}\n"
        );

        let loaded = engine
            .get_collection("job", created.id())
            .await
            .unwrap();
        assert_eq!(loaded, created);
    }

    #[tokio::test]
    async fn test_template_variant() {
        let env = env();
        let engine = engine_on(Arc::clone(&env));
        let created = engine
            .create(
                "job",
                &["Acme", "Dev"],
                &CreateOptions {
                    template_variant: Some("short".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let cover = env
            .read_file(&created.path.join("cover_letter.md"))
            .await
            .unwrap();
        assert_eq!(cover, b"Hi Acme");
        assert_eq!(created.metadata.field_str("template_variant"), Some("short"));
    }

    #[tokio::test]
    async fn test_failed_create_leaves_no_directory() {
        let env = Arc::new(
            MemoryEnvironment::new(EnvironmentLayout::project())
                .with_workflow(
                    "notes",
                    "name: notes\nstages: [{name: draft}]\nidentity_fields: [title]\ntemplates:\n  - {name: a, file: templates/a.md, output: notes/a.md}\n  - {name: b, file: templates/b.md, output: notes}\n",
                )
                .with_workflow_file("notes", "templates/a.md", "a")
                .with_workflow_file("notes", "templates/b.md", "b"),
        );
        let engine = engine_on(Arc::clone(&env));

        assert!(engine
            .create("notes", &["Hello"], &CreateOptions::default())
            .await
            .is_err());
        assert!(!env
            .exists(Path::new("notes/draft/hello_20250730"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_create_replaces_directory_without_metadata() {
        let env = env();
        env.write_file(
            Path::new("blog/draft/hello_world_20250730/stray.md"),
            b"half written",
        )
        .await
        .unwrap();
        let engine = engine_on(Arc::clone(&env));

        let created = engine
            .create("blog", &["Hello World"], &CreateOptions::default())
            .await
            .unwrap();
        assert_eq!(created.id(), "hello_world_20250730");
        assert!(env.exists(&created.metadata_path()).await.unwrap());
        assert!(!env.exists(&created.path.join("stray.md")).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let engine = engine_on(env());
        engine
            .create("blog", &["Hello World"], &CreateOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            engine
                .create("blog", &["Hello, World!"], &CreateOptions::default())
                .await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_workflow_is_validation_error() {
        let engine = engine_on(env());
        assert!(matches!(
            engine.get_collections("podcast").await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            engine.create("podcast", &["x"], &CreateOptions::default()).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_number_of_identity_values() {
        let engine = engine_on(env());
        assert!(matches!(
            engine.create("job", &["Acme"], &CreateOptions::default()).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_advance_moves_and_appends_history() {
        let env = env();
        let engine = engine_on(Arc::clone(&env));
        let created = engine
            .create("job", &["Acme", "Dev"], &CreateOptions::default())
            .await
            .unwrap();

        let moved = engine
            .advance("job", created.id(), "interview", false)
            .await
            .unwrap();
        assert_eq!(moved.stage, "interview");
        assert_eq!(moved.metadata.status, "interview");
        assert_eq!(moved.metadata.status_history.len(), 2);
        assert!(!env.exists(&created.path).await.unwrap());
        assert!(env
            .exists(Path::new("job/interview/acme_dev_20250730/cover_letter.md"))
            .await
            .unwrap());

        // Backwards needs force
        assert!(matches!(
            engine.advance("job", created.id(), "submitted", false).await,
            Err(EngineError::Validation(_))
        ));
        let back = engine
            .advance("job", created.id(), "submitted", true)
            .await
            .unwrap();
        assert_eq!(back.metadata.status_history.len(), 3);

        // Same stage records history without moving
        let same = engine
            .advance("job", created.id(), "submitted", false)
            .await
            .unwrap();
        assert_eq!(same.path, back.path);
        assert_eq!(same.metadata.status_history.len(), 4);
    }

    #[tokio::test]
    async fn test_advance_unknown_stage() {
        let engine = engine_on(env());
        let created = engine
            .create("blog", &["Post"], &CreateOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            engine.advance("blog", created.id(), "archived", false).await,
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_history_dates_never_decrease() {
        let env = env();
        let later = Utc.with_ymd_and_hms(2025, 8, 1, 0, 0, 0).unwrap();
        let engine = engine_on(Arc::clone(&env)).with_context(GenerationContext::frozen(later));
        let created = engine
            .create("blog", &["Clock Skew"], &CreateOptions::default())
            .await
            .unwrap();

        // A clock that went backwards
        let earlier = engine_on(env).with_context(GenerationContext::frozen(later - Duration::days(3)));
        let moved = earlier
            .advance("blog", created.id(), "published", false)
            .await
            .unwrap();
        let dates: Vec<_> = moved
            .metadata
            .status_history
            .iter()
            .map(|e| e.date)
            .collect();
        assert!(dates.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(moved.metadata.date_modified, later);
    }

    #[tokio::test]
    async fn test_listing_reports_malformed_and_continues() {
        let env = env();
        let engine = engine_on(Arc::clone(&env));
        engine
            .create("blog", &["Good Post"], &CreateOptions::default())
            .await
            .unwrap();
        env.write_file(Path::new("blog/draft/broken/collection.yml"), b": : :")
            .await
            .unwrap();
        env.mkdir(Path::new("blog/draft/empty_dir")).await.unwrap();

        let listing = engine.get_collections("blog").await.unwrap();
        assert_eq!(listing.collections.len(), 1);
        assert_eq!(listing.failures.len(), 1);
        assert!(matches!(
            listing.failures[0].error,
            EngineError::MalformedMetadata { .. }
        ));
    }

    #[tokio::test]
    async fn test_same_id_in_two_stages_is_consistency_error() {
        let env = env();
        let engine = engine_on(Arc::clone(&env));
        let created = engine
            .create("blog", &["Twin"], &CreateOptions::default())
            .await
            .unwrap();
        let meta = env.read_file(&created.metadata_path()).await.unwrap();
        env.write_file(
            &Path::new("blog/published").join(created.id()).join(METADATA_FILE),
            &meta,
        )
        .await
        .unwrap();

        assert!(matches!(
            engine.get_collections("blog").await,
            Err(EngineError::Consistency(_))
        ));
        assert!(matches!(
            engine.get_collection("blog", created.id()).await,
            Err(EngineError::Consistency(_))
        ));
    }

    #[tokio::test]
    async fn test_update_fields_and_delete() {
        let env = env();
        let engine = engine_on(Arc::clone(&env));
        let created = engine
            .create("blog", &["Draft One"], &CreateOptions::default())
            .await
            .unwrap();

        let mut fields = BTreeMap::new();
        fields.insert("tags".to_string(), "rust".to_string());
        let updated = engine
            .update_fields("blog", created.id(), &fields)
            .await
            .unwrap();
        assert_eq!(updated.metadata.field_str("tags"), Some("rust"));

        fields.insert("status".to_string(), "published".to_string());
        assert!(matches!(
            engine.update_fields("blog", created.id(), &fields).await,
            Err(EngineError::Validation(_))
        ));

        engine.delete("blog", created.id()).await.unwrap();
        assert!(matches!(
            engine.get_collection("blog", created.id()).await,
            Err(EngineError::CollectionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_download_failure_recorded_not_fatal() {
        let engine = engine_on(env());
        let created = engine
            .create(
                "blog",
                &["Linked"],
                &CreateOptions {
                    url: Some("ftp://example.invalid/post".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(created.metadata.field_str("download_error").is_some());
        assert_eq!(
            created.metadata.field_str("url"),
            Some("ftp://example.invalid/post")
        );
    }

    #[tokio::test]
    async fn test_invalid_collection_id() {
        let engine = engine_on(env());
        assert!(matches!(
            engine.get_collection("blog", "../../etc").await,
            Err(EngineError::Validation(_))
        ));
    }
}
