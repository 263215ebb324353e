//! End-to-end tests over a real directory tree
//!
//! Each test installs a small system root and a project in a temp dir, then
//! drives the library through `Workspace` the way the CLI does.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use docflow_engine::config::discovery::{SystemSearch, SYSTEM_DESCRIPTOR};
use docflow_engine::config::ConfigOverrides;
use docflow_engine::project::{init_project, InitOptions, OpenOptions, Workspace};
use docflow_engine::storage::{FsStorage, StorageAdapter};
use docflow_engine::workflow::CreateOptions;
use sdk::errors::EngineError;
use sdk::types::CollectionMetadata;

const JOB: &str = r#"
name: job
description: Job applications
stages:
  - name: active
  - name: submitted
  - name: interview
  - name: offer
  - name: rejected
identity_fields: [company, role]
templates:
  - name: cover_letter
    file: templates/cover_letter.md
    output: cover_letter.md
"#;

const PRESENTATION: &str = r#"
name: presentation
stages:
  - name: draft
  - name: ready
  - name: delivered
identity_fields: [title]
templates:
  - name: deck
    file: templates/deck.md
    output: "{{collection_id}}.md"
processors: [emoji]
converter:
  kind: presentation
  formats: [pptx, html]
"#;

struct Fixture {
    _temp: TempDir,
    system: PathBuf,
    project: PathBuf,
}

fn write(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn install(system_config: &str) -> Fixture {
    let temp = TempDir::new().unwrap();
    let system = temp.path().join("share/docflow");
    let project = temp.path().join("home/ada/applications");

    write(&system.join(SYSTEM_DESCRIPTOR), "name = \"docflow\"\n");
    write(&system.join("config.toml"), system_config);
    write(&system.join("workflows/job/workflow.yml"), JOB);
    write(
        &system.join("workflows/job/templates/cover_letter.md"),
        "Dear {{company}} team,\n\nI am applying for {{role}}.\n\n{{user.name}}\n",
    );
    write(&system.join("workflows/presentation/workflow.yml"), PRESENTATION);
    write(
        &system.join("workflows/presentation/templates/deck.md"),
        "# {{title}} :rocket:\n",
    );
    std::fs::create_dir_all(&project).unwrap();

    Fixture {
        _temp: temp,
        system,
        project,
    }
}

const FROZEN: &str = r#"
[user]
name = "Ada Lovelace"
email = "ada@example.com"

[system.testing]
override_current_date = "2025-07-30"
"#;

async fn init(fixture: &Fixture, workflows: Option<Vec<String>>) {
    init_project(
        Arc::new(FsStorage::new()),
        &fixture.project,
        &fixture.system,
        &InitOptions {
            workflows,
            force: false,
        },
    )
    .await
    .unwrap();
}

async fn open(fixture: &Fixture, cwd: &Path, overrides: ConfigOverrides) -> Workspace {
    let options = OpenOptions {
        cwd: cwd.to_path_buf(),
        system_root: None,
        overrides,
    };
    Workspace::open_with(
        Arc::new(FsStorage::new()),
        &SystemSearch::fixed(&fixture.system),
        &options,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_init_create_list_advance() {
    let fixture = install(FROZEN);
    init(&fixture, None).await;
    assert!(fixture.project.join(".docflow/config.toml").is_file());
    assert!(fixture.project.join("job/active").is_dir());
    assert!(fixture.project.join("presentation/delivered").is_dir());

    // Commands work from anywhere inside the project
    let cwd = fixture.project.join("job/active");
    let workspace = open(&fixture, &cwd, ConfigOverrides::new()).await;
    let engine = workspace.engine().unwrap();

    let created = engine
        .create(
            "job",
            &["Google Inc", "Software Engineer"],
            &CreateOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(created.id(), "google_inc_software_engineer_20250730");

    let dir = fixture
        .project
        .join("job/active/google_inc_software_engineer_20250730");
    let letter = std::fs::read_to_string(dir.join("cover_letter.md")).unwrap();
    assert_eq!(
        letter,
        "Dear Google Inc team,\n\nI am applying for Software Engineer.\n\nAda Lovelace\n"
    );
    let metadata =
        CollectionMetadata::from_yaml(&std::fs::read_to_string(dir.join("collection.yml")).unwrap())
            .unwrap();
    assert_eq!(metadata.status, "active");
    assert_eq!(metadata.field_str("company"), Some("Google Inc"));

    engine
        .advance("job", created.id(), "interview", false)
        .await
        .unwrap();
    assert!(!dir.exists());
    let moved = fixture
        .project
        .join("job/interview/google_inc_software_engineer_20250730");
    assert!(moved.join("cover_letter.md").is_file());

    let listing = engine.get_collections("job").await.unwrap();
    assert_eq!(listing.collections.len(), 1);
    assert!(listing.failures.is_empty());
    let collection = &listing.collections[0];
    assert_eq!(collection.stage, "interview");
    let history: Vec<_> = collection
        .metadata
        .status_history
        .iter()
        .map(|e| e.status.as_str())
        .collect();
    assert_eq!(history, vec!["active", "interview"]);

    let backwards = engine.advance("job", created.id(), "submitted", false).await;
    assert!(matches!(backwards, Err(EngineError::Validation(_))));
    engine
        .advance("job", created.id(), "submitted", true)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_two_presentations_listed_with_single_history_entries() {
    let fixture = install(FROZEN);
    init(&fixture, Some(vec!["presentation".to_string()])).await;
    assert!(!fixture.project.join("job").exists());

    let workspace = open(&fixture, &fixture.project, ConfigOverrides::new()).await;
    let engine = workspace.engine().unwrap();
    let options = CreateOptions::default();
    engine
        .create("presentation", &["Rust at Scale"], &options)
        .await
        .unwrap();
    engine
        .create("presentation", &["Async Pitfalls"], &options)
        .await
        .unwrap();

    let listing = engine.get_collections("presentation").await.unwrap();
    let ids: Vec<_> = listing.collections.iter().map(|c| c.id()).collect();
    assert_eq!(ids, vec!["async_pitfalls_20250730", "rust_at_scale_20250730"]);
    for collection in &listing.collections {
        assert_eq!(collection.metadata.status_history.len(), 1);
        assert_eq!(collection.metadata.status_history[0].status, "draft");
    }

    let deck = fixture
        .project
        .join("presentation/draft/rust_at_scale_20250730/rust_at_scale_20250730.md");
    assert_eq!(std::fs::read_to_string(deck).unwrap(), "# Rust at Scale :rocket:\n");
}

#[tokio::test]
async fn test_truncated_id_keeps_date_suffix() {
    let fixture = install(FROZEN);
    init(&fixture, None).await;
    let overrides = ConfigOverrides::new()
        .set("system.collection_id.max_length", "25")
        .unwrap();
    let workspace = open(&fixture, &fixture.project, overrides).await;
    let engine = workspace.engine().unwrap();

    let created = engine
        .create(
            "presentation",
            &["This is a very long blog post title"],
            &CreateOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(created.id(), "this_is_a_very_l_20250730");
    assert!(created.id().len() <= 25);
}

#[tokio::test]
async fn test_project_config_and_overrides_take_precedence() {
    let fixture = install(FROZEN);
    init(&fixture, None).await;
    write(
        &fixture.project.join(".docflow/config.toml"),
        "[user]\nname = \"Project Persona\"\n\n[system]\noutput_formats = [\"html\"]\n",
    );

    let workspace = open(&fixture, &fixture.project, ConfigOverrides::new()).await;
    assert_eq!(workspace.config.user.name, "Project Persona");
    assert_eq!(workspace.config.user.email, "ada@example.com");
    assert_eq!(workspace.config.system.output_formats, vec!["html"]);
    assert_eq!(
        workspace.config.system.testing.override_current_date.as_deref(),
        Some("2025-07-30")
    );

    let overrides = ConfigOverrides::new()
        .set_pair("user.name=Runtime Name")
        .unwrap();
    let workspace = open(&fixture, &fixture.project, overrides).await;
    assert_eq!(workspace.config.user.name, "Runtime Name");
}

#[tokio::test]
async fn test_local_workflow_shadows_global_without_touching_it() {
    let fixture = install(FROZEN);
    init(&fixture, Some(vec![])).await;
    let local_job = JOB.replace("  - name: rejected\n", "  - name: rejected\n  - name: archived\n");
    write(
        &fixture.project.join(".docflow/workflows/job/workflow.yml"),
        &local_job,
    );
    write(
        &fixture
            .project
            .join(".docflow/workflows/job/templates/cover_letter.md"),
        "Local letter for {{company}}\n",
    );

    let workspace = open(&fixture, &fixture.project, ConfigOverrides::new()).await;
    let engine = workspace.engine().unwrap();
    let created = engine
        .create("job", &["Acme", "Dev"], &CreateOptions::default())
        .await
        .unwrap();
    engine
        .advance("job", created.id(), "archived", false)
        .await
        .unwrap();

    let letter = fixture
        .project
        .join("job/archived/acme_dev_20250730/cover_letter.md");
    assert_eq!(
        std::fs::read_to_string(letter).unwrap(),
        "Local letter for Acme\n"
    );
    assert_eq!(
        std::fs::read_to_string(fixture.system.join("workflows/job/workflow.yml")).unwrap(),
        JOB
    );
    assert!(!fixture.system.join("collections").exists());
}

#[tokio::test]
async fn test_not_in_project_and_missing_system() {
    let fixture = install(FROZEN);
    let workspace = open(&fixture, &fixture.project, ConfigOverrides::new()).await;
    assert!(workspace.project_root.is_none());
    assert!(matches!(
        workspace.require_project(&fixture.project),
        Err(EngineError::ProjectNotFound(_))
    ));

    let empty = TempDir::new().unwrap();
    let result = Workspace::open_with(
        Arc::new(FsStorage::new()),
        &SystemSearch::fixed(empty.path()),
        &OpenOptions {
            cwd: empty.path().to_path_buf(),
            ..Default::default()
        },
    )
    .await;
    assert!(matches!(result, Err(EngineError::SystemNotFound(_))));
}

#[tokio::test]
async fn test_reinit_keeps_collections() {
    let fixture = install(FROZEN);
    init(&fixture, None).await;
    let workspace = open(&fixture, &fixture.project, ConfigOverrides::new()).await;
    workspace
        .engine()
        .unwrap()
        .create("job", &["Acme", "Dev"], &CreateOptions::default())
        .await
        .unwrap();

    let storage: Arc<dyn StorageAdapter> = Arc::new(FsStorage::new());
    let again = init_project(
        Arc::clone(&storage),
        &fixture.project,
        &fixture.system,
        &InitOptions::default(),
    )
    .await;
    assert!(matches!(again, Err(EngineError::Validation(_))));

    init_project(
        storage,
        &fixture.project,
        &fixture.system,
        &InitOptions {
            workflows: None,
            force: true,
        },
    )
    .await
    .unwrap();
    assert!(fixture
        .project
        .join("job/active/acme_dev_20250730/collection.yml")
        .is_file());
}

#[cfg(unix)]
mod conversion {
    use super::*;
    use docflow_engine::conversion::FormatRequest;
    use std::os::unix::fs::PermissionsExt;

    fn fake_pandoc(dir: &Path) -> PathBuf {
        let path = dir.join("fake-pandoc");
        std::fs::write(
            &path,
            "#!/bin/sh\n[ \"$1\" = \"--version\" ] && echo 'pandoc 3.1' && exit 0\ncp \"$1\" \"$4\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_format_collection_end_to_end() {
        let fixture = install(FROZEN);
        init(&fixture, None).await;
        let tool = fake_pandoc(fixture.system.parent().unwrap());
        let overrides = ConfigOverrides::from_value(
            toml::from_str(&format!(
                "[system.converter]\npandoc_path = \"{}\"\n",
                tool.display()
            ))
            .unwrap(),
        );
        let workspace = open(&fixture, &fixture.project, overrides).await;
        let engine = workspace.engine().unwrap();
        let created = engine
            .create("presentation", &["Launch Day"], &CreateOptions::default())
            .await
            .unwrap();

        let report = workspace
            .pipeline()
            .format_collection(
                &engine,
                "presentation",
                created.id(),
                &FormatRequest {
                    formats: vec!["html".to_string()],
                    processors: None,
                },
            )
            .await
            .unwrap();
        assert!(report.all_succeeded());

        let output = fixture
            .project
            .join("presentation/draft/launch_day_20250730/formatted/launch_day_20250730.html");
        // The workflow's default emoji processor ran before conversion
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "# Launch Day 🚀\n");

        let unsupported = workspace
            .pipeline()
            .format_collection(
                &engine,
                "presentation",
                created.id(),
                &FormatRequest {
                    formats: vec!["docx".to_string()],
                    processors: Some(Vec::new()),
                },
            )
            .await
            .unwrap();
        assert!(!unsupported.all_succeeded());
    }

    #[tokio::test]
    async fn test_missing_converter_fails_detection() {
        let fixture = install(FROZEN);
        init(&fixture, None).await;
        let overrides = ConfigOverrides::new()
            .set_pair("system.converter.pandoc_path=docflow-no-such-pandoc")
            .unwrap();
        let workspace = open(&fixture, &fixture.project, overrides).await;
        let engine = workspace.engine().unwrap();
        let created = engine
            .create("job", &["Acme", "Dev"], &CreateOptions::default())
            .await
            .unwrap();

        let result = workspace
            .pipeline()
            .format_collection(&engine, "job", created.id(), &FormatRequest::default())
            .await;
        assert!(matches!(result, Err(EngineError::ExternalTool(_))));
    }
}
