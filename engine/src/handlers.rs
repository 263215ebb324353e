//! Command handlers for CLI operations
//!
//! Each handler runs one command against an opened [`Workspace`] and prints
//! its result as text or JSON. Engine errors crossing into the CLI go
//! through [`boundary`], which logs the full error and keeps only what
//! [`public_message`] allows.

use anyhow::{anyhow, Context, Result};
use sdk::errors::{public_message, EngineError};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::conversion::FormatRequest;
use crate::project::{init_project, InitOptions, Workspace};
use crate::storage::FsStorage;
use crate::workflow::{Collection, CreateOptions};

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Convert an engine error into one safe to show the user
pub fn boundary(error: EngineError) -> anyhow::Error {
    tracing::debug!("Command failed: {:?}", error);
    anyhow!(public_message(&error))
}

fn collection_json(collection: &Collection) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(&collection.metadata)
        .context("Failed to serialize collection metadata")?;
    if let Some(map) = value.as_object_mut() {
        map.insert("stage".to_string(), json!(collection.stage));
        map.insert("path".to_string(), json!(collection.path));
    }
    Ok(value)
}

/// Parse repeated `key=value` arguments
pub fn parse_fields(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("Expected KEY=VALUE, got '{}'", pair))?;
            let key = key.trim();
            if key.is_empty() {
                return Err(anyhow!("Empty field name in '{}'", pair));
            }
            Ok((key.to_string(), value.to_string()))
        })
        .collect()
}

/// Initialize a project at `target`
pub async fn handle_init(
    workspace: &Workspace,
    target: &Path,
    workflows: Option<Vec<String>>,
    force: bool,
    format: OutputFormat,
) -> Result<()> {
    let report = init_project(
        Arc::new(FsStorage::new()),
        target,
        &workspace.system_root,
        &InitOptions { workflows, force },
    )
    .await
    .map_err(boundary)?;

    match format {
        OutputFormat::Text => {
            println!("Initialized docflow project in {}", report.project_root.display());
            println!("  Config: {}", report.config_path.display());
            println!("  Workflows: {}", report.workflows.join(", "));
        }
        OutputFormat::Json => {
            let output = json!({
                "project_root": report.project_root,
                "config": report.config_path,
                "config_from_template": report.config_from_template,
                "workflows": report.workflows,
                "stage_dirs": report.stage_dirs,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Create a collection
pub async fn handle_create(
    workspace: &Workspace,
    workflow: &str,
    values: &[&str],
    options: CreateOptions,
    format: OutputFormat,
) -> Result<()> {
    let engine = workspace.engine().map_err(boundary)?;
    let collection = engine
        .create(workflow, values, &options)
        .await
        .map_err(boundary)?;

    match format {
        OutputFormat::Text => {
            println!("Created {}/{}", workflow, collection.id());
            println!("  Stage: {}", collection.stage);
            if let Some(error) = collection.metadata.field_str("download_error") {
                println!("  Download failed: {}", error);
            }
        }
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&collection_json(&collection)?)?
            );
        }
    }

    Ok(())
}

/// List a workflow's collections grouped by stage
pub async fn handle_list(workspace: &Workspace, workflow: &str, format: OutputFormat) -> Result<()> {
    let engine = workspace.engine().map_err(boundary)?;
    let def = engine.workflow(workflow).await.map_err(boundary)?;
    let listing = engine.get_collections(workflow).await.map_err(boundary)?;

    match format {
        OutputFormat::Text => {
            if listing.collections.is_empty() {
                println!("No collections in workflow '{}'", def.name);
            }
            for stage in def.stage_names() {
                let in_stage: Vec<_> = listing
                    .collections
                    .iter()
                    .filter(|c| c.stage == stage)
                    .collect();
                if in_stage.is_empty() {
                    continue;
                }
                println!("{} ({}):", stage, in_stage.len());
                for collection in in_stage {
                    println!(
                        "  {}  (modified {})",
                        collection.id(),
                        collection.metadata.date_modified.format("%Y-%m-%d")
                    );
                }
            }
            for failure in &listing.failures {
                println!(
                    "Unreadable: {} ({})",
                    failure.path.display(),
                    public_message(&failure.error)
                );
            }
        }
        OutputFormat::Json => {
            let collections = listing
                .collections
                .iter()
                .map(collection_json)
                .collect::<Result<Vec<_>>>()?;
            let failures: Vec<_> = listing
                .failures
                .iter()
                .map(|f| json!({ "path": f.path, "error": public_message(&f.error) }))
                .collect();
            let output = json!({
                "workflow": def.name,
                "collections": collections,
                "count": listing.collections.len(),
                "failures": failures,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Move a collection to another stage
pub async fn handle_advance(
    workspace: &Workspace,
    workflow: &str,
    id: &str,
    stage: &str,
    force: bool,
    format: OutputFormat,
) -> Result<()> {
    let engine = workspace.engine().map_err(boundary)?;
    let collection = engine
        .advance(workflow, id, stage, force)
        .await
        .map_err(boundary)?;

    match format {
        OutputFormat::Text => println!("{}/{} is now '{}'", workflow, id, collection.stage),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&collection_json(&collection)?)?
        ),
    }

    Ok(())
}

/// Set extension fields of a collection
pub async fn handle_update(
    workspace: &Workspace,
    workflow: &str,
    id: &str,
    fields: &[String],
    format: OutputFormat,
) -> Result<()> {
    let fields = parse_fields(fields)?;
    let engine = workspace.engine().map_err(boundary)?;
    let collection = engine
        .update_fields(workflow, id, &fields)
        .await
        .map_err(boundary)?;

    match format {
        OutputFormat::Text => {
            println!("Updated {}/{}", workflow, id);
            for (key, value) in &fields {
                println!("  {}: {}", key, value);
            }
        }
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&collection_json(&collection)?)?
        ),
    }

    Ok(())
}

/// Delete a collection; refuses without `--yes`
pub async fn handle_delete(
    workspace: &Workspace,
    workflow: &str,
    id: &str,
    confirmed: bool,
    format: OutputFormat,
) -> Result<()> {
    if !confirmed {
        return Err(anyhow!(
            "Refusing to delete {}/{} without --yes",
            workflow,
            id
        ));
    }
    let engine = workspace.engine().map_err(boundary)?;
    engine.delete(workflow, id).await.map_err(boundary)?;

    match format {
        OutputFormat::Text => println!("Deleted {}/{}", workflow, id),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "deleted": id, "workflow": workflow }))?
        ),
    }

    Ok(())
}

/// Convert a collection's main document
///
/// Fails when any requested format failed, after reporting all of them.
pub async fn handle_format(
    workspace: &Workspace,
    workflow: &str,
    id: &str,
    request: FormatRequest,
    format: OutputFormat,
) -> Result<()> {
    let engine = workspace.engine().map_err(boundary)?;
    let pipeline = workspace.pipeline();
    let report = pipeline
        .format_collection(&engine, workflow, id, &request)
        .await
        .map_err(boundary)?;

    match format {
        OutputFormat::Text => {
            for outcome in &report.outcomes {
                match &outcome.result {
                    Ok(result) => {
                        for output in &result.outputs {
                            println!("{}: {}", outcome.format, output.display());
                        }
                        if let Some(backup) = &result.backup {
                            println!("  previous version kept at {}", backup.display());
                        }
                    }
                    Err(e) => println!("{}: failed ({})", outcome.format, public_message(e)),
                }
            }
        }
        OutputFormat::Json => {
            let outcomes: Vec<_> = report
                .outcomes
                .iter()
                .map(|o| match &o.result {
                    Ok(result) => json!({
                        "format": o.format,
                        "ok": true,
                        "outputs": result.outputs,
                        "artifacts": result.artifacts,
                        "retained": result.retained,
                        "backup": result.backup,
                    }),
                    Err(e) => json!({
                        "format": o.format,
                        "ok": false,
                        "error": public_message(e),
                    }),
                })
                .collect();
            let output = json!({
                "collection_id": report.collection_id,
                "outcomes": outcomes,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    if !report.all_succeeded() {
        return Err(anyhow!("Some formats could not be produced"));
    }
    Ok(())
}

/// List visible workflows and the layer each comes from
pub async fn handle_workflows(workspace: &Workspace, format: OutputFormat) -> Result<()> {
    let manifest = workspace.env.manifest().await.map_err(boundary)?;

    match format {
        OutputFormat::Text => {
            if manifest.is_empty() {
                println!("No workflows installed");
                return Ok(());
            }
            for name in manifest.names() {
                let origin = manifest
                    .get(name)
                    .map(|o| format!("{:?}", o).to_lowercase())
                    .unwrap_or_default();
                println!("{:<20} {}", name, origin);
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "workflows": manifest,
                "count": manifest.len(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Print the resolved configuration
pub fn handle_config_show(workspace: &Workspace, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => {
            let text = toml::to_string_pretty(workspace.config.as_ref())
                .context("Failed to render configuration")?;
            println!("# system root: {}", workspace.system_root.display());
            if let Some(project) = &workspace.project_root {
                println!("# project root: {}", project.display());
            }
            println!("{}", text);
        }
        OutputFormat::Json => {
            let output = json!({
                "system_root": workspace.system_root,
                "project_root": workspace.project_root,
                "config": workspace.config.as_ref(),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}
