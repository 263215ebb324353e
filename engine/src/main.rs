// docflow
// Main entry point for the docflow binary

use anyhow::Context;
use clap::Parser;
use docflow_engine::cli::{Cli, Command, ConfigAction};
use docflow_engine::config::ConfigOverrides;
use docflow_engine::conversion::FormatRequest;
use docflow_engine::handlers::{
    boundary, handle_advance, handle_config_show, handle_create, handle_delete, handle_format,
    handle_init, handle_list, handle_update, handle_workflows, OutputFormat,
};
use docflow_engine::project::{OpenOptions, Workspace};
use docflow_engine::telemetry::init_telemetry_with_level;
use docflow_engine::workflow::CreateOptions;
use tracing::Instrument;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // An explicit --log wins over the config, so install it before discovery
    if let Some(level) = &cli.log {
        init_telemetry_with_level(level);
    }

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    let cwd = match &cli.cwd {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Failed to read the working directory")?,
    };

    let overrides = cli
        .overrides
        .iter()
        .try_fold(ConfigOverrides::new(), |acc, pair| acc.set_pair(pair))
        .map_err(boundary)?;

    let options = OpenOptions {
        cwd: cwd.clone(),
        system_root: cli.system_root.clone(),
        overrides,
    };
    let workspace = match Workspace::open(&options).await {
        Ok(workspace) => workspace,
        Err(e) => {
            init_telemetry_with_level("warn");
            return Err(boundary(e));
        }
    };

    // Config-driven level; no-op when --log already installed a subscriber
    init_telemetry_with_level(&workspace.config.system.log_level);

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");
    tracing::debug!("docflow v{} ({} - {})", version, commit, timestamp);

    let invocation = uuid::Uuid::new_v4();
    let span = tracing::info_span!("command", id = %invocation);

    async move {
        // Everything but init and workflows works on an existing project
        if !matches!(
            cli.command,
            Command::Init { .. } | Command::Workflows | Command::Config { .. }
        ) {
            workspace.require_project(&cwd).map_err(boundary)?;
        }

        match cli.command {
            Command::Init { workflows, force } => {
                handle_init(&workspace, &cwd, workflows, force, format).await
            }

            Command::Create {
                workflow,
                primary,
                secondary,
                url,
                template_variant,
            } => {
                let mut values = vec![primary.as_str()];
                if let Some(secondary) = &secondary {
                    values.push(secondary.as_str());
                }
                let options = CreateOptions {
                    url,
                    template_variant,
                };
                handle_create(&workspace, &workflow, &values, options, format).await
            }

            Command::List { workflow } => handle_list(&workspace, &workflow, format).await,

            Command::Advance {
                workflow,
                collection_id,
                stage,
                force,
            } => handle_advance(&workspace, &workflow, &collection_id, &stage, force, format).await,

            Command::Update {
                workflow,
                collection_id,
                fields,
            } => handle_update(&workspace, &workflow, &collection_id, &fields, format).await,

            Command::Delete {
                workflow,
                collection_id,
                yes,
            } => handle_delete(&workspace, &workflow, &collection_id, yes, format).await,

            Command::Format {
                workflow,
                collection_id,
                formats,
                processors,
                no_processors,
            } => {
                let request = FormatRequest {
                    formats,
                    processors: Command::processor_override(&processors, no_processors),
                };
                handle_format(&workspace, &workflow, &collection_id, request, format).await
            }

            Command::Workflows => handle_workflows(&workspace, format).await,

            Command::Config { action } => match action {
                ConfigAction::Show => handle_config_show(&workspace, format),
            },
        }
    }
    .instrument(span)
    .await
}
