//! CLI interface for docflow
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags for managing document collections.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// docflow document workflow manager
///
/// Keeps versioned collections of documents (job applications, blog posts,
/// slide decks) moving through the stages of a workflow, and converts them
/// into shareable formats.
#[derive(Parser, Debug)]
#[command(name = "docflow")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Run as if started in this directory
    #[arg(long, global = true, value_name = "PATH")]
    pub cwd: Option<PathBuf>,

    /// Use this installation instead of searching for one
    #[arg(long, global = true, value_name = "PATH")]
    pub system_root: Option<PathBuf>,

    /// Override a config value for this run (repeatable)
    #[arg(long = "set", global = true, value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Initialize a project in the current directory
    Init {
        /// Only prepare these workflows (comma separated)
        #[arg(long, value_delimiter = ',')]
        workflows: Option<Vec<String>>,

        /// Rewrite the config of an existing project
        #[arg(long)]
        force: bool,
    },

    /// Create a new collection
    Create {
        /// Workflow name (e.g. job, blog)
        workflow: String,

        /// First identifying value (company, title, ...)
        primary: String,

        /// Second identifying value, when the workflow has one
        secondary: Option<String>,

        /// Download this page into the collection
        #[arg(long)]
        url: Option<String>,

        /// Use a template variant (e.g. a shorter cover letter)
        #[arg(long, value_name = "VARIANT")]
        template_variant: Option<String>,
    },

    /// List the collections of a workflow
    List {
        workflow: String,
    },

    /// Move a collection to another stage
    Advance {
        workflow: String,
        collection_id: String,
        stage: String,

        /// Allow moving back to an earlier stage
        #[arg(long)]
        force: bool,
    },

    /// Set extension fields in a collection's metadata
    Update {
        workflow: String,
        collection_id: String,

        /// Field to set (repeatable)
        #[arg(long = "field", value_name = "KEY=VALUE", required = true)]
        fields: Vec<String>,
    },

    /// Delete a collection and all of its files
    Delete {
        workflow: String,
        collection_id: String,

        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },

    /// Convert a collection's main document
    Format {
        workflow: String,
        collection_id: String,

        /// Output format (repeatable; default from config)
        #[arg(long = "format", value_name = "FORMAT")]
        formats: Vec<String>,

        /// Processor to run before converting (repeatable)
        #[arg(long = "processor", value_name = "NAME", conflicts_with = "no_processors")]
        processors: Vec<String>,

        /// Run no processors at all
        #[arg(long)]
        no_processors: bool,
    },

    /// List the workflows visible from here
    Workflows,

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the fully resolved configuration
    Show,
}

impl Command {
    /// Processor selection requested by `format`, if any
    pub fn processor_override(processors: &[String], no_processors: bool) -> Option<Vec<String>> {
        if no_processors {
            Some(Vec::new())
        } else if processors.is_empty() {
            None
        } else {
            Some(processors.to_vec())
        }
    }
}
