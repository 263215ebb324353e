//! docflow Engine Library
//!
//! This library provides the core functionality of docflow: layered
//! environments, configuration discovery, the collection lifecycle engine
//! and the conversion pipeline. It is used by both the main binary and
//! integration tests.

/// Storage adapters (filesystem and in-memory)
pub mod storage;

/// Workflow, config and collection sources
pub mod environment;

/// Configuration discovery and merging
pub mod config;

/// Resource-bounded execution of futures and subprocesses
pub mod executor;

/// Collection lifecycle engine
pub mod workflow;

/// Document conversion pipeline
pub mod conversion;

/// Web page download for new collections
pub mod scraper;

/// Optional git auto-commit
pub mod git;

/// Project bootstrap and initialization
pub mod project;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;
