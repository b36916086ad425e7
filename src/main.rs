//! CLI entry point for `ap-explain`.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use ap_explain::config;
use ap_explain::rewriter::sql_rewriter::SqlRewriter;
use ap_explain::semiring::descriptor::ProvenancePrimitives;
use ap_explain::semiring::registry::{SemiringRegistry, SemiringSelection};

#[derive(Parser)]
#[command(
    name = "ap-explain",
    about = "Annotate PostgreSQL tables for provenance and explain query results"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Semiring to use (repeatable); defaults to every configured semiring
    #[arg(long = "semiring", global = true)]
    semiring: Vec<String>,

    /// JSON file overriding or extending the built-in semirings
    #[arg(long, global = true)]
    semirings: Option<PathBuf>,

    /// Extra aggregate function (user-defined or extension) to recognise (repeatable)
    #[arg(long = "aggregate", global = true)]
    aggregate: Vec<String>,

    /// Print verbose diagnostics
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
#[cfg_attr(not(feature = "db"), allow(dead_code))]
enum Command {
    /// Print the provenance-augmented form of a query without touching a database
    Rewrite {
        /// SQL SELECT statement
        query: String,
    },
    /// Enable provenance tracking and create semiring mappings on tables
    Annotate {
        /// Connection URL (repeatable; primary first, then fallbacks)
        #[arg(long = "db-url", required = true)]
        db_url: Vec<String>,
        /// Schema of tables given without one
        #[arg(long, default_value = "public")]
        schema: String,
        /// Tables, optionally schema-qualified
        #[arg(required = true)]
        tables: Vec<String>,
    },
    /// Explain the query of an Analytical-Pattern JSON file
    Explain {
        /// AP graph file
        ap: PathBuf,
        /// Connection URL overriding the AP's contentUrl (repeatable)
        #[arg(long = "db-url")]
        db_url: Vec<String>,
        /// Leave annotations in place after explaining
        #[arg(long)]
        keep_annotations: bool,
    },
    /// Remove semiring mappings, and tracking once no mapping remains
    Remove {
        /// Connection URL (repeatable; primary first, then fallbacks)
        #[arg(long = "db-url", required = true)]
        db_url: Vec<String>,
        /// Schema of tables given without one
        #[arg(long, default_value = "public")]
        schema: String,
        /// Tables, optionally schema-qualified
        #[arg(required = true)]
        tables: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let registry = match config::load_registry(cli.semirings.as_deref()) {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("{e}");
            process::exit(2);
        }
    };
    let selection = SemiringSelection::from_names(&cli.semiring);
    let primitives = ProvenancePrimitives {
        extra_aggregates: cli.aggregate,
        ..ProvenancePrimitives::default()
    };
    if let Err(e) = primitives.validate() {
        eprintln!("{e}");
        process::exit(2);
    }

    let code = match cli.command {
        Command::Rewrite { query } => rewrite(&registry, &selection, &primitives, &query),
        command => run_with_database(command, registry, selection, primitives).await,
    };
    process::exit(code);
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Rewrite under every selected semiring; exits 1 when any semiring cannot handle the query.
fn rewrite(
    registry: &SemiringRegistry,
    selection: &SemiringSelection,
    primitives: &ProvenancePrimitives,
    query: &str,
) -> i32 {
    let semirings = match registry.select(selection) {
        Ok(semirings) => semirings,
        Err(e) => {
            eprintln!("{e}");
            return 2;
        }
    };

    let rewriter = SqlRewriter::new(primitives.clone());
    let mut output = Map::new();
    let mut failed = false;
    for semiring in semirings {
        let entry = match rewriter.rewrite(query, semiring) {
            Ok(rewritten) => json!(rewritten),
            Err(e) => {
                warn!(semiring = %semiring.name, error = %e, "Rewrite failed");
                failed = true;
                json!({ "error": e.to_string() })
            }
        };
        output.insert(semiring.name.clone(), entry);
    }

    let code = print_json(&Value::Object(output));
    if code == 0 && failed {
        1
    } else {
        code
    }
}

fn print_json<T: Serialize>(value: &T) -> i32 {
    match serde_json::to_string_pretty(value) {
        Ok(text) => {
            println!("{text}");
            0
        }
        Err(e) => {
            eprintln!("Error serializing output: {e}");
            2
        }
    }
}

#[cfg(feature = "db")]
async fn run_with_database(
    command: Command,
    registry: SemiringRegistry,
    selection: SemiringSelection,
    primitives: ProvenancePrimitives,
) -> i32 {
    use std::sync::Arc;

    use ap_explain::ap::ApGraph;
    use ap_explain::config::ServiceConfig;
    use ap_explain::error::Result;
    use ap_explain::orchestrator::gateway::TableRef;
    use ap_explain::orchestrator::service::ProvenanceService;
    use ap_explain::postgres::PgGateway;
    use ap_explain::rewriter::names::split_schema_and_relation;

    fn table_refs(schema: &str, tables: &[String]) -> Vec<TableRef> {
        tables
            .iter()
            .map(|name| match split_schema_and_relation(name) {
                Some((schema, table)) => TableRef::new(schema, table),
                None => TableRef::new(schema, name.as_str()),
            })
            .collect()
    }

    fn connect(registry: SemiringRegistry, config: ServiceConfig, targets: &[String]) -> Result<ProvenanceService> {
        config.validate()?;
        let gateway = PgGateway::connect(targets)?;
        Ok(ProvenanceService::new(
            Arc::new(gateway),
            Arc::new(registry),
            config,
        ))
    }

    fn report<T: Serialize>(outcome: Result<T>) -> i32 {
        match outcome {
            Ok(value) => print_json(&value),
            Err(e) => {
                tracing::error!(error = %e, "Command failed");
                eprintln!("{e}");
                match e.explanation() {
                    Some(explanation) => print_json(explanation).max(1),
                    None => 2,
                }
            }
        }
    }

    match command {
        Command::Rewrite { .. } => 2,
        Command::Annotate {
            db_url,
            schema,
            tables,
        } => {
            let config = ServiceConfig {
                connection_targets: db_url.clone(),
                primitives: primitives.clone(),
                ..ServiceConfig::default()
            };
            let outcome = match connect(registry, config, &db_url) {
                Ok(service) => service.annotate(&table_refs(&schema, &tables), &selection).await,
                Err(e) => Err(e),
            };
            report(outcome)
        }
        Command::Remove {
            db_url,
            schema,
            tables,
        } => {
            let config = ServiceConfig {
                connection_targets: db_url.clone(),
                primitives: primitives.clone(),
                ..ServiceConfig::default()
            };
            let outcome = match connect(registry, config, &db_url) {
                Ok(service) => service.remove(&table_refs(&schema, &tables), &selection).await,
                Err(e) => Err(e),
            };
            report(outcome)
        }
        Command::Explain {
            ap,
            db_url,
            keep_annotations,
        } => {
            let json = match std::fs::read_to_string(&ap) {
                Ok(json) => json,
                Err(e) => {
                    eprintln!("Error reading {}: {e}", ap.display());
                    return 2;
                }
            };
            let resolved = match ApGraph::from_json(&json).and_then(|graph| graph.resolve()) {
                Ok(resolved) => resolved,
                Err(e) => {
                    eprintln!("{e}");
                    return 2;
                }
            };
            let config = ServiceConfig {
                cleanup_after_explain: !keep_annotations,
                connection_targets: db_url,
                primitives,
                ..ServiceConfig::default()
            };
            let targets = config.targets_for(&resolved.connection_target);
            let outcome = match connect(registry, config, &targets) {
                Ok(service) => service.explain_resolved(&resolved, &selection).await,
                Err(e) => Err(e),
            };
            report(outcome)
        }
    }
}

#[cfg(not(feature = "db"))]
async fn run_with_database(
    command: Command,
    _registry: SemiringRegistry,
    _selection: SemiringSelection,
    _primitives: ProvenancePrimitives,
) -> i32 {
    let name = match command {
        Command::Rewrite { .. } => "rewrite",
        Command::Annotate { .. } => "annotate",
        Command::Explain { .. } => "explain",
        Command::Remove { .. } => "remove",
    };
    eprintln!("`{name}` needs a database connection; rebuild with `--features db`");
    2
}
