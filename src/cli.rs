//! CLI module
//!
//! This module provides the command-line interface over a JSON record file.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use colored::Colorize;
use serde_json::json;
use std::io;
use std::path::PathBuf;

use crate::{
    config::EngineConfig,
    engine::{MoveCommand, RenameCommand, Session, ToggleCommand},
    expansion::BatchReport,
    flatten::{flatten_rows, public_only},
    models::{ProjectId, RollupStats, TreeNode},
    stats::summarize,
    store::JsonFileStore,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON file holding the project records
    #[arg(short, long, env = "HIERARCHY_RECORDS", default_value = "projects.json")]
    records: PathBuf,

    /// JSON engine config file
    #[arg(short, long, env = "HIERARCHY_CONFIG")]
    config: Option<PathBuf>,

    /// Deepest level a move may produce (overrides the config file)
    #[arg(long, env = "HIERARCHY_MAX_DEPTH")]
    max_depth: Option<u32>,

    /// Log engine transitions at debug level
    #[arg(short, long)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    log_level: tracing::Level,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the project tree
    Tree {
        /// Ignore collapsed projects and print everything
        #[arg(short, long)]
        all: bool,

        /// Only show public projects
        #[arg(long)]
        public_only: bool,

        /// Start from this project instead of the roots
        #[arg(long)]
        from: Option<ProjectId>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Show rolled-up task statistics
    Stats {
        /// Projects to report on (defaults to the whole forest)
        ids: Vec<ProjectId>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Report build warnings and verify tree consistency
    Check,

    /// Check whether a move would be allowed without applying it
    #[command(name = "check-move")]
    CheckMove {
        /// Project to move
        id: ProjectId,

        /// New parent; omit to move to the top level
        #[arg(short, long)]
        parent: Option<ProjectId>,
    },

    /// Move a project under a new parent
    Move {
        /// Project to move
        id: ProjectId,

        /// New parent; omit to move to the top level
        #[arg(short, long)]
        parent: Option<ProjectId>,
    },

    /// Rename a project
    Rename {
        /// Project to rename
        id: ProjectId,

        /// New name
        name: String,
    },

    /// Flip a project between expanded and collapsed
    Toggle {
        /// Project to toggle
        id: ProjectId,
    },

    /// Expand every project
    #[command(name = "expand-all")]
    ExpandAll {
        /// Only touch public projects
        #[arg(long)]
        public_only: bool,
    },

    /// Collapse every project
    #[command(name = "collapse-all")]
    CollapseAll {
        /// Only touch public projects
        #[arg(long)]
        public_only: bool,
    },

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Run the CLI application
pub fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        generate(*shell, &mut cmd, name, &mut io::stdout());
        return Ok(());
    }

    init_tracing(&cli);

    let config = load_config(&cli)?;
    let mut store = JsonFileStore::new(&cli.records);
    let mut session = Session::load(&store, config)?;
    for warning in session.warnings() {
        tracing::warn!(warning = %warning, "build warning");
    }

    match &cli.command {
        Commands::Tree {
            all,
            public_only: only_public,
            from,
            json,
        } => {
            let roots = match from {
                Some(id) => vec![session.tree().node_id(*id)?],
                None => session.tree().roots().to_vec(),
            };
            let filter: Option<&dyn Fn(&TreeNode) -> bool> = if *only_public {
                Some(&public_only)
            } else {
                None
            };
            let rows = flatten_rows(&roots, session.tree(), !*all, filter);

            if *json {
                let nodes: Vec<_> = rows
                    .iter()
                    .filter_map(|row| session.tree().get(row.node))
                    .map(|node| {
                        json!({
                            "id": node.id(),
                            "parent_id": node.parent_id(),
                            "name": node.name(),
                            "depth": node.depth(),
                            "path": node.path(),
                            "expanded": node.is_expanded(),
                            "public": node.is_public(),
                            "stats": node.stats(),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&nodes)?);
            } else if rows.is_empty() {
                println!("No projects yet. Add some to {}", cli.records.display());
            } else {
                for row in &rows {
                    if let Some(node) = session.tree().get(row.node) {
                        print_node(node, row.indent as usize);
                    }
                }
            }
            Ok(())
        }

        Commands::Stats { ids, json } => {
            let report: Vec<(String, RollupStats)> = if ids.is_empty() {
                vec![(
                    "All projects".to_string(),
                    summarize(session.tree(), session.tree().roots()),
                )]
            } else {
                let stats = session.stats_for(ids);
                let mut report = Vec::with_capacity(ids.len());
                for id in ids {
                    let node = session.node(*id)?;
                    if let Some(s) = stats.get(id) {
                        report.push((node.path().to_string(), *s));
                    }
                }
                report
            };

            if *json {
                let entries: Vec<_> = report
                    .iter()
                    .map(|(label, stats)| json!({ "project": label, "stats": stats }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                for (label, stats) in &report {
                    print_stats(label, stats);
                }
            }
            Ok(())
        }

        Commands::Check => {
            let warnings = session.warnings();
            if warnings.is_empty() {
                println!("{} {} projects, no warnings", "✓".green(), session.tree().len());
            } else {
                println!("{} build warnings:", warnings.len().to_string().yellow().bold());
                for warning in warnings {
                    println!("  • {}", warning);
                }
            }

            let problems = session.tree().check_invariants();
            if problems.is_empty() {
                return Ok(());
            }
            println!("{}", "Tree is inconsistent:".red().bold());
            for problem in &problems {
                println!("  • {}", problem);
            }
            Err(format!("{} consistency problems", problems.len()).into())
        }

        Commands::CheckMove { id, parent } => {
            let command = MoveCommand {
                node: *id,
                new_parent: *parent,
                max_depth: None,
            };
            match session.preview_move(&command) {
                Ok(()) => {
                    println!("{} project {} can move {}", "✓".green(), id, describe_parent(*parent));
                    Ok(())
                }
                Err(err) => {
                    println!("{} {}", "✗".red(), err);
                    Err(err.into())
                }
            }
        }

        Commands::Move { id, parent } => {
            let command = MoveCommand {
                node: *id,
                new_parent: *parent,
                max_depth: None,
            };
            session.move_node(&command, &mut store)?;
            let node = session.node(*id)?;
            println!("Moved project {} to {}", id, node.path().bold());
            Ok(())
        }

        Commands::Rename { id, name } => {
            let command = RenameCommand {
                node: *id,
                name: name.clone(),
            };
            session.rename(&command, &mut store)?;
            let node = session.node(*id)?;
            println!("Renamed project {} to {}", id, node.path().bold());
            Ok(())
        }

        Commands::Toggle { id } => {
            let change = session.toggle(&ToggleCommand { node: *id }, &mut store)?;
            let state = if change.to.is_expanded() {
                "expanded"
            } else {
                "collapsed"
            };
            println!("Project {} is now {}", id, state);
            Ok(())
        }

        Commands::ExpandAll {
            public_only: only_public,
        } => {
            let filter: Option<&dyn Fn(&TreeNode) -> bool> = if *only_public {
                Some(&public_only)
            } else {
                None
            };
            let report = session.expand_all(filter, &mut store);
            print_batch_report("Expanded", &report)
        }

        Commands::CollapseAll {
            public_only: only_public,
        } => {
            let filter: Option<&dyn Fn(&TreeNode) -> bool> = if *only_public {
                Some(&public_only)
            } else {
                None
            };
            let report = session.collapse_all(filter, &mut store);
            print_batch_report("Collapsed", &report)
        }

        Commands::Completions { .. } => Ok(()),
    }
}

fn init_tracing(cli: &Cli) {
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        cli.log_level
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };
    if let Some(max_depth) = cli.max_depth {
        config = config.with_max_depth(max_depth);
    }
    tracing::debug!(config = ?config, "loaded engine config");
    Ok(config)
}

fn describe_parent(parent: Option<ProjectId>) -> String {
    match parent {
        Some(id) => format!("under project {}", id),
        None => "to the top level".to_string(),
    }
}

fn print_node(node: &TreeNode, indent: usize) {
    let indent_str = "  ".repeat(indent);

    let marker = if node.children().is_empty() {
        "  "
    } else if node.is_expanded() {
        "▾ "
    } else {
        "▸ "
    };

    let stats = node.stats();
    let progress = format!("[{}/{}]", stats.total_completed, stats.total_tasks);
    let progress = if stats.total_tasks > 0 && stats.total_completed == stats.total_tasks {
        progress.green()
    } else {
        progress.dimmed()
    };

    println!(
        "{}{}{} {} {}",
        indent_str,
        marker,
        node.name(),
        progress,
        format!("#{}", node.id()).dimmed()
    );
}

fn print_stats(label: &str, stats: &RollupStats) {
    println!("{}", label.bold());
    println!(
        "  Tasks:       {} total, {} completed, {} in progress",
        stats.total_tasks, stats.total_completed, stats.total_in_progress
    );
    println!("  Direct:      {} tasks", stats.direct_tasks);
    println!("  Minutes:     {}", stats.total_minutes);
    println!("  Descendants: {}", stats.descendant_count);
    if let Some(ratio) = stats.completion_ratio() {
        println!("  Completion:  {:.0}%", ratio * 100.0);
    }
}

fn print_batch_report(verb: &str, report: &BatchReport) -> Result<(), Box<dyn std::error::Error>> {
    println!("{} {} projects", verb, report.applied.len());
    if report.is_clean() {
        return Ok(());
    }
    for (node, err) in &report.failed {
        println!("  {} {}: {}", "✗".red(), node, err);
    }
    Err(format!("{} projects could not be saved", report.failed.len()).into())
}
