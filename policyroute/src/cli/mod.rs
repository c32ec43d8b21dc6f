use crate::config::{spawn_refresh, LoadedConfig};
use crate::dispatch::{Action, ConnTarget, Decision, Engine};
use crate::external::init_tracing;
use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueHint};
use colored::Colorize;
use policyapi::{to_pretty_json, CheckReportSchema, GroupSchema};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tabular::{Row, Table};
use tokio::io::AsyncBufReadExt;
use tokio::task::JoinHandle;

#[derive(Debug, Parser)]
#[command(name = "policyroute", about = "Classify connections against a Clash-style profile")]
pub struct ProgramArgs {
    /// Path of configuration
    #[arg(short, long, global = true, default_value = "config.yml", value_hint = ValueHint::FilePath)]
    pub config: PathBuf,
    /// Path of persisted selections. Default to state.yml beside the configuration
    #[arg(short, long, global = true, value_hint = ValueHint::FilePath)]
    pub state: Option<PathBuf>,
    #[command(subcommand)]
    pub cmd: SubCommand,
}

#[derive(Debug, Args)]
pub struct ClassifyOptions {
    /// host, host:port, ip, ip:port or [v6]:port
    #[clap(value_hint = ValueHint::Other)]
    pub targets: Vec<String>,
    /// Process that opened the connections
    #[arg(short, long)]
    pub process: Option<String>,
    #[arg(long)]
    pub json: bool,
    /// Read targets from stdin, one per line; a `!reload` line reloads the configuration
    #[arg(long)]
    pub stdin: bool,
}

#[derive(Debug, Subcommand)]
pub enum SubCommand {
    /// Load and build the configuration, then report what was built
    Check {
        #[arg(long)]
        json: bool,
    },
    /// Show how connections would be routed
    Classify(ClassifyOptions),
    /// List all groups
    Groups {
        #[arg(long)]
        json: bool,
    },
    /// Set group's member and persist it
    Select {
        #[clap(value_hint = ValueHint::Other)]
        group: String,
        #[clap(value_hint = ValueHint::Other)]
        member: String,
    },
}

pub async fn run(args: ProgramArgs) -> Result<()> {
    let mut loaded = LoadedConfig::read(&args.config, args.state.as_deref())
        .map_err(|e| anyhow!("Load {} failed: {}", args.config.to_string_lossy(), e))?;
    if let Err(e) = init_tracing(&loaded.config.log_level) {
        eprintln!("Failed to initialize logs: {}", e);
    }
    let engine = open_engine(&mut loaded).await?;
    match args.cmd {
        SubCommand::Check { json } => check(&engine, json),
        SubCommand::Classify(opt) => {
            if opt.stdin {
                classify_stream(&engine, loaded, &args.config, args.state.as_deref(), &opt).await
            } else {
                for t in &opt.targets {
                    classify_one(&engine, t, &opt)?;
                }
                Ok(())
            }
        }
        SubCommand::Groups { json } => {
            let groups = engine.groups();
            if json {
                println!("{}", to_pretty_json(&groups)?);
            } else {
                print_groups(groups);
            }
            Ok(())
        }
        SubCommand::Select { group, member } => select(&engine, &group, &member),
    }
}

async fn open_engine(loaded: &mut LoadedConfig) -> Result<Arc<Engine>> {
    loaded.fetch_rule_sources(false).await?;
    let engine = Engine::new(loaded.profile()?, Arc::new(loaded.health_tracker()))
        .map_err(|e| anyhow!("Build {} failed: {}", loaded.config_dir.to_string_lossy(), e))?
        .with_verbose(loaded.config.verbose)
        .with_state(loaded.state.clone());
    Ok(Arc::new(engine))
}

fn select(engine: &Engine, group: &str, member: &str) -> Result<()> {
    match engine.select_member(group, member) {
        Ok(()) => {
            println!("{}", "Success".green());
            Ok(())
        }
        Err(e) => {
            println!("{}", "Failed".red());
            Err(anyhow!("{}", e))
        }
    }
}

fn check(engine: &Engine, json: bool) -> Result<()> {
    let dispatching = engine.dispatching();
    let report = CheckReportSchema {
        nodes: engine.nodes().len(),
        groups: dispatching.registry().len(),
        rules: dispatching.table().len(),
        rule_sets: engine.rule_sets(),
        warnings: dispatching.warnings().to_vec(),
    };
    if json {
        println!("{}", to_pretty_json(&report)?);
        return Ok(());
    }
    println!(
        "{} {} nodes, {} groups, {} rules",
        "OK".green(),
        report.nodes,
        report.groups,
        report.rules
    );
    if !report.rule_sets.is_empty() {
        let mut table = Table::new("{:<} {:>} {:>} {:<}");
        table.add_row(
            Row::new()
                .with_cell("Rule set")
                .with_cell("Version")
                .with_cell("Patterns")
                .with_cell("Loaded"),
        );
        for rs in report.rule_sets {
            table.add_row(
                Row::new()
                    .with_cell(rs.name)
                    .with_cell(rs.version)
                    .with_cell(rs.patterns)
                    .with_cell(rs.loaded_at),
            );
        }
        print!("{}", table);
    }
    for w in report.warnings {
        println!("{} {}", "warning:".yellow(), w);
    }
    Ok(())
}

fn classify_one(engine: &Engine, target: &str, opt: &ClassifyOptions) -> Result<()> {
    let mut target = ConnTarget::from_str(target)?;
    if let Some(p) = &opt.process {
        target = target.with_process(p.as_str());
    }
    let decision = engine.decide(&target);
    if opt.json {
        let schema = decision.to_schema(&target);
        // one object per line when streaming
        if opt.stdin {
            println!("{}", serde_json::to_string(&schema)?);
        } else {
            println!("{}", to_pretty_json(&schema)?);
        }
    } else {
        print_decision(&target, &decision);
    }
    Ok(())
}

fn print_decision(target: &ConnTarget, decision: &Decision) {
    let action = match &decision.action {
        Action::Direct => "DIRECT".cyan(),
        Action::Reject => "REJECT".red(),
        Action::Dial(node) => format!("{} ({})", node.name(), node.endpoint()).green(),
    };
    let chain = if decision.chain.is_empty() {
        decision.group.clone()
    } else {
        decision.chain.join(" -> ")
    };
    println!(
        "{} => {} via {} [{}]{}",
        target.to_string().bold(),
        action,
        chain,
        decision.rule,
        if decision.fallback {
            " (fallback)".yellow().to_string()
        } else {
            String::new()
        }
    );
}

/// Long-running mode: the engine keeps its refresh tasks alive while
/// targets arrive on stdin.
async fn classify_stream(
    engine: &Arc<Engine>,
    loaded: LoadedConfig,
    config: &Path,
    state: Option<&Path>,
    opt: &ClassifyOptions,
) -> Result<()> {
    let mut refresh = spawn_refresh(
        engine,
        loaded.config_dir.clone(),
        &loaded.config.rule_providers,
    );
    for t in &opt.targets {
        classify_one(engine, t, opt)?;
    }
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "!reload" {
            match reload(engine, config, state).await {
                Ok(new) => {
                    abort_all(&mut refresh);
                    refresh =
                        spawn_refresh(engine, new.config_dir.clone(), &new.config.rule_providers);
                    println!("{}", "Reloaded".green());
                }
                Err(e) => println!("{} {}", "Reload failed:".red(), e),
            }
            continue;
        }
        if let Err(e) = classify_one(engine, line, opt) {
            println!("{} {}", "error:".red(), e);
        }
    }
    abort_all(&mut refresh);
    Ok(())
}

async fn reload(engine: &Engine, config: &Path, state: Option<&Path>) -> Result<LoadedConfig> {
    let loaded = LoadedConfig::load(config, state).await?;
    engine.reload(loaded.profile()?)?;
    Ok(loaded)
}

fn abort_all(tasks: &mut Vec<JoinHandle<()>>) {
    for t in tasks.drain(..) {
        t.abort();
    }
}

fn print_groups(groups: Vec<GroupSchema>) {
    for g in groups {
        println!(
            "{} ({}): {}",
            g.name.bold().green(),
            g.strategy,
            g.selected.unwrap_or_else(|| "-".to_string()).blue()
        );
        let mut table = Table::new("  - {:<} {:<} {:>}");
        for m in g.members {
            table.add_row(
                Row::new()
                    .with_cell(m.name)
                    .with_cell(m.kind)
                    .with_cell(m.latency.unwrap_or_default()),
            );
        }
        print!("{}", table);
    }
}
