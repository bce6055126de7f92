//! Autonomous coding orchestration loop.
//!
//! Drives a planner/worker/supervisor trio of agent conversations toward a
//! single natural-language goal, persisting resumable state under a
//! per-workdir state directory. Structurally this is the teacher's
//! `runner` binary (`init`/`validate`/`select` over a task tree) pointed at
//! a richer, three-agent loop instead of a single leftmost-open-leaf
//! selector.

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use engine::core::session::SessionStatus;
use engine::io::agent_driver::{AgentDriverConfig, AgentRole, SubprocessAgentDriver};
use engine::io::config::{EngineConfig, load_config, write_config};
use engine::io::events::EventBus;
use engine::io::executor::{Drivers, PromptTemplates};
use engine::io::persistence::StatePersistence;
use engine::io::schema::write_schemas;
use engine::io::now_millis;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "engine", version, about = "Autonomous coding orchestration engine")]
struct Cli {
    /// Goal to drive the session toward. May also be given with `--goal`.
    goal: Option<String>,

    /// Equivalent to the positional goal argument.
    #[arg(long = "goal")]
    goal_flag: Option<String>,

    /// Additional sub-goals appended to the primary goal, in order.
    #[arg(long = "sub-goal")]
    sub_goals: Vec<String>,

    /// Wall-clock budget for the whole session, e.g. `30m`, `2h`, `24h`.
    #[arg(long = "time-limit", default_value = "2h")]
    time_limit: String,

    /// Project directory the agents operate in.
    #[arg(long = "directory", short = 'd', default_value = ".")]
    directory: PathBuf,

    /// Extra free-text context prepended to the planner's first prompt.
    #[arg(long)]
    context: Option<String>,

    #[arg(long, short)]
    verbose: bool,

    #[arg(long, short)]
    quiet: bool,

    /// Emit the final session summary as JSON instead of plain text.
    #[arg(long)]
    json: bool,

    /// Force retry-shaped recovery even for strategies that would
    /// otherwise skip straight to escalation.
    #[arg(long)]
    retry: bool,

    #[arg(long = "max-retries")]
    max_retries: Option<u32>,

    /// Resume the most recent resumable session for this goal, or a
    /// specific session id if one is given.
    #[arg(long, num_args = 0..=1, default_missing_value = "")]
    resume: Option<String>,

    /// List known sessions under the state directory and exit.
    #[arg(long = "list-sessions")]
    list_sessions: bool,

    /// Override the default `<directory>/.claude-runner` state directory.
    #[arg(long = "state-dir")]
    state_dir: Option<PathBuf>,

    /// Launch `engine-ui` against this session's state directory.
    #[arg(long)]
    ui: bool,

    #[arg(long = "ui-port", default_value_t = 4173)]
    ui_port: u16,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("engine=debug")
    } else if cli.quiet {
        EnvFilter::new("engine=warn")
    } else {
        EnvFilter::from_default_env().add_directive("engine=info".parse()?)
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let directory = cli.directory.canonicalize().unwrap_or(cli.directory.clone());
    let state_dir = cli.state_dir.clone().unwrap_or_else(|| directory.join(".claude-runner"));
    let persistence = StatePersistence::new(state_dir.clone(), EngineConfig::default().checkpoint_retention);
    persistence.initialize()?;
    write_schemas(&state_dir)?;

    if cli.list_sessions {
        return print_sessions(&persistence, cli.json);
    }

    let config_path = state_dir.join("config.toml");
    let mut engine_config = load_config(&config_path)?;
    if !config_path.exists() {
        write_config(&config_path, &engine_config)?;
    }
    if let Some(max_retries) = cli.max_retries {
        engine_config.max_retries = max_retries;
    }
    if cli.retry {
        engine_config.force_retry = true;
    }
    engine_config.validate()?;

    let goal = resolve_goal(&cli)?;
    let event_bus = EventBus::open(&state_dir.join("events.jsonl"))?;

    let resume_session_id = match cli.resume.as_deref() {
        Some("") => persistence
            .get_resumable_session(&goal, now_millis(), Duration::from_secs(24 * 3600))?
            .map(|s| s.session_id),
        Some(id) => Some(id.to_string()),
        None => None,
    };

    let deadline = Instant::now() + parse_time_limit(&cli.time_limit)?;
    let shutdown = Arc::new(AtomicBool::new(false));

    let mut templates = PromptTemplates::default();
    if let Some(context) = &cli.context {
        templates.worker_system_context = format!("{}\n\nAdditional context:\n{context}", templates.worker_system_context);
    }

    let mut worker_driver = SubprocessAgentDriver::new(AgentDriverConfig::for_role(AgentRole::Worker, &engine_config.agent_binary));
    let mut supervisor_driver = SubprocessAgentDriver::new(AgentDriverConfig::for_role(AgentRole::Supervisor, &engine_config.agent_binary));
    let mut planner_driver = SubprocessAgentDriver::new(AgentDriverConfig::for_role(AgentRole::Planner, &engine_config.agent_binary));
    let mut drivers = Drivers {
        worker: &mut worker_driver,
        supervisor: &mut supervisor_driver,
        planner: &mut planner_driver,
    };

    if cli.ui {
        spawn_ui(&state_dir, cli.ui_port)?;
    }

    let session = engine::run(
        &goal,
        &directory,
        &engine_config,
        &templates,
        &persistence,
        &event_bus,
        &mut drivers,
        &shutdown,
        deadline,
        resume_session_id.as_deref(),
    )?;

    if cli.json {
        let summary = serde_json::json!({
            "session_id": session.session_id,
            "status": format!("{:?}", session.status).to_lowercase(),
            "steps_completed": session.metrics.steps_completed,
            "total_turns": session.metrics.total_turns,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "session {} finished as {:?} ({} step(s) completed in {} turn(s))",
            session.session_id, session.status, session.metrics.steps_completed, session.metrics.total_turns
        );
    }

    if session.status == SessionStatus::Completed { Ok(()) } else { std::process::exit(1) }
}

fn resolve_goal(cli: &Cli) -> Result<String> {
    let primary = cli
        .goal
        .clone()
        .or_else(|| cli.goal_flag.clone())
        .ok_or_else(|| anyhow!("a goal is required unless --list-sessions is given"))?;
    if cli.sub_goals.is_empty() {
        return Ok(primary);
    }
    let mut goal = primary;
    for sub_goal in &cli.sub_goals {
        goal.push_str("; ");
        goal.push_str(sub_goal);
    }
    Ok(goal)
}

/// Parse a duration like `30m`, `2h`, or `24h`. Bare numbers are treated as
/// seconds.
fn parse_time_limit(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, ""),
    };
    let value: u64 = digits.parse().with_context(|| format!("invalid time limit {raw:?}"))?;
    let seconds = match unit {
        "" | "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86_400,
        other => bail!("unrecognized time limit unit {other:?} in {raw:?}"),
    };
    Ok(Duration::from_secs(seconds))
}

fn print_sessions(persistence: &StatePersistence, as_json: bool) -> Result<()> {
    let sessions = persistence.list_sessions()?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    if sessions.is_empty() {
        println!("no sessions found");
        return Ok(());
    }
    for summary in sessions {
        println!("{}  {:<10}  {}", summary.session_id, summary.status, summary.goal);
    }
    Ok(())
}

/// Launch `engine-ui` as a detached sibling process pointed at this run's
/// state directory. Best-effort: a missing binary only logs a warning,
/// since the orchestration loop itself doesn't depend on it.
fn spawn_ui(state_dir: &std::path::Path, port: u16) -> Result<()> {
    match Command::new("engine-ui").arg("--state-dir").arg(state_dir).arg("--port").arg(port.to_string()).spawn() {
        Ok(_) => {
            println!("engine-ui listening on http://127.0.0.1:{port}");
            Ok(())
        }
        Err(e) => {
            tracing::warn!(err = %e, "failed to launch engine-ui, continuing without it");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_unit_suffixes() {
        assert_eq!(parse_time_limit("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_time_limit("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_time_limit("24h").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_time_limit("90").unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn rejects_unknown_units() {
        assert!(parse_time_limit("2x").is_err());
    }

    #[test]
    fn resolve_goal_joins_sub_goals() {
        let cli = Cli::parse_from(["engine", "build a thing", "--sub-goal", "write tests", "--sub-goal", "update docs"]);
        let goal = resolve_goal(&cli).unwrap();
        assert_eq!(goal, "build a thing; write tests; update docs");
    }

    #[test]
    fn resolve_goal_requires_a_goal() {
        let cli = Cli::parse_from(["engine", "--list-sessions"]);
        assert!(resolve_goal(&cli).is_err());
    }
}
