use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand, ValueEnum};
use coach::assistant::OfflineAssistant;
use coach::commands::{DispatchOutcome, handle_turn};
use coach::config::CoachConfig;
use coach::core::{CoachError, EventKind, Profile, TimeOfDay};
use coach::parser::{parse_calendar_date, parse_plan_with};
use coach::projectors::{calendar_projector, nutrition, plan_fallback};
use coach::session::CoachSession;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "coach",
    about = "Training plan tooling: parse, schedule and edit weekly plans",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// TOML settings file; built-in defaults when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse a plan file and print its sessions.
    Parse(ParseArgs),

    /// Project a plan file onto calendar events.
    Calendar(CalendarArgs),

    /// Print the locally generated plan or nutrition text for a profile.
    Generate(GenerateArgs),

    /// Run one chat instruction against a saved session.
    Chat(ChatArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Plan text file.
    plan: PathBuf,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct CalendarArgs {
    /// Plan text file.
    plan: PathBuf,
    /// Date of day 1 (YYYY-MM-DD or DD/MM/YYYY). Defaults to today.
    #[arg(long, value_parser = parse_date)]
    start: Option<NaiveDate>,
    /// morning, midday, afternoon or evening (French names accepted).
    #[arg(long)]
    time: Option<TimeOfDay>,
    /// Session length in minutes.
    #[arg(long)]
    duration: Option<u32>,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct GenerateArgs {
    /// Profile answers as TOML.
    #[arg(long)]
    profile: PathBuf,
    #[arg(long, value_enum, default_value_t = Emit::Plan)]
    emit: Emit,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum Emit {
    Plan,
    Nutrition,
    /// Calorie and macro targets as JSON.
    Targets,
}

#[derive(Debug, Args)]
struct ChatArgs {
    /// Session state JSON; created when missing.
    #[arg(long)]
    state: PathBuf,
    /// Profile answers (TOML) for a new session.
    #[arg(long)]
    profile: Option<PathBuf>,
    /// Date of day 1 for a new session. Defaults to today.
    #[arg(long, value_parser = parse_date)]
    start: Option<NaiveDate>,
    /// The chat message.
    #[arg(required = true)]
    instruction: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CoachConfig::load(cli.config.as_deref())?;
    init_logging(&config, cli.verbose);
    match cli.command {
        Commands::Parse(args) => handle_parse(args, &config),
        Commands::Calendar(args) => handle_calendar(args, &config),
        Commands::Generate(args) => handle_generate(args),
        Commands::Chat(args) => handle_chat(args, &config),
    }
}

/// `RUST_LOG` wins over the configured level; `--verbose` forces debug.
fn init_logging(config: &CoachConfig, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn parse_date(s: &str) -> Result<NaiveDate, CoachError> {
    parse_calendar_date(s)
}

fn read_plan(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading plan {:?}", path))
}

fn load_profile(path: &Path) -> Result<Profile> {
    let text = fs::read_to_string(path).with_context(|| format!("reading profile {:?}", path))?;
    toml::from_str(&text).with_context(|| format!("parsing profile {:?}", path))
}

fn handle_parse(args: ParseArgs, config: &CoachConfig) -> Result<()> {
    let ParseArgs { plan, json } = args;
    let text = read_plan(&plan)?;
    let sessions = parse_plan_with(&text, &config.parser);
    if sessions.is_empty() {
        anyhow::bail!("no sessions found in {:?}", plan);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
    } else {
        for session in &sessions {
            let marker = if session.is_rest() { " (repos)" } else { "" };
            println!("Jour {} — {}{}", session.day, session.title, marker);
            for line in session.description.lines() {
                println!("    {line}");
            }
        }
    }
    Ok(())
}

fn handle_calendar(args: CalendarArgs, config: &CoachConfig) -> Result<()> {
    let CalendarArgs {
        plan,
        start,
        time,
        duration,
        json,
    } = args;

    let text = read_plan(&plan)?;
    let sessions = parse_plan_with(&text, &config.parser);
    let events = calendar_projector::project_with_slots(
        &sessions,
        start.unwrap_or_else(|| Local::now().date_naive()),
        time.unwrap_or(config.schedule.time_of_day),
        duration.unwrap_or(config.schedule.session_minutes),
        &config.schedule.slots,
    );

    if events.is_empty() {
        eprintln!("No sessions found in {:?}.", plan);
        return Ok(());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&events)?);
    } else {
        for event in events {
            let kind = match event.kind {
                EventKind::Rest => "REST",
                EventKind::Training => "TRAINING",
            };
            println!(
                "{} {}-{} {:<8} {}",
                event.start.date(),
                event.start.format("%H:%M"),
                event.end.format("%H:%M"),
                kind,
                event.title
            );
        }
    }
    Ok(())
}

fn handle_generate(args: GenerateArgs) -> Result<()> {
    let profile = load_profile(&args.profile)?;
    match args.emit {
        Emit::Plan => println!("{}", plan_fallback::fallback_plan(&profile)),
        Emit::Nutrition => println!("{}", nutrition::fallback_nutrition(&profile)),
        Emit::Targets => println!(
            "{}",
            serde_json::to_string_pretty(&nutrition::calorie_targets(&profile))?
        ),
    }
    Ok(())
}

fn handle_chat(args: ChatArgs, config: &CoachConfig) -> Result<()> {
    let outcome = chat_turn(&args, config)?;
    if !outcome.feedback.is_empty() {
        println!("{}", outcome.feedback);
    }
    if !outcome.is_command {
        eprintln!("(not a plan command; nothing was changed)");
    }
    Ok(())
}

/// Load or create the session, run the instruction, save the session.
fn chat_turn(args: &ChatArgs, config: &CoachConfig) -> Result<DispatchOutcome> {
    let mut session = if args.state.exists() {
        debug!(path = ?args.state, "loading session state");
        CoachSession::load(&args.state)?
    } else {
        let profile = match &args.profile {
            Some(path) => load_profile(path)?,
            None => Profile::default(),
        };
        let start = args.start.unwrap_or_else(|| Local::now().date_naive());
        let mut session = CoachSession::new(profile, start);
        session.initialize_plans(&OfflineAssistant);
        info!(session = %session.id.0, "new session created");
        session
    };
    session.apply_config(config);

    let instruction = args.instruction.join(" ");
    let outcome = handle_turn(&mut session, &instruction, &OfflineAssistant);
    session
        .save(&args.state)
        .with_context(|| format!("saving session to {:?}", args.state))?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(state: &Path, instruction: &str) -> DispatchOutcome {
        let args = ChatArgs {
            state: state.to_path_buf(),
            profile: None,
            start: NaiveDate::from_ymd_opt(2025, 11, 5),
            instruction: instruction.split(' ').map(str::to_string).collect(),
        };
        chat_turn(&args, &CoachConfig::default()).expect("chat turn")
    }

    #[test]
    fn chat_creates_then_reuses_state() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let state = tmp.path().join("state.json");

        let out = chat(&state, "ajoute burpees au jour 2");
        assert!(out.plan_changed);
        let saved = CoachSession::load(&state).expect("load state");
        assert_eq!(saved.sessions().len(), 7);
        assert!(saved.plan_text().contains("- burpees"));

        let out = chat(&state, "commence le 10/11/2025");
        assert!(out.calendar_changed);
        let saved = CoachSession::load(&state).expect("reload state");
        assert_eq!(
            saved.schedule.start_date,
            NaiveDate::from_ymd_opt(2025, 11, 10).unwrap()
        );
        assert!(saved.plan_text().contains("- burpees"));
    }

    #[test]
    fn failed_instruction_still_saves_unchanged_state() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let state = tmp.path().join("state.json");
        chat(&state, "bonjour");
        let before = fs::read_to_string(&state).expect("read state");

        let out = chat(&state, "ajoute sprint au jour 9");
        assert!(!out.plan_changed);
        assert_eq!(fs::read_to_string(&state).expect("read state"), before);
    }

    #[test]
    fn profile_from_toml() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("profile.toml");
        fs::write(
            &path,
            "days_per_week = 4\nexperience = \"avancé\"\ntime_of_day = \"soir\"\n",
        )
        .expect("write profile");

        let profile = load_profile(&path).expect("profile");
        assert_eq!(profile.days_per_week, 4);
        assert_eq!(profile.time_of_day, TimeOfDay::Evening);
        assert_eq!(profile.city, "Montreal");
        assert!(load_profile(&tmp.path().join("missing.toml")).is_err());
    }

    #[test]
    fn dates_accept_both_forms() {
        assert_eq!(parse_date("05/11/2025").unwrap(), parse_date("2025-11-05").unwrap());
        assert!(parse_date("2025/11/05").is_err());
    }
}
