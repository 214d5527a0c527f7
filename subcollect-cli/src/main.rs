use clap::{CommandFactory, FromArgMatches, Parser, Subcommand, ValueEnum};
use std::process;
use subcollect::config::{credentials_path, load_credentials};
use subcollect::targets::{builtin_targets, render_targets_table, select_targets};
use subcollect::{Phase, Pipeline, PipelineConfig, RunMode, RunReport, SqliteStore};

/// subcollect: move embedded arrays into subcollections, then clean up the
/// embedded copies. Runs are dry by default.
#[derive(Parser)]
#[command(name = "subcollect", version, about)]
struct Cli {
    /// Issue live writes (default is a dry run that writes nothing)
    #[arg(long, global = true)]
    execute: bool,

    /// Output format for the run report
    #[arg(long, global = true, default_value = "table")]
    format: OutputFormat,

    /// Restrict the run to one target (e.g. --only litters.puppies); repeatable
    #[arg(long = "only", global = true, value_name = "COLLECTION.FIELD")]
    only: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Yaml,
}

#[derive(Subcommand)]
enum Command {
    /// Copy embedded arrays into subcollections and write aggregates
    Migrate,

    /// Remove embedded fields whose subcollection is verified
    Cleanup,

    /// Report which parents are safe to clean, without writing
    Verify,

    /// Show the configured migration targets
    Targets,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = match parse_cli() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("ERROR:{e}");
            process::exit(1);
        }
    };

    match run(cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("ERROR:{e}");
            process::exit(1);
        }
    }
}

/// Parse arguments with the configured targets appended to `--help`.
fn parse_cli() -> Result<Cli, Box<dyn std::error::Error>> {
    let targets = builtin_targets()?;
    let help = format!("Migration targets:\n{}", render_targets_table(&targets));
    let matches = Cli::command().after_help(help).get_matches();
    Ok(Cli::from_arg_matches(&matches)?)
}

fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    let targets = select_targets(&builtin_targets()?, &cli.only)?;

    let phase = match cli.command {
        Command::Targets => {
            print!("{}", render_targets_table(&targets));
            return Ok(0);
        }
        Command::Migrate => Phase::Migrate,
        Command::Cleanup => Phase::Cleanup,
        Command::Verify => Phase::Verify,
    };

    let path = credentials_path();
    let credentials = load_credentials(&path)?;
    log::info!(
        "Project {} at {}",
        credentials.project_id,
        credentials.database.display()
    );
    let store = SqliteStore::open(&credentials.database)?;

    let mode = RunMode::from_execute_flag(cli.execute);
    let config = PipelineConfig::new(mode).with_max_batch_ops(credentials.batch_limit());
    let pipeline = Pipeline::new(&store, config, targets);

    let report = match phase {
        Phase::Migrate => pipeline.migrate(),
        Phase::Cleanup => pipeline.cleanup(),
        Phase::Verify => pipeline.verify(),
    };

    print_report(&report, &cli.format)?;
    Ok(report.exit_code())
}

fn print_report(
    report: &RunReport,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Table => print!("{}", report.render()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(report)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(report)?),
    }
    Ok(())
}
