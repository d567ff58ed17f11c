pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "itinera",
    about = "Itinera approval engine operator CLI",
    long_about = "Apply migrations, seed default workflows, inspect configuration, check readiness, \
                  and dry-run workflow matching.",
    after_help = "Examples:\n  itinera doctor --json\n  itinera seed\n  \
                  itinera match --type travel --amount 7500 --department Sales"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Install the default travel workflows and demo directory (idempotent)")]
    Seed,
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Validate config, DB connectivity, and workflow catalog readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Preview which active workflow a request would be routed through")]
    Match {
        #[arg(long = "type", help = "Request type: travel or expense")]
        request_type: String,
        #[arg(long, help = "Request amount")]
        amount: String,
        #[arg(long, help = "Requester department")]
        department: Option<String>,
        #[arg(long = "job-level", help = "Requester job level")]
        job_level: Option<String>,
        #[arg(long, help = "Maximum number of candidates to list")]
        limit: Option<usize>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Match { request_type, amount, department, job_level, limit } => {
            commands::matching::run(commands::matching::MatchArgs {
                request_type,
                amount,
                department,
                job_level,
                limit,
            })
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
