//! coursegrab: entry point.

use anyhow::Context;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tokio_util::sync::CancellationToken;

use coursegrab_cli::commands::{self, GrabOptions};
use coursegrab_cli::config::{AppConfig, Overrides};
use coursegrab_cli::output;

#[derive(Parser)]
#[command(
    name = "coursegrab",
    about = "Course registration for the BUAA elective portal",
    version
)]
struct Cli {
    /// Path to the JSON config file.
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Flags shared by every command that talks to the portal.
#[derive(Args, Debug, Default)]
struct SessionArgs {
    /// Student id for the SSO login.
    #[arg(short = 'u', long = "user")]
    student_id: Option<String>,

    /// SSO password.
    #[arg(short, long)]
    password: Option<String>,

    /// Use an existing portal token instead of logging in.
    #[arg(long)]
    token: Option<String>,

    /// Elective batch id; skips the batch lookup.
    #[arg(long)]
    batch_id: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and print the session token and batch.
    Login {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Search the course catalog.
    Search {
        /// Keyword matched against course names.
        keyword: String,

        /// Class type tag (teachingClassType).
        #[arg(long)]
        category: Option<String>,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// Register for a class, retrying while it is full.
    Grab {
        /// Course name to search for.
        #[arg(short = 'c', long = "course")]
        course_name: Option<String>,

        /// Teaching class id (JXBID) to register for.
        #[arg(long)]
        course_id: Option<String>,

        /// Class type tag (teachingClassType).
        #[arg(long)]
        category: Option<String>,

        /// Pause between attempts, in milliseconds.
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Stop after this many attempts.
        #[arg(long)]
        max_attempts: Option<u32>,

        /// Make a single attempt.
        #[arg(long, conflicts_with = "loop_mode")]
        once: bool,

        /// Keep retrying until a terminal outcome.
        #[arg(long = "loop")]
        loop_mode: bool,

        /// Log in again up to N times if the session expires.
        #[arg(long, default_value_t = 0)]
        relogin: u32,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   coursegrab completions bash > ~/.local/share/bash-completion/completions/coursegrab
    ///   coursegrab completions zsh > ~/.zfunc/_coursegrab
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },
}

fn session_overrides(session: &SessionArgs) -> Overrides {
    Overrides {
        student_id: session.student_id.clone(),
        password: session.password.clone(),
        batch_id: session.batch_id.clone(),
        ..Overrides::default()
    }
}

fn init_tracing(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "coursegrab", &mut std::io::stdout());
        return Ok(());
    }

    let (mut config, config_path) =
        AppConfig::load_resolved(cli.config.as_deref()).context("failed to load configuration")?;

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.system.log_level.clone());
    init_tracing(&level, cli.log_json);
    match &config_path {
        Some(path) => tracing::info!(path = %path.display(), "configuration loaded"),
        None => tracing::info!("no config file found, using defaults"),
    }

    match cli.command {
        Commands::Login { session } => {
            config.apply(&session_overrides(&session));
            commands::login(&config, session.token.as_deref()).await?;
        }

        Commands::Search {
            keyword,
            category,
            session,
        } => {
            config.apply(&Overrides {
                category,
                ..session_overrides(&session)
            });
            commands::search(&config, &keyword, session.token.as_deref()).await?;
        }

        Commands::Grab {
            course_name,
            course_id,
            category,
            interval_ms,
            max_attempts,
            once,
            loop_mode,
            relogin,
            session,
        } => {
            config.apply(&Overrides {
                course_name,
                course_id,
                category,
                interval_ms,
                max_attempts,
                once,
                looping: loop_mode || max_attempts.is_some(),
                ..session_overrides(&session)
            });

            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("  interrupt received, stopping after the current step");
                    on_interrupt.cancel();
                }
            });

            let options = GrabOptions {
                token: session.token,
                relogin,
            };
            let outcome = commands::grab(&config, &options, cancel).await?;
            println!("  {}", output::summarize(&outcome));
            let code = output::exit_code(outcome.status);
            if code != 0 {
                std::process::exit(code);
            }
        }

        Commands::Completions { .. } => {}
    }

    Ok(())
}
