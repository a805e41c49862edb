//! sshrun CLI
//!
//! Runs an ordered list of commands on one host and reports each result

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use color_eyre::Result;
use sshrun_exec::{
    CommandList, CommandRunner, ExecError, ExecutionSummary, LocalTransport, SessionConfigurator,
    SshTransport,
};
use tracing::error;
use tracing_subscriber::EnvFilter;

mod config;

use config::{Config, LogConfig, LogFormat};

#[derive(Parser)]
#[command(name = "sshrun")]
#[command(about = "Run a sequence of commands on a remote host over SSH", long_about = None)]
struct Cli {
    /// Run file (defaults to $SSHRUN_CONFIG, ./sshrun.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run commands in order, stopping at the first failure
    #[command(name = "run")]
    Run(RunArgs),
    /// Validate the run file and print the resolved target
    #[command(name = "check-config")]
    CheckConfig,
}

#[derive(Args)]
struct RunArgs {
    /// Remote host
    #[arg(long)]
    host: Option<String>,
    /// Remote port
    #[arg(short, long)]
    port: Option<u16>,
    /// Login user
    #[arg(short, long)]
    user: Option<String>,
    /// Read the password from this environment variable
    #[arg(long)]
    password_env: Option<String>,
    /// Private key file
    #[arg(short = 'i', long)]
    key: Option<PathBuf>,
    /// Read a base64-encoded private key from this environment variable
    #[arg(long)]
    key_env: Option<String>,
    /// Run the commands on this machine instead
    #[arg(long)]
    local: bool,
    /// Print the summary as JSON
    #[arg(long)]
    json: bool,
    /// Commands to run; replaces the run file's list when given
    commands: Vec<String>,
}

const EXIT_OK: u8 = 0;
const EXIT_COMMAND_FAILED: u8 = 1;
const EXIT_BAD_INPUT: u8 = 2;
const EXIT_CONNECTION: u8 = 3;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let mut config = Config::load_default(cli.config.as_deref())?;
    init_tracing(&config.log);

    match cli.command {
        Commands::CheckConfig => Ok(ExitCode::from(check_config(&config))),
        Commands::Run(args) => {
            apply_overrides(&mut config, &args);
            let status = run(config, args.local, args.json).await?;
            Ok(ExitCode::from(status))
        }
    }
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match log.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn apply_overrides(config: &mut Config, args: &RunArgs) {
    let target = &mut config.target;
    if let Some(host) = &args.host {
        target.host = Some(host.clone());
    }
    if let Some(port) = args.port {
        target.port = Some(port);
    }
    if let Some(user) = &args.user {
        target.username = Some(user.clone());
    }
    if let Some(var) = &args.password_env {
        target.password_env = Some(var.clone());
    }
    if let Some(key) = &args.key {
        target.private_key = Some(key.clone());
        target.private_key_env = None;
    } else if let Some(var) = &args.key_env {
        target.private_key = None;
        target.private_key_env = Some(var.clone());
    }
    if !args.commands.is_empty() {
        config.commands = CommandList::from(args.commands.clone());
    }
}

fn check_config(config: &Config) -> u8 {
    let checked = config
        .target
        .to_session_config()
        .and_then(|session| SessionConfigurator::new(session.clone()).map(|_| session));
    match checked {
        Ok(session) => {
            println!("{session:#?}");
            println!("{} command(s)", config.commands.len());
            EXIT_OK
        }
        Err(e) => report_error(&e),
    }
}

async fn run(config: Config, local: bool, json: bool) -> Result<u8> {
    let configurator = match config
        .target
        .to_session_config()
        .and_then(SessionConfigurator::new)
    {
        Ok(configurator) => configurator,
        Err(e) => return Ok(report_error(&e)),
    };

    let outcome = if local {
        CommandRunner::new(configurator, LocalTransport::new)
            .run(config.commands)
            .await
    } else {
        let keepalive = config.target.keepalive();
        let transport = move || match keepalive {
            Some(interval) => SshTransport::with_keepalive(interval),
            None => SshTransport::new(),
        };
        CommandRunner::new(configurator, transport)
            .run(config.commands)
            .await
    };

    match outcome {
        Ok(summary) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
            if summary.is_success() {
                Ok(EXIT_OK)
            } else {
                Ok(EXIT_COMMAND_FAILED)
            }
        }
        Err(e) => Ok(report_error(&e)),
    }
}

fn report_error(err: &ExecError) -> u8 {
    error!(error = %err, "run failed");
    eprintln!("error: {err}");
    if err.is_caller_error() {
        EXIT_BAD_INPUT
    } else {
        EXIT_CONNECTION
    }
}

fn print_summary(summary: &ExecutionSummary) {
    for result in &summary.results {
        let status = if result.success { "ok" } else { "failed" };
        match result.exit_code {
            Some(code) => println!(
                "[{status}] {} (exit {code}, {:?})",
                result.command, result.duration
            ),
            None => println!("[{status}] {}", result.command),
        }
        let output = result.combined_output();
        if !output.is_empty() {
            print!("{output}");
        }
        if let Some(failure) = &result.error {
            println!("  {failure}");
        }
    }

    let skipped = summary.command_count - summary.results.len();
    println!(
        "{}/{} succeeded, {} failed, {} skipped",
        summary.success_count, summary.command_count, summary.failure_count, skipped
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_run_args_parse() {
        let cli = parse(&["sshrun", "run", "--host", "h", "-u", "root", "-p", "2222", "uptime", "df -h"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.host.as_deref(), Some("h"));
        assert_eq!(args.port, Some(2222));
        assert_eq!(args.commands, vec!["uptime", "df -h"]);
    }

    #[test]
    fn test_overrides_replace_file_values() {
        let mut config: Config = toml::from_str(
            r#"
            commands = "uptime"
            [target]
            host = "file-host"
            username = "file-user"
            private_key_env = "DEPLOY_KEY"
            "#,
        )
        .unwrap();
        let cli = parse(&["sshrun", "run", "--host", "cli-host", "-i", "/keys/id", "ls", "pwd"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };

        apply_overrides(&mut config, &args);

        assert_eq!(config.target.host.as_deref(), Some("cli-host"));
        assert_eq!(config.target.username.as_deref(), Some("file-user"));
        assert_eq!(config.target.private_key, Some(PathBuf::from("/keys/id")));
        assert!(config.target.private_key_env.is_none());
        assert_eq!(config.commands, CommandList::from(["ls", "pwd"]));
    }

    #[test]
    fn test_global_config_flag() {
        let cli = parse(&["sshrun", "check-config", "--config", "/tmp/run.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/run.toml")));
    }

    #[tokio::test]
    async fn test_local_run_exit_codes() {
        let mut config = Config::default();
        config.target.host = Some("localhost".into());
        config.target.username = Some("me".into());
        config.target.password = Some("unused".into());

        config.commands = CommandList::from(["true", "echo hi"]);
        let code = run(config.clone(), true, true).await.unwrap();
        assert_eq!(code, EXIT_OK);

        config.commands = CommandList::from(["false", "true"]);
        let code = run(config, true, false).await.unwrap();
        assert_eq!(code, EXIT_COMMAND_FAILED);
    }

    #[tokio::test]
    async fn test_missing_target_is_bad_input() {
        let mut config = Config::default();
        config.target.username = Some("me".into());
        config.target.password = Some("pw".into());
        config.commands = CommandList::from("true");

        let code = run(config.clone(), true, false).await.unwrap();
        assert_eq!(code, EXIT_BAD_INPUT);
        assert_eq!(check_config(&config), EXIT_BAD_INPUT);

        config.target.host = Some("localhost".into());
        config.target.username = None;
        assert_eq!(run(config.clone(), true, false).await.unwrap(), EXIT_BAD_INPUT);

        config.target.username = Some("me".into());
        config.target.password_env = Some("SSHRUN_TEST_PASSWORD_NEVER_SET".into());
        assert_eq!(run(config.clone(), true, false).await.unwrap(), EXIT_BAD_INPUT);
        assert_eq!(check_config(&config), EXIT_BAD_INPUT);
    }

    #[test]
    fn test_check_config_accepts_complete_target() {
        let mut config = Config::default();
        config.target.host = Some("localhost".into());
        config.target.username = Some("me".into());
        config.target.password = Some("pw".into());
        assert_eq!(check_config(&config), EXIT_OK);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = Config::default();
        config.target.host = Some("127.0.0.1".into());
        config.target.port = Some(port);
        config.target.username = Some("me".into());
        config.target.password = Some("pw".into());
        config.commands = CommandList::from("true");

        let code = run(config, false, false).await.unwrap();
        assert_eq!(code, EXIT_CONNECTION);
    }

    #[tokio::test]
    async fn test_unreadable_key_is_connection_error() {
        let mut config = Config::default();
        config.target.host = Some("localhost".into());
        config.target.username = Some("me".into());
        config.target.private_key = Some(PathBuf::from("/nonexistent/sshrun/id_ed25519"));
        config.commands = CommandList::from("true");

        let code = run(config, true, false).await.unwrap();
        assert_eq!(code, EXIT_CONNECTION);
    }
}
