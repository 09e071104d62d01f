mod cmd;
mod exit;
mod logging;
mod output;

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::cmd::{parse_duration, Command, Context};
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "bbremote", version, about = "Remote control for a bootloader over a serial link")]
struct Cli {
    /// Link to the agent: socket://host:port or unix:///path.
    #[arg(long, env = "BBREMOTE_PORT", global = true)]
    port: Option<String>,

    /// Host directory served to the agent's file requests.
    #[arg(long, value_name = "DIR", env = "BBREMOTE_EXPORT", global = true)]
    export: Option<PathBuf>,

    /// Keep retrying until the agent answers.
    #[arg(short, long, global = true)]
    wait: bool,

    /// Bound on each remote operation (e.g. 5s, 500ms).
    #[arg(long, value_name = "DURATION", value_parser = parse_duration, global = true)]
    reply_timeout: Option<Duration>,

    /// More log output; repeat for more.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Output format.
    #[arg(long, value_name = "FORMAT", default_value = "raw", global = true)]
    format: OutputFormat,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr). Overrides -v.
    #[arg(long, value_name = "LEVEL", global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    let level = cli
        .log_level
        .unwrap_or_else(|| LogLevel::from_verbosity(cli.verbose));
    init_logging(cli.log_format, level);

    let ctx = Context {
        port: cli.port,
        export: cli.export,
        wait: cli.wait,
        reply_timeout: cli.reply_timeout,
        format: cli.format,
    };

    match cmd::run(cli.command, &ctx) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_hyphenated_arguments() {
        let cli = Cli::try_parse_from([
            "bbremote",
            "--port",
            "socket://localhost:4000",
            "run",
            "ls",
            "-l",
            "/env",
        ])
        .expect("run args should parse");

        match cli.command {
            Command::Run(args) => assert_eq!(args.arg, vec!["ls", "-l", "/env"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_hex_addresses() {
        let cli = Cli::try_parse_from(["bbremote", "md", "/dev/mem", "0x80000000", "0x40"])
            .expect("md args should parse");
        match cli.command {
            Command::Md(args) => {
                assert_eq!(args.address, 0x8000_0000);
                assert_eq!(args.size, 64);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reset_force_flags_conflict() {
        let err = Cli::try_parse_from(["bbremote", "reset", "--force", "--no-force"])
            .expect_err("conflicting flags should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn verbosity_counts() {
        let cli = Cli::try_parse_from(["bbremote", "-vv", "ping"]).expect("should parse");
        assert_eq!(cli.verbose, 2);
        assert!(cli.log_level.is_none());
    }

    #[test]
    fn rejects_bad_gpio_direction() {
        assert!(Cli::try_parse_from(["bbremote", "gpio-set-direction", "3", "2", "0"]).is_err());
    }
}
