use std::path::PathBuf;
use std::time::Duration;

use bbremote_ctrl::{Controller, ControllerConfig, GpioDirection};
use clap::{Args, Subcommand};
use ratp_transport::LinkAddress;
use tracing::debug;

use crate::exit::{ctrl_error, transport_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod console;
pub mod gpio;
pub mod i2c;
pub mod listen;
pub mod memory;
pub mod remote;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a shell command on the agent; exits 1 if it fails.
    Run(RunArgs),
    /// Test the connection.
    Ping,
    /// Print an agent environment variable; exits 1 if it is unset.
    Getenv(GetenvArgs),
    /// Read memory through a device file.
    Md(MdArgs),
    /// Write hex data to memory through a device file.
    Mw(MwArgs),
    /// Read I2C registers.
    I2cRead(I2cReadArgs),
    /// Write hex data to I2C registers.
    I2cWrite(I2cWriteArgs),
    /// Print the value of a GPIO line.
    GpioGetValue(GpioArgs),
    /// Set the value of a GPIO line.
    GpioSetValue(GpioSetValueArgs),
    /// Configure a GPIO line as input or output.
    GpioSetDirection(GpioSetDirectionArgs),
    /// Reset the board.
    Reset(ResetArgs),
    /// Wait for an agent to connect and serve it until it goes away.
    Listen,
    /// Interactive console. Ctrl-T exits, Ctrl-P sends a ping.
    Console,
    /// Show version information.
    Version(VersionArgs),
}

/// Settings shared by every subcommand.
#[derive(Debug, Clone)]
pub struct Context {
    pub port: Option<String>,
    pub export: Option<PathBuf>,
    pub wait: bool,
    pub reply_timeout: Option<Duration>,
    pub format: OutputFormat,
}

impl Context {
    pub fn address(&self) -> CliResult<LinkAddress> {
        let port = self
            .port
            .as_deref()
            .ok_or_else(|| CliError::new(USAGE, "no port given (use --port or BBREMOTE_PORT)"))?;
        LinkAddress::parse(port).map_err(|err| transport_error("invalid port", err))
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            wait_for_peer: self.wait,
            reply_timeout: self.reply_timeout,
            ..ControllerConfig::default()
        }
    }

    /// Connect to the agent, exporting `--export` when `serve_files` is set.
    pub fn connect(&self, serve_files: bool) -> CliResult<Controller> {
        let address = self.address()?;
        debug!(%address, wait = self.wait, "connecting");
        let controller = Controller::connect_with(|| address.connect(), self.controller_config())
            .map_err(|err| ctrl_error("connect failed", err))?;
        if serve_files {
            self.export_to(&controller)?;
        }
        Ok(controller)
    }

    pub fn export_to(&self, controller: &Controller) -> CliResult<()> {
        if let Some(dir) = &self.export {
            controller
                .export(dir)
                .map_err(|err| ctrl_error("export failed", err))?;
        }
        Ok(())
    }
}

/// Connect, run one operation and close.
pub fn with_controller<F>(ctx: &Context, serve_files: bool, op: F) -> CliResult<i32>
where
    F: FnOnce(&Controller) -> CliResult<i32>,
{
    let controller = ctx.connect(serve_files)?;
    let result = op(&controller);
    let _ = controller.close();
    result
}

pub fn run(command: Command, ctx: &Context) -> CliResult<i32> {
    match command {
        Command::Run(args) => remote::run(args, ctx),
        Command::Ping => remote::ping(ctx),
        Command::Getenv(args) => remote::getenv(args, ctx),
        Command::Md(args) => memory::md(args, ctx),
        Command::Mw(args) => memory::mw(args, ctx),
        Command::I2cRead(args) => i2c::read(args, ctx),
        Command::I2cWrite(args) => i2c::write(args, ctx),
        Command::GpioGetValue(args) => gpio::get_value(args, ctx),
        Command::GpioSetValue(args) => gpio::set_value(args, ctx),
        Command::GpioSetDirection(args) => gpio::set_direction(args, ctx),
        Command::Reset(args) => remote::reset(args, ctx),
        Command::Listen => listen::run(ctx),
        Command::Console => console::run(ctx),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Command line to run.
    #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
    pub arg: Vec<String>,
}

#[derive(Args, Debug)]
pub struct GetenvArgs {
    /// Variable name.
    #[arg(required = true, num_args = 1..)]
    pub arg: Vec<String>,
}

#[derive(Args, Debug)]
pub struct MdArgs {
    pub path: String,
    #[arg(value_parser = parse_int::<u32>)]
    pub address: u32,
    #[arg(value_parser = parse_int::<u32>)]
    pub size: u32,
}

#[derive(Args, Debug)]
pub struct MwArgs {
    pub path: String,
    #[arg(value_parser = parse_int::<u32>)]
    pub address: u32,
    /// Hex bytes, e.g. `deadbeef`.
    pub data: String,
}

#[derive(Args, Debug)]
pub struct I2cReadArgs {
    #[arg(value_parser = parse_int::<u8>)]
    pub bus: u8,
    #[arg(value_parser = parse_int::<u8>)]
    pub address: u8,
    #[arg(value_parser = parse_int::<u16>)]
    pub reg: u16,
    #[arg(value_parser = parse_int::<u8>)]
    pub flags: u8,
    #[arg(value_parser = parse_int::<u16>)]
    pub size: u16,
}

#[derive(Args, Debug)]
pub struct I2cWriteArgs {
    #[arg(value_parser = parse_int::<u8>)]
    pub bus: u8,
    #[arg(value_parser = parse_int::<u8>)]
    pub address: u8,
    #[arg(value_parser = parse_int::<u16>)]
    pub reg: u16,
    #[arg(value_parser = parse_int::<u8>)]
    pub flags: u8,
    /// Hex bytes, e.g. `0a0b`.
    pub data: String,
}

#[derive(Args, Debug)]
pub struct GpioArgs {
    #[arg(value_parser = parse_int::<u32>)]
    pub gpio: u32,
}

#[derive(Args, Debug)]
pub struct GpioSetValueArgs {
    #[arg(value_parser = parse_int::<u32>)]
    pub gpio: u32,
    #[arg(value_parser = parse_int::<u8>)]
    pub value: u8,
}

#[derive(Args, Debug)]
pub struct GpioSetDirectionArgs {
    #[arg(value_parser = parse_int::<u32>)]
    pub gpio: u32,
    /// 0: input, 1: output.
    #[arg(value_parser = parse_direction)]
    pub direction: GpioDirection,
    /// Output value.
    #[arg(value_parser = parse_int::<u8>)]
    pub value: u8,
}

#[derive(Args, Debug)]
pub struct ResetArgs {
    /// Reset immediately, skipping shutdown handlers on the agent.
    #[arg(long, conflicts_with = "no_force")]
    pub force: bool,
    #[arg(long)]
    pub no_force: bool,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Integer in decimal or with a `0x`, `0o` or `0b` prefix.
pub fn parse_int<T: TryFrom<u64>>(input: &str) -> Result<T, String> {
    let text = input.trim().replace('_', "");
    let (digits, radix) = match text.get(..2).map(str::to_ascii_lowercase).as_deref() {
        Some("0x") => (&text[2..], 16),
        Some("0o") => (&text[2..], 8),
        Some("0b") => (&text[2..], 2),
        _ => (text.as_str(), 10),
    };
    let value = u64::from_str_radix(digits, radix).map_err(|err| format!("{input}: {err}"))?;
    T::try_from(value).map_err(|_| format!("{input}: out of range"))
}

fn parse_direction(input: &str) -> Result<GpioDirection, String> {
    match input {
        "0" | "in" | "input" => Ok(GpioDirection::Input),
        "1" | "out" | "output" => Ok(GpioDirection::Output),
        other => Err(format!("{other}: expected 0 (input) or 1 (output)")),
    }
}

/// Hex string to bytes; an odd number of digits gets a leading zero.
pub fn parse_hex(input: &str) -> CliResult<Vec<u8>> {
    let digits = input.trim().trim_start_matches("0x");
    let padded = if digits.len() % 2 == 0 {
        digits.to_string()
    } else {
        format!("0{digits}")
    };
    hex::decode(&padded).map_err(|err| CliError::new(USAGE, format!("invalid hex data {input}: {err}")))
}

/// Parse `2s`, `150ms` or a bare number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration value: {input}"))?;
    if value == 0 {
        return Err("duration must be greater than zero".to_string());
    }
    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_in_any_base() {
        assert_eq!(parse_int::<u32>("4096"), Ok(4096));
        assert_eq!(parse_int::<u32>("0x1000"), Ok(4096));
        assert_eq!(parse_int::<u32>("0X10"), Ok(16));
        assert_eq!(parse_int::<u8>("0b101"), Ok(5));
        assert_eq!(parse_int::<u16>("0o17"), Ok(15));
        assert!(parse_int::<u8>("0x100").is_err());
        assert!(parse_int::<u32>("ten").is_err());
    }

    #[test]
    fn hex_data_is_padded() {
        assert_eq!(parse_hex("deadbeef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(parse_hex("abc").unwrap(), vec![0x0a, 0xbc]);
        assert_eq!(parse_hex("0x1").unwrap(), vec![0x01]);
        assert_eq!(parse_hex("zz").unwrap_err().code, USAGE);
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("2s"), Ok(Duration::from_secs(2)));
        assert_eq!(parse_duration("150ms"), Ok(Duration::from_millis(150)));
        assert_eq!(parse_duration("3"), Ok(Duration::from_secs(3)));
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn missing_port_is_a_usage_error() {
        let ctx = Context {
            port: None,
            export: None,
            wait: false,
            reply_timeout: None,
            format: OutputFormat::Raw,
        };
        assert_eq!(ctx.address().unwrap_err().code, USAGE);
    }
}
