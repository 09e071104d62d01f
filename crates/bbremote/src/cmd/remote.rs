use serde::Serialize;

use crate::cmd::{with_controller, Context, GetenvArgs, ResetArgs, RunArgs};
use crate::exit::{ctrl_error, CliResult, FAILURE, SUCCESS};
use crate::output::{print_report, OutputFormat};

#[derive(Serialize)]
struct CommandReport<'a> {
    command: &'a str,
    status: i32,
}

pub fn run(args: RunArgs, ctx: &Context) -> CliResult<i32> {
    let command = args.arg.join(" ");
    with_controller(ctx, true, |controller| {
        let status = controller
            .command(&command)
            .map_err(|err| ctrl_error("run failed", err))?;
        if ctx.format != OutputFormat::Raw {
            print_report(
                &CommandReport {
                    command: &command,
                    status,
                },
                None,
                ctx.format,
            );
        }
        Ok(if status == 0 { SUCCESS } else { FAILURE })
    })
}

#[derive(Serialize)]
struct PingReport {
    status: i32,
    retransmits: u64,
}

pub fn ping(ctx: &Context) -> CliResult<i32> {
    with_controller(ctx, false, |controller| {
        let status = controller.ping().map_err(|err| ctrl_error("ping failed", err))?;
        print_report(
            &PingReport {
                status,
                retransmits: controller.total_retransmits(),
            },
            None,
            ctx.format,
        );
        Ok(if status == 0 { SUCCESS } else { FAILURE })
    })
}

#[derive(Serialize)]
struct EnvReport<'a> {
    name: &'a str,
    value: Option<String>,
}

pub fn getenv(args: GetenvArgs, ctx: &Context) -> CliResult<i32> {
    let name = args.arg.join(" ");
    with_controller(ctx, false, |controller| {
        let value = controller
            .getenv(&name)
            .map_err(|err| ctrl_error("getenv failed", err))?
            .filter(|value| !value.is_empty())
            .map(|value| String::from_utf8_lossy(&value).into_owned());
        print_report(
            &EnvReport {
                name: &name,
                value: value.clone(),
            },
            value.as_deref(),
            ctx.format,
        );
        Ok(if value.is_some() { SUCCESS } else { FAILURE })
    })
}

pub fn reset(args: ResetArgs, ctx: &Context) -> CliResult<i32> {
    let force = args.force && !args.no_force;
    with_controller(ctx, false, |controller| {
        controller
            .reset(force)
            .map_err(|err| ctrl_error("reset failed", err))?;
        Ok(SUCCESS)
    })
}
