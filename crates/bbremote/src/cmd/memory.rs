use serde::Serialize;

use crate::cmd::{parse_hex, with_controller, Context, MdArgs, MwArgs};
use crate::exit::{ctrl_error, CliResult};
use crate::output::print_report;

#[derive(Serialize)]
pub(crate) struct ReadReport {
    pub status: i32,
    pub data: String,
}

#[derive(Serialize)]
pub(crate) struct WriteReport {
    pub status: i32,
    pub written: u32,
}

pub fn md(args: MdArgs, ctx: &Context) -> CliResult<i32> {
    with_controller(ctx, false, |controller| {
        let (status, data) = controller
            .md(&args.path, args.address, args.size)
            .map_err(|err| ctrl_error("md failed", err))?;
        let report = ReadReport {
            status,
            data: hex::encode(&data),
        };
        let raw = (status == 0).then_some(report.data.as_str());
        print_report(&report, raw, ctx.format);
        Ok(status)
    })
}

pub fn mw(args: MwArgs, ctx: &Context) -> CliResult<i32> {
    let data = parse_hex(&args.data)?;
    with_controller(ctx, false, |controller| {
        let (status, written) = controller
            .mw(&args.path, args.address, &data)
            .map_err(|err| ctrl_error("mw failed", err))?;
        let line = format!("{written} bytes written");
        let raw = (status == 0).then_some(line.as_str());
        print_report(&WriteReport { status, written }, raw, ctx.format);
        Ok(status)
    })
}
