use crate::cmd::memory::{ReadReport, WriteReport};
use crate::cmd::{parse_hex, with_controller, Context, I2cReadArgs, I2cWriteArgs};
use crate::exit::{ctrl_error, CliResult};
use crate::output::print_report;

pub fn read(args: I2cReadArgs, ctx: &Context) -> CliResult<i32> {
    with_controller(ctx, false, |controller| {
        let (status, data) = controller
            .i2c_read(args.bus, args.address, args.reg, args.flags, args.size)
            .map_err(|err| ctrl_error("i2c read failed", err))?;
        let report = ReadReport {
            status,
            data: hex::encode(&data),
        };
        let raw = (status == 0).then_some(report.data.as_str());
        print_report(&report, raw, ctx.format);
        Ok(status)
    })
}

pub fn write(args: I2cWriteArgs, ctx: &Context) -> CliResult<i32> {
    let data = parse_hex(&args.data)?;
    with_controller(ctx, false, |controller| {
        let (status, written) = controller
            .i2c_write(args.bus, args.address, args.reg, args.flags, &data)
            .map_err(|err| ctrl_error("i2c write failed", err))?;
        let line = format!("{written} bytes written");
        let raw = (status == 0).then_some(line.as_str());
        print_report(
            &WriteReport {
                status,
                written: u32::from(written),
            },
            raw,
            ctx.format,
        );
        Ok(status)
    })
}
