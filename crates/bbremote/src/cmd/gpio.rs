use serde::Serialize;

use crate::cmd::{with_controller, Context, GpioArgs, GpioSetDirectionArgs, GpioSetValueArgs};
use crate::exit::{ctrl_error, CliResult, SUCCESS};
use crate::output::print_report;

#[derive(Serialize)]
struct ValueReport {
    gpio: u32,
    value: u8,
}

pub fn get_value(args: GpioArgs, ctx: &Context) -> CliResult<i32> {
    with_controller(ctx, false, |controller| {
        let value = controller
            .gpio_get_value(args.gpio)
            .map_err(|err| ctrl_error("gpio read failed", err))?;
        let line = value.to_string();
        print_report(
            &ValueReport {
                gpio: args.gpio,
                value,
            },
            Some(&line),
            ctx.format,
        );
        Ok(SUCCESS)
    })
}

pub fn set_value(args: GpioSetValueArgs, ctx: &Context) -> CliResult<i32> {
    with_controller(ctx, false, |controller| {
        controller
            .gpio_set_value(args.gpio, args.value)
            .map_err(|err| ctrl_error("gpio write failed", err))?;
        Ok(SUCCESS)
    })
}

pub fn set_direction(args: GpioSetDirectionArgs, ctx: &Context) -> CliResult<i32> {
    with_controller(ctx, false, |controller| {
        controller
            .gpio_set_direction(args.gpio, args.direction, args.value)
            .map_err(|err| ctrl_error("gpio direction failed", err))
    })
}
