use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bbremote_ctrl::{route, Controller, StreamItem};
use crossbeam::channel::{self, RecvTimeoutError};
use ratp_conn::Connection;
use tracing::info;

use crate::cmd::Context;
use crate::exit::{conn_error, ctrl_error, transport_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_raw, print_report};

const POLL: Duration = Duration::from_millis(100);

pub fn run(ctx: &Context) -> CliResult<i32> {
    let address = ctx.address()?;
    info!(%address, "waiting for agent");
    let stream = address
        .accept_one()
        .map_err(|err| transport_error("listen failed", err))?;

    let config = ctx.controller_config();
    let conn = Connection::listen(stream, config.connection.clone(), route)
        .map_err(|err| conn_error("listen failed", err))?;
    let controller = Controller::new(conn, config).map_err(|err| ctrl_error("listen failed", err))?;
    ctx.export_to(&controller)?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let (tx, rx) = channel::bounded(1024);
    controller
        .start(tx)
        .map_err(|err| ctrl_error("listen failed", err))?;

    while running.load(Ordering::SeqCst) {
        match rx.recv_timeout(POLL) {
            Ok(StreamItem::Remote(data)) => print_raw(&data),
            Ok(StreamItem::Shutdown(_)) => break,
            Ok(StreamItem::Local(_)) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    controller.stop();
    let _ = controller.close();
    print_report(&controller.stats(), None, ctx.format);
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
