use std::io::Read;
use std::thread;

use bbremote_ctrl::{Source, StreamItem};
use bytes::Bytes;
use crossbeam::channel::{self, Sender};
use tracing::{debug, warn};

use crate::cmd::Context;
use crate::exit::{ctrl_error, CliError, CliResult, FAILURE, INTERNAL, SUCCESS};
use crate::output::print_raw;

/// Ctrl-T: leave the console.
pub const EXIT_KEY: u8 = 0x14;
/// Ctrl-P: send an async ping.
pub const PING_KEY: u8 = 0x10;

const QUEUE_DEPTH: usize = 1024;

pub fn run(ctx: &Context) -> CliResult<i32> {
    let controller = ctx.connect(true)?;
    let (tx, rx) = channel::bounded(QUEUE_DEPTH);
    controller
        .start(tx.clone())
        .map_err(|err| ctrl_error("console failed", err))?;
    controller
        .send_async_console(b"\r")
        .map_err(|err| ctrl_error("console failed", err))?;

    install_ctrlc_handler(tx.clone())?;
    spawn_input(tx)?;

    let code = loop {
        let item = match rx.recv() {
            Ok(item) => item,
            Err(_) => break FAILURE,
        };
        match item {
            StreamItem::Remote(data) => print_raw(&data),
            StreamItem::Local(data) if data.as_ref() == [PING_KEY] => {
                if let Err(err) = controller.send_async_ping() {
                    warn!(%err, "ping not sent");
                }
            }
            StreamItem::Local(data) => {
                if let Err(err) = controller.send_async_console(&data) {
                    warn!(%err, "console input not sent");
                }
            }
            StreamItem::Shutdown(Source::Local) => break SUCCESS,
            StreamItem::Shutdown(Source::Remote) => break FAILURE,
        }
    };

    controller.stop();
    let _ = controller.close();
    println!();
    println!(
        "total retransmits={} crc-errors={}",
        controller.total_retransmits(),
        controller.total_crc_errors()
    );
    Ok(code)
}

/// Split one read from the terminal into queue items.
///
/// The ping key becomes an item of its own; the exit key ends input and
/// anything after it is discarded.
pub fn split_input(chunk: &[u8]) -> (Vec<StreamItem>, bool) {
    let mut items = Vec::new();
    let mut start = 0;
    for (i, byte) in chunk.iter().enumerate() {
        match *byte {
            EXIT_KEY => {
                if i > start {
                    items.push(StreamItem::Local(Bytes::copy_from_slice(&chunk[start..i])));
                }
                items.push(StreamItem::Shutdown(Source::Local));
                return (items, true);
            }
            PING_KEY => {
                if i > start {
                    items.push(StreamItem::Local(Bytes::copy_from_slice(&chunk[start..i])));
                }
                items.push(StreamItem::Local(Bytes::from_static(&[PING_KEY])));
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < chunk.len() {
        items.push(StreamItem::Local(Bytes::copy_from_slice(&chunk[start..])));
    }
    (items, false)
}

fn spawn_input(queue: Sender<StreamItem>) -> CliResult<()> {
    thread::Builder::new()
        .name("console-input".to_string())
        .spawn(move || {
            let mut stdin = std::io::stdin().lock();
            let mut buf = [0u8; 256];
            loop {
                let n = match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => {
                        debug!("console input closed");
                        let _ = queue.send(StreamItem::Shutdown(Source::Local));
                        return;
                    }
                    Ok(n) => n,
                };
                let (items, done) = split_input(&buf[..n]);
                for item in items {
                    if queue.send(item).is_err() {
                        return;
                    }
                }
                if done {
                    return;
                }
            }
        })
        .map(|_| ())
        .map_err(|err| CliError::new(INTERNAL, format!("console input thread failed: {err}")))
}

fn install_ctrlc_handler(queue: Sender<StreamItem>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        let _ = queue.try_send(StreamItem::Shutdown(Source::Local));
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
