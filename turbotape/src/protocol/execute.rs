//! Remote execution of an uploaded file.

use crate::error::Result;
use crate::port::Port;
use crate::protocol::exchange::{Command, CommandExchange};
use crate::protocol::run_command;
use log::info;
use std::time::Duration;

/// Ask the receiver to run `basename`.
///
/// With `ack` the command waits for a response line starting with it, after
/// the usual echo; without it the command is fire-and-forget.
pub fn run<P: Port>(
    exchange: &mut CommandExchange<'_, P>,
    basename: &str,
    ack: Option<&str>,
    timeout: Duration,
) -> Result<()> {
    info!("Running {basename}");
    let text = run_command(basename);
    let command = match ack {
        Some(ack) => Command::expect(text, ack, timeout),
        None => Command::fire_and_forget(text, Duration::ZERO),
    };
    exchange.send(&command)
}
