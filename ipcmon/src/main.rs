// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Wiretap for a running IPC server: registers a monitor socket and prints
//! every observed message. The server only accepts the registration from
//! root, and only when it was started with `RIALTO_IPC_MONITOR=1`.

use std::path::PathBuf;

use clap::Parser;
use log::*;

use rialto_ipc::server::monitor::{MonitorEvent, MonitorMessage};
use rialto_ipc::{Channel, FileDescriptor};

#[derive(Parser)]
#[command(about = "Watch the RPC traffic of a running IPC server")]
struct Args {
    /// Path of the server's listening socket.
    #[arg(short, long)]
    socket: PathBuf,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();

    let channel = Channel::connect(&args.socket)?;

    // hand one end of a seqpacket pair to the server, keep the other
    let (tap, tap_peer) = rialto_ipc::pipe::pipe()?;
    {
        use std::os::fd::AsRawFd;
        channel.register_monitor(&FileDescriptor::new(tap_peer.as_raw_fd()))?;
    }
    drop(tap_peer);

    info!("monitor registered on {}", args.socket.display());

    let mut buf = vec![0_u8; rialto_ipc::server::monitor::MONITOR_MAX_MESSAGE_SIZE];
    loop {
        let n = nix::unistd::read(&tap, &mut buf)?;
        if n == 0 {
            // server went away
            break;
        }

        let mut message = MonitorMessage::default();
        let mut input = &buf[..n];
        if message.deserialize(&mut input).is_err() {
            warn!("could not decode monitor message of {n} bytes");
            continue;
        }

        println!("{}", render(&message));
    }

    Ok(())
}

fn render(message: &MonitorMessage) -> String {
    let stamp = format!(
        "[{}.{:06}]",
        message.timestamp_mono / 1_000_000,
        message.timestamp_mono % 1_000_000
    );

    match &message.event {
        MonitorEvent::CurrentClients(clients) => {
            let mut out = format!("{stamp} {} client(s) connected", clients.len());
            for (id, details) in clients {
                out.push_str(&format!(
                    "\n    client {id}: pid {} uid {} gid {} @ '{}'",
                    details.pid, details.uid, details.gid, details.socket_path
                ));
            }
            out
        }
        MonitorEvent::ClientConnected { client_id, details } => format!(
            "{stamp} connected    client {client_id}: pid {} uid {} gid {} @ '{}'",
            details.pid, details.uid, details.gid, details.socket_path
        ),
        MonitorEvent::ClientDisconnected { client_id } => {
            format!("{stamp} disconnected client {client_id}")
        }
        MonitorEvent::Call {
            client_id,
            no_reply,
            call,
        } => format!(
            "{stamp} call{{ serial {} }}  client {client_id} -> {}.{} ({} byte body){}",
            call.serial_id,
            call.service_name,
            call.method_name,
            call.body.len(),
            if *no_reply { " [no reply]" } else { "" }
        ),
        MonitorEvent::Reply {
            target_client_id,
            reply,
        } => format!(
            "{stamp} reply{{ serial {} }} -> client {target_client_id} ({} byte body)",
            reply.reply_id,
            reply.body.len()
        ),
        MonitorEvent::Error {
            target_client_id,
            error,
        } => format!(
            "{stamp} error{{ serial {} }} -> client {target_client_id}: \"{}\"",
            error.reply_id, error.reason
        ),
        MonitorEvent::Event {
            target_client_id,
            event,
        } => format!(
            "{stamp} event{{ {} }} -> client {target_client_id} ({} byte body)",
            event.name,
            event.body.len()
        ),
    }
}
