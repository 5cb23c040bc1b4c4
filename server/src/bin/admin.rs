use bincode::{deserialize, serialize};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use turnstile_shared::{AdminCommand, ListAction, ListKind, Packet, MAX_PACKET_SIZE};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Sends an admin command to a running turnstile server")]
struct Args {
    /// Server address
    #[clap(short, long, default_value = "127.0.0.1:8080")]
    server: SocketAddr,
    /// Seconds to wait for the reply
    #[clap(short, long, default_value = "5")]
    timeout: u64,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage the whitelist
    Whitelist {
        #[clap(subcommand)]
        change: Change,
    },
    /// Manage the blacklist
    Blacklist {
        #[clap(subcommand)]
        change: Change,
    },
    /// Show what is known about an address or a player
    Info { target: String },
    /// Reload the policy configuration file
    Reload,
}

#[derive(Subcommand, Debug)]
enum Change {
    /// Add an address or a player
    Add { target: String },
    /// Remove an address or a player
    Remove { target: String },
}

impl Change {
    fn into_command(self, list: ListKind) -> AdminCommand {
        let (action, target) = match self {
            Change::Add { target } => (ListAction::Add, target),
            Change::Remove { target } => (ListAction::Remove, target),
        };
        AdminCommand::List {
            list,
            action,
            target,
        }
    }
}

// Request ids only need to be distinct between concurrent admin invocations
fn request_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_nanos() as u64
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let command = match args.command {
        Command::Whitelist { change } => change.into_command(ListKind::Whitelist),
        Command::Blacklist { change } => change.into_command(ListKind::Blacklist),
        Command::Info { target } => AdminCommand::Info { target },
        Command::Reload => AdminCommand::Reload,
    };

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    let request_id = request_id();
    let data = serialize(&Packet::Admin {
        request_id,
        command,
    })?;
    socket.send_to(&data, args.server).await?;

    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let wait = Duration::from_secs(args.timeout);
    loop {
        let (len, _) = match timeout(wait, socket.recv_from(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => return Err(format!("No reply from {} within {:?}", args.server, wait).into()),
        };

        match deserialize::<Packet>(&buf[..len]) {
            Ok(Packet::AdminResult {
                request_id: id,
                outcome,
            }) if id == request_id => {
                println!("{}", outcome);
                return Ok(());
            }
            Ok(other) => eprintln!("Ignoring unexpected packet: {:?}", other),
            Err(e) => eprintln!("Failed to deserialize reply: {}", e),
        }
    }
}
