use clap::Parser;
use ipnet::IpNet;
use log::{error, info};
use std::path::PathBuf;
use std::sync::Arc;
use turnstile::config::PolicyConfig;
use turnstile::geo::{GeoLookup, MaxMindGeo, NoGeoData, StaticGeoTable};
use turnstile::network::{parse_network, Server, TrustedPeers};
use turnstile::storage::{JsonFileStorage, MemoryStorage, Storage};

/// Main-method of the application.
/// Parses command-line arguments, loads configuration and data, then runs the server until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,
        /// Policy configuration file (JSON)
        #[clap(short, long)]
        config: Option<PathBuf>,
        /// File to persist address and player records in; kept in memory when omitted
        #[clap(short, long)]
        storage: Option<PathBuf>,
        /// Geo table mapping networks to countries and ASNs (JSON)
        #[clap(short, long, conflicts_with_all = ["geoip_country", "geoip_asn"])]
        geo: Option<PathBuf>,
        /// MaxMind country database (GeoLite2-Country.mmdb)
        #[clap(long)]
        geoip_country: Option<PathBuf>,
        /// MaxMind ASN database (GeoLite2-ASN.mmdb)
        #[clap(long)]
        geoip_asn: Option<PathBuf>,
        /// Address or network allowed to send proxy events and admin commands.
        /// Repeatable; only loopback is trusted when omitted
        #[clap(short, long = "trust", value_parser = parse_network)]
        trust: Vec<IpNet>,
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => PolicyConfig::load(path)?,
        None => {
            info!("No configuration file given, every check is off");
            PolicyConfig::default()
        }
    };

    let storage: Arc<dyn Storage> = match &args.storage {
        Some(path) => Arc::new(JsonFileStorage::open(path)?),
        None => Arc::new(MemoryStorage::new()),
    };

    let geo: Arc<dyn GeoLookup> = match (&args.geo, &args.geoip_country, &args.geoip_asn) {
        (Some(path), _, _) => Arc::new(StaticGeoTable::load(path)?),
        (None, None, None) => Arc::new(NoGeoData::new()),
        (None, country, asn) => Arc::new(MaxMindGeo::open(country.as_deref(), asn.as_deref())?),
    };

    let trusted = if args.trust.is_empty() {
        TrustedPeers::loopback()
    } else {
        TrustedPeers::new(args.trust.clone())
    };

    let address = format!("{}:{}", args.host, args.port);
    let server = Server::bind(&address, config, args.config.clone(), storage, geo)
        .await?
        .with_trusted_peers(trusted);
    let coordinator = Arc::clone(server.coordinator());

    // Handle shutdown gracefully
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    coordinator.shutdown();
    Ok(())
}
