use clap::{Parser, Subcommand};
use std::error::Error;

#[derive(Parser)]
#[command(name = "codedrop")]
#[command(about = "TCP file relay: client-side encryption, 6-digit rendezvous codes", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay server: accept uploads, store encrypted blobs, serve downloads
    Server {
        /// Port for the binary protocol
        #[arg(short, long, default_value_t = 9999)]
        port: u16,
        /// Directory for stored encrypted blobs
        #[arg(short, long, default_value = "./data")]
        dir: String,
        /// Web port for the browser download page; omitted = disabled
        #[arg(short, long)]
        web: Option<u16>,
        /// Server id (0-9): the first digit of codes minted here
        #[arg(long, default_value_t = 0, value_parser = clap::value_parser!(u8).range(0..=9))]
        id: u8,
    },
    /// Encrypt and upload a file; you get a 6-digit code to share
    Send {
        /// Path to the file to send
        file_path: String,
        /// Server address (host:port); skips server probing
        #[arg(short, long)]
        addr: Option<String>,
        /// Seal with a fresh 256-bit key the server never sees
        #[arg(short, long)]
        secure: bool,
    },
    /// Download and decrypt a file by its 6-digit code
    Get {
        /// The 6-digit code
        code: String,
        /// Server address (host:port); overrides the code's server id
        #[arg(short, long)]
        addr: Option<String>,
        /// Output file (default: name from server)
        #[arg(short, long)]
        output: Option<String>,
        /// 64-character hex key for secure uploads (prompted if omitted)
        #[arg(short, long)]
        key: Option<String>,
    },
    /// Measure throughput to a server in both directions
    Bench {
        /// Server address (host:port); defaults to the first listed server
        #[arg(short, long)]
        addr: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Commands::Server { port, dir, web, id } => {
            codedrop::commands::server::run(port, &dir, web, id).await?;
        }
        Commands::Send { file_path, addr, secure } => {
            codedrop::commands::send::run(&file_path, addr, secure).await?;
        }
        Commands::Get { code, addr, output, key } => {
            codedrop::commands::get::run(&code, addr, output, key).await?;
        }
        Commands::Bench { addr } => {
            codedrop::commands::bench::run(addr).await?;
        }
    }

    Ok(())
}
