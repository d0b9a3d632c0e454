// SPDX-FileCopyrightText: © 2025 Trickle Contributors
//
// SPDX-License-Identifier: MPL-2.0

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

mod client;

#[derive(Parser, Debug)]
#[command(author, version, about = "Trickle client CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Publish a file or stdin to a stream, one segment per chunk of bytes
    Publish {
        /// Stream name
        stream: String,
        /// Input file path (defaults to stdin)
        #[arg(short, long)]
        input: Option<String>,
        /// Bytes per published segment
        #[arg(long, default_value_t = 2 * 1024 * 1024)]
        segment_bytes: usize,
        /// Server base URL
        #[arg(short, long, default_value = "http://127.0.0.1:2939/")]
        server: String,
    },
    /// Follow a stream and write segment bodies to stdout or a file
    Subscribe {
        /// Stream name
        stream: String,
        /// Output file path (defaults to stdout)
        #[arg(short, long)]
        output: Option<String>,
        /// Seq to start from (-1 = latest)
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        start: i64,
        /// Server base URL
        #[arg(short, long, default_value = "http://127.0.0.1:2939/")]
        server: String,
    },
    /// Tail the changefeed and print stream add/remove events
    Watch {
        /// Server base URL
        #[arg(short, long, default_value = "http://127.0.0.1:2939/")]
        server: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Publish { stream, input, segment_bytes, server } => {
            client::run_publish(&server, &stream, input.as_deref(), segment_bytes).await
        },
        Commands::Subscribe { stream, output, start, server } => {
            client::run_subscribe(&server, &stream, output.as_deref(), start).await
        },
        Commands::Watch { server } => client::run_watch(&server).await,
    };

    if let Err(e) = result {
        error!(error = %e, "command failed");
        std::process::exit(1);
    }
}
