//! LatticeLM driver binary.
//!
//! `latticelm inference|chat|perplexity` runs the root node;
//! `latticelm worker` serves as a mesh member until killed.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use latticelm_cli::args::{Cli, Command};
use latticelm_cli::app;

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "latticelm=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Inference(args) => app::run_root(&args, app::Mode::Inference),
        Command::Chat(args) => app::run_root(&args, app::Mode::Chat),
        Command::Perplexity(args) => app::run_root(&args, app::Mode::Perplexity),
        Command::Worker(args) => app::run_worker(&args),
    };

    if let Err(e) = result {
        eprintln!("Critical error: {e}");
        std::process::exit(1);
    }
}
