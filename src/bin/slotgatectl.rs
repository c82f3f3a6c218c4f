//! Slotgate administration CLI.
//!
//! `slotgatectl` inspects a queue's counters and cursor, and can run admission
//! checks or slot reservations by hand.

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use slotgate::slotgatectl::{self, CtlContext, GlobalOptions};

#[derive(Parser, Debug)]
#[command(name = "slotgatectl")]
#[command(about = "Administration CLI for slotgate queue admission state")]
#[command(version)]
struct Args {
    /// Path to a TOML config file
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Output in JSON format instead of human-readable text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show a queue's current minute/hour usage and cursor
    Inspect { queue: String },
    /// Run one admission check, counting it like a real job
    Admit { queue: String },
    /// Reserve the next free future slot
    Allocate { queue: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let opts = GlobalOptions { json: args.json };

    let ctx = match CtlContext::open(args.config.as_deref()).await {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut stdout = io::stdout();
    let result = match &args.command {
        Command::Inspect { queue } => slotgatectl::inspect(&ctx, queue, &opts, &mut stdout).await,
        Command::Admit { queue } => slotgatectl::admit(&ctx, queue, &opts, &mut stdout).await,
        Command::Allocate { queue } => {
            slotgatectl::allocate(&ctx, queue, &opts, &mut stdout).await
        }
    };
    let closed = ctx.close().await;

    match result.and(closed) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
