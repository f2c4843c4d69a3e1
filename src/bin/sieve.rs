//! Sieve of Eratosthenes demonstration
//!
//! Drives the prime sieve process network on the VPU and prints the
//! requested prime.
//!
//! Usage:
//!   cargo run --bin sieve -- 10
//!   cargo run --bin sieve -- 100 --persist-every 1 --stats
//!
//! `RUST_LOG=bpel_vpu=debug` shows every rendezvous.

use std::process::ExitCode;

use clap::Parser;

use bpel_vpu::sieve::find_nth_prime;
use bpel_vpu::VpuConfig;

/// Prime sieve on the process-calculus VPU
#[derive(Parser, Debug)]
#[command(name = "sieve")]
#[command(about = "Find the nth prime with a process network of filters")]
struct Args {
    /// Which prime to find (1 -> 2, 2 -> 3, ...)
    nth: usize,

    /// Write the execution queue out and read it back every N cycles
    #[arg(long, short = 'p', env = "BPEL_SIEVE_PERSIST_EVERY")]
    persist_every: Option<u32>,

    /// Print VPU statistics when done
    #[arg(long, short = 's')]
    stats: bool,

    /// Print the execution queue state when done
    #[arg(long)]
    dump: bool,
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let args = Args::parse();
    let config = VpuConfig::from_env();

    match find_nth_prime(args.nth, args.persist_every, config) {
        Ok(run) => {
            println!("The {}th prime is {}", args.nth, run.prime);
            if run.persisted > 0 {
                println!(
                    "({} cycles, queue persisted {} times)",
                    run.cycles, run.persisted
                );
            }
            if args.stats {
                print!("{}", run.statistics);
            }
            if args.dump {
                print!("{}", run.dump);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("sieve failed: {e}");
            ExitCode::FAILURE
        }
    }
}
