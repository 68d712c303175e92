//! Entry point for the binject CLI.
//!
//! 1. Parse command-line arguments using `clap`.
//! 2. Read the environment once: `RUST_LOG` / `DEBUG` for logging, host defaults for signing.
//! 3. Build a [`Context`] and run the requested operation.
//!
//! Errors are reported as the full `anyhow` chain and mapped to the tool's exit codes.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use binject::cache::{self, CacheEnv};
use binject::config::{Cli, Command};
use binject::container::CacheKeyHash;
use binject::context::{debug_enabled, Context};
use binject::error::exit_code;
use binject::inject::{extract, inject_file, list, verify};
use binject::repack::{repack, RepackRequest};
use binject::signer::{self, NoopSigner, Signer};

fn init_tracing(log_level: &str, debug: bool) {
    let default = if debug { "debug" } else { log_level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run(cli: Cli, ctx: &Context) -> Result<()> {
    match cli.command {
        Command::Inject(args) => {
            let report = inject_file(ctx, &args.executable, &args.output, &args.options())?;
            for (resource, size) in &report.injected {
                println!("Injected {} ({} bytes) into {}", resource, size, args.output.display());
            }
        }
        Command::List { executable } => {
            let (format, found) = list(&executable)?;
            println!("{} ({})", executable.display(), format);
            if found.is_empty() {
                println!("  no resources");
            }
            for info in found {
                println!("  {:<16} {:<32} {} bytes", info.resource, info.location, info.size);
            }
        }
        Command::Extract {
            executable,
            resource,
            output,
        } => {
            let resource = resource.resource();
            let size = extract(&executable, resource, &output)?;
            println!("Extracted {} ({} bytes) to {}", resource, size, output.display());
        }
        Command::Verify { executable, resource } => {
            let resource = resource.resource();
            let report = verify(&executable, resource)?;
            match (report.cache_key, report.vfs_config) {
                (Some(key), _) => println!("{} OK: {} bytes at {} (cache key {})", resource, report.size, report.location, key),
                (None, Some(config)) => println!(
                    "{} OK: {} bytes at {} (mode {}, prefix {})",
                    resource, report.size, report.location, config.mode, config.prefix
                ),
                (None, None) => println!("{} OK: {} bytes at {}", resource, report.size, report.location),
            }
        }
        Command::Repack(args) => {
            let request = RepackRequest {
                stub: &args.stub,
                payload: &args.payload,
                uncompressed_size: args.uncompressed_size,
                platform: args.platform(),
                update_config: args.update_config(),
                output: &args.output,
            };
            let report = repack(ctx, &request)?;
            println!(
                "Repacked {} into {} ({}, cache key {}, {} bytes)",
                args.stub.display(),
                args.output.display(),
                report.format,
                report.cache_key,
                report.output_size
            );
        }
        Command::CachePath {
            cache_key,
            name,
            metadata,
        } => {
            let base = CacheEnv::from_process().base_dir();
            println!("{}", cache::binary_path(&base, &cache_key, &name)?.display());
            if metadata {
                println!("{}", cache::metadata_path(&base, &cache_key)?.display());
            }
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let debug = debug_enabled(std::env::var("DEBUG").ok().as_deref()) || cli.log_level.eq_ignore_ascii_case("debug");
    init_tracing(&cli.log_level, debug);

    let signer: Box<dyn Signer> = if cli.no_sign { Box::new(NoopSigner) } else { signer::native() };
    let hash = cli.cache_key_hash.unwrap_or_else(CacheKeyHash::native);
    let ctx = Context::new(signer, hash);

    if let Err(err) = run(cli, &ctx) {
        eprintln!("Error: {err:#}");
        std::process::exit(exit_code(&err));
    }
}
