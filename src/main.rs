use std::{path::Path, process::ExitCode};

use anyhow::{Context, Error};
use clap::Parser;
use log::{debug, error, warn};

use imgchain::{
    cli::{self, Cli, Commands},
    lookup, relative_path, ChainBuilder,
};
use imgchain_api::{
    config::ChainConfig,
    constants::DEFAULT_CONFIG_PATH,
    error::{ImgChainError, ImgChainResultExt, InternalError, InvalidInputError, ReportError},
    source::Source,
    xml::format_source,
};

fn load_config(args: &Cli) -> Result<ChainConfig, ImgChainError> {
    match &args.config {
        Some(path) => ChainConfig::load(path),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => ChainConfig::load(DEFAULT_CONFIG_PATH),
        None => {
            debug!("No configuration file, using defaults");
            Ok(ChainConfig::default())
        }
    }
}

/// Finds the image called `name` anywhere in `chain`.
fn find<'a>(chain: &'a Source, name: &str) -> Result<&'a Source, ImgChainError> {
    lookup(chain, None, Some(name), None)
        .map(|(node, _)| node)
        .structured(InvalidInputError::UnknownImage { name: name.into() })
}

fn run(args: &Cli) -> Result<(), ImgChainError> {
    let mut config = load_config(args).message("Failed to load configuration")?;

    match &args.command {
        Commands::Parse { locator } => {
            let source = imgchain::parse(locator)
                .map_err(ImgChainError::from)
                .message(format!("Failed to parse backing locator '{locator}'"))?;
            if source.auth_warning {
                warn!("Backing locator contains inline credentials, they are ignored");
            }
            print!("{}", format_source(&source));
        }

        Commands::Chain {
            path,
            format,
            max_depth,
            allow_probe,
            yaml,
        } => {
            if let Some(max_depth) = max_depth {
                config.max_depth = *max_depth;
            }
            config.allow_probe |= *allow_probe;
            config.validate()?;

            let chain = ChainBuilder::from_config(&config).build(path, *format)?;
            if *yaml {
                let rendered = serde_yaml::to_string(&chain)
                    .structured(InternalError::SerializeChain)?;
                print!("{rendered}");
            } else {
                print!("{}", cli::describe_chain(&chain));
            }
        }

        Commands::Lookup {
            path,
            name,
            target,
            format,
        } => {
            let chain = ChainBuilder::from_config(&config).build(path, *format)?;
            let (node, parent) = lookup(&chain, None, name.as_deref(), target.as_deref())
                .structured(InvalidInputError::UnknownImage {
                    name: name.clone().unwrap_or_default(),
                })?;

            print!("{}", cli::describe_node(node));
            match parent {
                Some(parent) => println!("parent: {}", parent.id),
                None => println!("parent: -"),
            }
        }

        Commands::Relative {
            path,
            top,
            base,
            format,
        } => {
            let chain = ChainBuilder::from_config(&config).build(path, *format)?;
            let top = find(&chain, top)?;
            let base = find(&chain, base)?;

            match relative_path(top, base)? {
                Some(relative) => println!("{relative}"),
                None => warn!("No relative path leads from image {} to image {}", top.id, base.id),
            }
        }
    }

    Ok(())
}

fn setup_logging(args: &Cli) -> Result<(), Error> {
    env_logger::builder()
        .format_timestamp(None)
        .filter_level(args.verbosity)
        .try_init()
        .context("Logger already registered")
}

fn main() -> ExitCode {
    let args = Cli::parse();

    if let Err(e) = setup_logging(&args) {
        eprintln!("Failed to initialize logging: {e:?}");
        return ExitCode::from(1);
    }

    if let Err(e) = run(&args).message(format!("Failed to execute '{}' command", args.command)) {
        // Save the error if requested
        if let Some(error_path) = &args.error {
            if let Err(e2) = std::fs::write(
                error_path,
                serde_yaml::to_string(&e).unwrap_or_default(),
            ) {
                error!("Failed to write error to file: {e2}");
            }
        }

        error!("imgchain failed: {e:?}");
        return ExitCode::from(2);
    }

    ExitCode::SUCCESS
}
