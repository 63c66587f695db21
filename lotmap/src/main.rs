use clap::ArgMatches;
use colored::Colorize;
use commands::command_argument_builder;
use lotmap::handlers::*;
use lotmap_core::config::DEFAULT_CONFIG_PATH;
use tracing_subscriber::EnvFilter;

mod commands;

#[tokio::main]
async fn main() {
    let matches = command_argument_builder().get_matches();
    init_tracing(matches.get_flag("verbose"));

    let config_arg = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(DEFAULT_CONFIG_PATH);

    if let Err(e) = dispatch(&matches, config_arg).await {
        eprintln!("{} {:#}", "✗".red().bold(), e);
        std::process::exit(1);
    }
}

/// Logs go to stderr; `RUST_LOG` wins over `-v`.
fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn dispatch(matches: &ArgMatches, config_arg: &str) -> anyhow::Result<()> {
    let (config_path, config) = match matches.subcommand() {
        Some(("init", _)) => (lotmap_core::config::expand_path(config_arg), Default::default()),
        _ => load_config(config_arg)?,
    };

    match matches.subcommand() {
        Some(("init", primary_command)) => handle_init(primary_command, &config_path),
        Some(("sites", primary_command)) => match primary_command.subcommand() {
            Some(("import", secondary_command)) => handle_sites_import(secondary_command, &config),
            Some(("list", secondary_command)) => handle_sites_list(secondary_command, &config),
            _ => unreachable!("clap should ensure we don't get here"),
        },
        Some(("map", primary_command)) => handle_map(primary_command, &config).await,
        Some(("group", primary_command)) => handle_group(primary_command, &config),
        Some(("validate", primary_command)) => handle_validate(primary_command, &config).await,
        Some(("approve", primary_command)) => handle_approve(primary_command, &config),
        Some(("reject", primary_command)) => handle_reject(primary_command, &config),
        Some(("ignore", primary_command)) => handle_ignore(primary_command, &config),
        Some(("status", _)) => handle_status(&config),
        Some(("show-group", primary_command)) => handle_show_group(primary_command, &config),
        Some(("export", primary_command)) => handle_export(primary_command, &config),
        _ => unreachable!("clap should ensure we don't get here"),
    }
}

pub const CLAP_STYLING: clap::builder::styling::Styles = clap::builder::styling::Styles::styled()
    .header(clap_cargo::style::HEADER)
    .usage(clap_cargo::style::USAGE)
    .literal(clap_cargo::style::LITERAL)
    .placeholder(clap_cargo::style::PLACEHOLDER)
    .error(clap_cargo::style::ERROR)
    .valid(clap_cargo::style::VALID)
    .invalid(clap_cargo::style::INVALID);
