use crate::CLAP_STYLING;
use clap::{arg, command};
use lotmap_core::config::DEFAULT_CONFIG_PATH;

pub(crate) fn command_argument_builder() -> clap::Command {
    clap::Command::new("lotmap")
        .version(env!("CARGO_PKG_VERSION"))
        .bin_name("lotmap")
        .styles(CLAP_STYLING)
        .arg(
            arg!(-c --"config" <PATH>)
                .required(false)
                .global(true)
                .help("Path to the lotmap configuration file")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            arg!(-v --"verbose" "Enable debug logging (RUST_LOG takes precedence)")
                .required(false)
                .global(true)
                .action(clap::ArgAction::SetTrue),
        )
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            command!("init")
                .about("Writes the default configuration and creates the lotmap database")
                .arg(
                    arg!(-f --"force")
                        .help("Overwrite an existing configuration file and database")
                        .required(false)
                        .action(clap::ArgAction::SetTrue),
                ),
        )
        .subcommand(
            command!("sites")
                .about("Manage the auction sites known to lotmap")
                .subcommand_required(true)
                .subcommand(
                    command!("import")
                        .about("Import sites from a nome,dominio CSV or a newline-delimited domain list")
                        .arg(
                            arg!(<FILE>)
                                .required(true)
                                .help("Path to the site list")
                                .value_parser(clap::value_parser!(std::path::PathBuf)),
                        ),
                )
                .subcommand(
                    command!("list").about("List sites").arg(
                        arg!(-s --"status" <STATUS>)
                            .required(false)
                            .help("Only show sites with this discovery status")
                            .value_parser(["pending", "mapping", "mapped", "failed"]),
                    ),
                ),
        )
        .subcommand(
            command!("map")
                .about(
                    "Fetch the URL map of a batch of sites, then group the run into template \
                groups.",
                )
                .arg(
                    arg!(-s --"sites" <IDS>)
                        .required(false)
                        .help("Comma-separated site ids (default: every pending site)")
                        .conflicts_with("all"),
                )
                .arg(
                    arg!(--"all")
                        .required(false)
                        .help("Map every known site")
                        .action(clap::ArgAction::SetTrue)
                        .conflicts_with("sites"),
                )
                .arg(
                    arg!(-t --"concurrency" <NUM_WORKERS>)
                        .required(false)
                        .help("Maximum number of fetches in flight (default: from config)")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(-r --"rate-limit" <PER_MINUTE>)
                        .required(false)
                        .help("Maximum fetches started per minute, 0 for no limit (default: from config)")
                        .value_parser(clap::value_parser!(u32)),
                )
                .arg(
                    arg!(--"no-group")
                        .required(false)
                        .help("Only map; do not run grouping afterwards")
                        .action(clap::ArgAction::SetTrue)
                        .conflicts_with("validate"),
                )
                .arg(
                    arg!(--"validate")
                        .required(false)
                        .help("Ask the validation agent about every candidate group the run produced")
                        .action(clap::ArgAction::SetTrue),
                ),
        )
        .subcommand(
            command!("group")
                .about("Group the mapped sites of a finished run by shared listing/detail shape")
                .arg(
                    arg!(-r --"run" <RUN_ID>)
                        .required(false)
                        .help("Run to group (default: the most recent finished run)"),
                ),
        )
        .subcommand(
            command!("validate")
                .about("Ask the validation agent whether candidate groups are real auction structures")
                .arg(
                    arg!(-g --"group" <GROUP_ID>)
                        .required(false)
                        .help("Validate a single group (default: every candidate group)")
                        .value_parser(clap::value_parser!(i64)),
                ),
        )
        .subcommand(
            command!("approve")
                .about("Manually mark a candidate group as validated")
                .arg(
                    arg!(<GROUP_ID>)
                        .required(true)
                        .value_parser(clap::value_parser!(i64)),
                )
                .arg(
                    arg!(-n --"note" <TEXT>)
                        .required(false)
                        .help("Reason stored in the validation history"),
                ),
        )
        .subcommand(
            command!("reject")
                .about("Manually reject a group and release its member sites")
                .arg(
                    arg!(<GROUP_ID>)
                        .required(true)
                        .value_parser(clap::value_parser!(i64)),
                )
                .arg(
                    arg!(-n --"note" <TEXT>)
                        .required(false)
                        .help("Reason stored in the validation history"),
                ),
        )
        .subcommand(
            command!("ignore")
                .about("Exclude a site from grouping")
                .arg(
                    arg!(<SITE_ID>)
                        .required(true)
                        .value_parser(clap::value_parser!(i64)),
                )
                .arg(
                    arg!(--"undo")
                        .required(false)
                        .help("Make an ignored site eligible for grouping again")
                        .action(clap::ArgAction::SetTrue),
                ),
        )
        .subcommand(command!("status").about("Show recent runs, groups and site counts"))
        .subcommand(
            command!("show-group")
                .about("Show a group with its members and validation history")
                .arg(
                    arg!(<GROUP_ID>)
                        .required(true)
                        .value_parser(clap::value_parser!(i64)),
                ),
        )
        .subcommand(
            command!("export")
                .about("Export the crawler configuration of validated groups")
                .arg(
                    arg!(-o --"output" <PATH>)
                        .required(false)
                        .help("Save the export to a file (default: print to screen)")
                        .value_parser(clap::value_parser!(std::path::PathBuf)),
                )
                .arg(
                    arg!(-f --"format" <FORMAT>)
                        .required(false)
                        .help("Export format: json, csv")
                        .value_parser(["json", "csv"])
                        .default_value("json"),
                )
                .arg(
                    arg!(--"include-candidates")
                        .required(false)
                        .help("Also export groups that are still candidates")
                        .action(clap::ArgAction::SetTrue),
                ),
        )
}
