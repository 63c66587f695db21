use anyhow::{Context, anyhow, bail};
use clap::ArgMatches;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use lotmap_core::config::{Config, expand_path};
use lotmap_core::data::Database;
use lotmap_core::export::{ExportFormat, gather_export_data, render_export, save_export};
use lotmap_core::grouping::{GroupingSummary, ignore_site, run_grouping, unignore_site};
use lotmap_core::model::{DiscoveryStatus, GroupStatus, RunStatus, Site};
use lotmap_core::orchestrator::{
    RunEvent, RunOptions, RunProgressCallback, RunSummary, run_map, run_pipeline,
};
use lotmap_core::sites::{import_sites, load_sites};
use lotmap_core::validation::{
    AgentValidator, ValidationOutcome, Validator, approve_group, reject_group, validate_group,
};
use lotmap_scanner::FirecrawlMapper;
use std::fmt::Write as _;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

// Helper functions shared by the handlers

/// Resolve the `--config` argument and load it; a missing file gives defaults.
pub fn load_config(raw_path: &str) -> anyhow::Result<(PathBuf, Config)> {
    let path = expand_path(raw_path);
    let config = Config::load(&path)
        .with_context(|| format!("Failed to load configuration {}", path.display()))?;
    Ok((path, config))
}

/// Open the configured database, refusing to create one implicitly.
pub fn open_database(config: &Config) -> anyhow::Result<Database> {
    let path = config.database_path();
    if !Database::exists(&path) {
        bail!(
            "No database at {}. Run `lotmap init` first.",
            path.display()
        );
    }
    Ok(Database::new(&path)?)
}

/// Parse a comma-separated list of site ids.
pub fn parse_site_ids(raw: &str) -> Result<Vec<i64>, String> {
    let ids: Vec<i64> = raw
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<i64>()
                .map_err(|_| format!("'{}' is not a site id", part))
        })
        .collect::<Result<_, _>>()?;

    if ids.is_empty() {
        return Err("No site ids given".to_string());
    }
    Ok(ids)
}

/// Sites for a map run: explicit ids, every site, or every pending site.
pub fn select_sites(db: &Database, ids: Option<&str>, all: bool) -> anyhow::Result<Vec<i64>> {
    if let Some(raw) = ids {
        return parse_site_ids(raw).map_err(|e| anyhow!(e));
    }
    let sites = if all {
        db.list_sites()?
    } else {
        db.list_sites_by_discovery_status(DiscoveryStatus::Pending)?
    };
    Ok(sites.iter().map(|s| s.id).collect())
}

/// The requested run, or the most recent one that is no longer running.
pub fn select_run(db: &Database, run_id: Option<&str>) -> anyhow::Result<String> {
    if let Some(id) = run_id {
        return Ok(id.to_string());
    }
    db.list_runs()?
        .into_iter()
        .find(|run| run.status != RunStatus::Running)
        .map(|run| run.id)
        .ok_or_else(|| anyhow!("No finished run to group. Run `lotmap map` first."))
}

pub fn format_timestamp(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn short_id(run_id: &str) -> &str {
    run_id.get(..8).unwrap_or(run_id)
}

fn colored_group_status(status: GroupStatus) -> String {
    match status {
        GroupStatus::Candidate => status.as_str().yellow().to_string(),
        GroupStatus::Validated => status.as_str().green().to_string(),
        GroupStatus::Rejected => status.as_str().red().to_string(),
    }
}

pub fn render_sites(sites: &[Site]) -> String {
    let mut out = String::new();
    if sites.is_empty() {
        let _ = writeln!(out, "No sites.");
        return out;
    }

    for site in sites {
        let group = site
            .group_id
            .map(|id| format!("group {}", id))
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "  {:>5}  {:<40} {:<9} {:<18} {}",
            site.id.to_string().cyan(),
            site.domain,
            site.discovery_status.as_str(),
            site.grouping_status.as_str(),
            group
        );
    }
    let _ = writeln!(out, "\n  {} site(s)", sites.len());
    out
}

/// Recent runs, groups by status and site counts.
pub fn render_status(db: &Database) -> anyhow::Result<String> {
    let mut out = String::new();

    let _ = writeln!(out, "{}", "RUNS".bright_blue().bold());
    let runs = db.list_runs()?;
    if runs.is_empty() {
        let _ = writeln!(out, "  No runs yet.");
    }
    for run in runs.iter().take(10) {
        let status = match run.status {
            RunStatus::Done => run.status.as_str().green(),
            RunStatus::Failed => run.status.as_str().red(),
            RunStatus::Running => run.status.as_str().yellow(),
        };
        let _ = write!(
            out,
            "  {}  {:<7} {} sites, {} mapped, {} failed  {}",
            short_id(&run.id).cyan(),
            status,
            run.sites_total,
            run.sites_success,
            run.sites_failed,
            format_timestamp(run.started_at)
        );
        if let Some(error) = &run.error {
            let _ = write!(out, "  ({})", error.red());
        }
        out.push('\n');
    }

    let _ = writeln!(out, "\n{}", "GROUPS".bright_blue().bold());
    for status in [
        GroupStatus::Candidate,
        GroupStatus::Validated,
        GroupStatus::Rejected,
    ] {
        let count = db.list_groups(Some(status))?.len();
        let _ = writeln!(out, "  {:<10} {}", colored_group_status(status), count);
    }

    let _ = writeln!(out, "\n{}", "SITES".bright_blue().bold());
    let _ = writeln!(out, "  discovery:");
    for (status, count) in db.count_sites_by_discovery_status()? {
        let _ = writeln!(out, "    {:<18} {}", status, count);
    }
    let _ = writeln!(out, "  grouping:");
    for (status, count) in db.count_sites_by_grouping_status()? {
        let _ = writeln!(out, "    {:<18} {}", status, count);
    }

    Ok(out)
}

/// One group with its members and validation history.
pub fn render_group(db: &Database, group_id: i64) -> anyhow::Result<String> {
    let group = db
        .get_group(group_id)?
        .ok_or_else(|| anyhow!("Group {} not found", group_id))?;

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} {}  [{}]",
        "GROUP".bright_blue().bold(),
        group.id.to_string().cyan(),
        colored_group_status(group.status)
    );
    let _ = writeln!(out, "  listing:   {}", group.listing_template.bright_white());
    let _ = writeln!(out, "  detail:    {}", group.detail_template.bright_white());
    let _ = writeln!(out, "  signature: {}", group.signature_hash);
    let _ = writeln!(out, "  size:      {}", group.size);

    let _ = writeln!(out, "\n{}", "MEMBERS".bright_blue().bold());
    let members = db.get_member_sites(group.id)?;
    if members.is_empty() {
        let _ = writeln!(out, "  none");
    }
    for site in &members {
        let marker = if group.representative_site_id == Some(site.id) {
            "★".yellow().to_string()
        } else {
            " ".to_string()
        };
        let _ = writeln!(
            out,
            "  {} {:>5}  {:<40} {}",
            marker,
            site.id,
            site.domain,
            site.name
        );
    }

    let _ = writeln!(out, "\n{}", "VALIDATIONS".bright_blue().bold());
    let validations = db.get_validations(group.id)?;
    if validations.is_empty() {
        let _ = writeln!(out, "  none");
    }
    for validation in &validations {
        let verdict = if validation.is_valid {
            "accept".green()
        } else {
            "reject".red()
        };
        let _ = writeln!(
            out,
            "  {}  {:<6} {} ({}): {}",
            format_timestamp(validation.created_at),
            validation.source.as_str(),
            verdict,
            validation.confidence,
            validation.reasoning
        );
    }

    Ok(out)
}

fn print_divider() {
    println!("{}", "═".repeat(60).bright_blue().bold());
}

fn print_prompt(msg: &str) -> io::Result<String> {
    print!("{} ", msg.bright_cyan().bold());
    io::stdout().flush()?;
    let mut response = String::new();
    io::stdin().read_line(&mut response)?;
    Ok(response.trim().to_lowercase())
}

fn print_grouping_summary(summary: &GroupingSummary) {
    println!("{}", "GROUPING".bright_blue().bold());
    println!(
        "  {} eligible, {} ineligible, {} ignored",
        summary.eligible_sites.to_string().cyan(),
        summary.ineligible_sites,
        summary.ignored_sites
    );
    println!(
        "  {} groups created, {} re-formed",
        summary.groups_created.to_string().cyan(),
        summary.groups_reformed
    );
    println!(
        "  {} members added, {} moved, {} unchanged",
        summary.members_added, summary.members_moved, summary.members_unchanged
    );
    if !summary.group_ids.is_empty() {
        let ids: Vec<String> = summary.group_ids.iter().map(i64::to_string).collect();
        println!("  groups touched: {}", ids.join(", "));
    }
}

fn print_run_summary(summary: &RunSummary) {
    let status = match summary.status {
        RunStatus::Done => summary.status.as_str().green().bold(),
        _ => summary.status.as_str().red().bold(),
    };
    println!("{} Run {} {}", "→".blue(), summary.run_id.cyan(), status);
    println!(
        "  {} mapped, {} failed, {} skipped",
        summary.sites_success.to_string().green(),
        summary.sites_failed.to_string().red(),
        summary.sites_skipped
    );
    if let Some(error) = &summary.error {
        println!("  {} {}", "error:".red().bold(), error);
    }
}

fn print_outcome(outcome: &ValidationOutcome) {
    match outcome {
        ValidationOutcome::Validated { group_id, verdict } => println!(
            "{} Group {} validated ({}): {}",
            "✓".green().bold(),
            group_id,
            verdict.confidence,
            verdict.reasoning
        ),
        ValidationOutcome::Rejected {
            group_id,
            verdict,
            sites_released,
        } => println!(
            "{} Group {} rejected, {} site(s) released: {}",
            "✗".red().bold(),
            group_id,
            sites_released,
            verdict.reasoning
        ),
        ValidationOutcome::Abstained { group_id, reason } => println!(
            "{} Group {} left as candidate, validator unavailable: {}",
            "⚠".yellow().bold(),
            group_id,
            reason
        ),
    }
}

fn build_validator(config: &Config) -> anyhow::Result<AgentValidator> {
    let api_key = config.validator_api_key().ok_or_else(|| {
        anyhow!(
            "Environment variable {} is not set",
            config.validator.api_key_env
        )
    })?;
    Ok(AgentValidator::new(
        &config.validator.endpoint,
        &config.validator.model,
        &api_key,
        config.validator_timeout(),
    )?)
}

fn progress_reporter(pb: ProgressBar) -> RunProgressCallback {
    Arc::new(move |event: RunEvent| match event {
        RunEvent::SiteStarted { domain, .. } => pb.set_message(domain),
        RunEvent::Retrying {
            domain,
            attempt,
            delay,
            error,
        } => pb.println(format!(
            "  {} {} attempt {} failed ({}), retrying in {:.1}s",
            "↻".yellow(),
            domain,
            attempt,
            error,
            delay.as_secs_f32()
        )),
        RunEvent::SiteMapped {
            domain,
            urls,
            eligible,
        } => {
            pb.inc(1);
            let marker = if eligible {
                "✓".green().bold()
            } else {
                "○".blue().bold()
            };
            pb.println(format!("  {} {} ({} URLs)", marker, domain, urls));
        }
        RunEvent::SiteFailed { domain, error } => {
            pb.inc(1);
            pb.println(format!("  {} {}: {}", "✗".red().bold(), domain, error));
        }
        RunEvent::SiteSkipped { .. } => pb.inc(1),
    })
}

// Command handlers

pub fn handle_init(args: &ArgMatches, config_path: &Path) -> anyhow::Result<()> {
    print_divider();
    println!("{}", "  LOTMAP INITIALIZATION".bright_white().bold());
    print_divider();
    println!();

    let force = args.get_flag("force");

    let mut write_config = true;
    if config_path.exists() && !force {
        println!("{}", "⚠ WARNING".yellow().bold());
        println!("Configuration file already exists:");
        println!(
            "  {} {}",
            "•".yellow(),
            config_path.display().to_string().bright_white()
        );
        println!();

        let response = print_prompt("Overwrite it with the defaults? [y/N]:")?;
        println!();
        write_config = response == "y" || response == "yes";
        if !write_config {
            println!("{} Keeping existing configuration", "→".blue());
        }
    }

    let config = if write_config {
        let config = Config::default();
        config.save(config_path)?;
        println!(
            "{} Configuration written: {}",
            "✓".green().bold(),
            config_path.display().to_string().bright_white()
        );
        config
    } else {
        Config::load(config_path)?
    };

    let db_path = config.database_path();
    if Database::exists(&db_path) {
        let overwrite = if force {
            true
        } else {
            println!("{}", "⚠ WARNING".yellow().bold());
            println!("Database already exists at:");
            println!(
                "  {} {}",
                "•".yellow(),
                db_path.display().to_string().bright_white()
            );
            println!();
            let response = print_prompt("Would you like to overwrite it? [y/N]:")?;
            println!();
            response == "y" || response == "yes"
        };

        if overwrite {
            Database::drop(&db_path)?;
            println!("{} Existing database removed", "✓".green().bold());
        } else {
            println!("{} Keeping existing database", "→".blue());
        }
    }

    if !Database::exists(&db_path) {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        println!("{} Creating database...", "→".blue());
        Database::new(&db_path)?;
    }

    println!();
    print_divider();
    println!("{}", "  INITIALIZATION COMPLETE".green().bold());
    print_divider();
    println!();
    println!(
        "{} Config: {}",
        "✓".green().bold(),
        config_path.display().to_string().bright_white()
    );
    println!(
        "{} Database: {}",
        "✓".green().bold(),
        db_path.display().to_string().bright_white()
    );
    println!(
        "{} Mapper key read from ${}, validator key from ${}",
        "ℹ".blue(),
        config.mapper.api_key_env,
        config.validator.api_key_env
    );
    println!();
    Ok(())
}

pub fn handle_sites_import(args: &ArgMatches, config: &Config) -> anyhow::Result<()> {
    let file = args
        .get_one::<PathBuf>("FILE")
        .ok_or_else(|| anyhow!("A site list is required"))?;
    let db = open_database(config)?;

    let records = load_sites(file)
        .with_context(|| format!("Failed to read site list {}", file.display()))?;
    let summary = import_sites(&db, &records)?;

    println!(
        "{} Imported {} site(s) from {}",
        "✓".green().bold(),
        summary.site_ids.len().to_string().cyan(),
        file.display()
    );
    if summary.skipped > 0 {
        println!(
            "{} Skipped {} row(s) with an invalid domain",
            "⚠".yellow().bold(),
            summary.skipped
        );
    }
    Ok(())
}

pub fn handle_sites_list(args: &ArgMatches, config: &Config) -> anyhow::Result<()> {
    let db = open_database(config)?;
    let sites = match args.get_one::<String>("status") {
        Some(raw) => {
            let status = DiscoveryStatus::parse(raw)
                .ok_or_else(|| anyhow!("Unknown discovery status '{}'", raw))?;
            db.list_sites_by_discovery_status(status)?
        }
        None => db.list_sites()?,
    };
    print!("{}", render_sites(&sites));
    Ok(())
}

pub async fn handle_map(args: &ArgMatches, config: &Config) -> anyhow::Result<()> {
    let db = open_database(config)?;
    let site_ids = select_sites(
        &db,
        args.get_one::<String>("sites").map(String::as_str),
        args.get_flag("all"),
    )?;
    if site_ids.is_empty() {
        println!("{} No sites to map", "→".blue());
        return Ok(());
    }

    let concurrency = args
        .get_one::<usize>("concurrency")
        .copied()
        .unwrap_or(config.run.concurrency);
    if concurrency == 0 {
        bail!("--concurrency must be at least 1");
    }
    let rate_limit = args
        .get_one::<u32>("rate-limit")
        .copied()
        .unwrap_or(config.run.rate_limit);

    let api_key = config.mapper_api_key().ok_or_else(|| {
        anyhow!(
            "Environment variable {} is not set",
            config.mapper.api_key_env
        )
    })?;
    let mapper = Arc::new(FirecrawlMapper::new(&config.mapper.endpoint, Some(api_key))?);
    let validator = if args.get_flag("validate") {
        Some(build_validator(config)?)
    } else {
        None
    };

    println!("\n🗺  Mapping {} site(s)", site_ids.len());
    println!("Concurrency: {}", concurrency);
    if rate_limit == 0 {
        println!("Rate limit: none\n");
    } else {
        println!("Rate limit: {} req/min\n", rate_limit);
    }

    let pb = ProgressBar::new(site_ids.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );
    pb.enable_steady_tick(Duration::from_millis(100));

    // Ctrl-C stops new sites from starting; in-flight fetches finish.
    let abort = Arc::new(AtomicBool::new(false));
    let abort_signal = abort.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            abort_signal.store(true, Ordering::SeqCst);
        }
    });

    let options = RunOptions {
        site_ids,
        concurrency,
        rate_limit,
        fetch: config.fetch_options(),
        retry: config.retry_policy(),
        abort: Some(abort),
        progress: Some(progress_reporter(pb.clone())),
    };
    let db = Arc::new(Mutex::new(db));

    let run = if args.get_flag("no-group") {
        let run = run_map(db, mapper, options).await;
        pb.finish_and_clear();
        run?
    } else {
        let pipeline = run_pipeline(
            db,
            mapper,
            validator.as_ref().map(|v| v as &dyn Validator),
            options,
        )
        .await;
        pb.finish_and_clear();
        let pipeline = pipeline?;

        println!();
        print_run_summary(&pipeline.run);
        if let Some(grouping) = &pipeline.grouping {
            println!();
            print_grouping_summary(grouping);
        }
        if !pipeline.validations.is_empty() {
            println!();
            for outcome in &pipeline.validations {
                print_outcome(outcome);
            }
        }
        return finish_run_report(&pipeline.run);
    };

    println!();
    print_run_summary(&run);
    finish_run_report(&run)
}

fn finish_run_report(run: &RunSummary) -> anyhow::Result<()> {
    match run.status {
        RunStatus::Done => Ok(()),
        _ => Err(anyhow!(
            "Run {} failed: {}",
            run.run_id,
            run.error.as_deref().unwrap_or("unknown error")
        )),
    }
}

pub fn handle_group(args: &ArgMatches, config: &Config) -> anyhow::Result<()> {
    let mut db = open_database(config)?;
    let run_id = select_run(&db, args.get_one::<String>("run").map(String::as_str))?;

    println!("{} Grouping run {}", "→".blue(), run_id.cyan());
    let summary = run_grouping(&mut db, &run_id)?;
    print_grouping_summary(&summary);
    Ok(())
}

pub async fn handle_validate(args: &ArgMatches, config: &Config) -> anyhow::Result<()> {
    let mut db = open_database(config)?;
    let validator = build_validator(config)?;

    let group_ids: Vec<i64> = match args.get_one::<i64>("group") {
        Some(id) => vec![*id],
        None => db
            .list_groups(Some(GroupStatus::Candidate))?
            .iter()
            .filter(|g| g.size > 0)
            .map(|g| g.id)
            .collect(),
    };
    if group_ids.is_empty() {
        println!("{} No candidate groups to validate", "→".blue());
        return Ok(());
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}")?);
    spinner.enable_steady_tick(Duration::from_millis(100));

    for group_id in group_ids {
        spinner.set_message(format!("Validating group {}", group_id));
        let outcome = validate_group(&mut db, &validator, group_id).await;
        spinner.suspend(|| match &outcome {
            Ok(outcome) => print_outcome(outcome),
            Err(e) => println!("{} Group {}: {}", "✗".red().bold(), group_id, e),
        });
    }
    spinner.finish_and_clear();
    Ok(())
}

pub fn handle_approve(args: &ArgMatches, config: &Config) -> anyhow::Result<()> {
    let group_id = *args
        .get_one::<i64>("GROUP_ID")
        .ok_or_else(|| anyhow!("A group id is required"))?;
    let mut db = open_database(config)?;

    let outcome = approve_group(
        &mut db,
        group_id,
        args.get_one::<String>("note").map(String::as_str),
    )?;
    print_outcome(&outcome);
    Ok(())
}

pub fn handle_reject(args: &ArgMatches, config: &Config) -> anyhow::Result<()> {
    let group_id = *args
        .get_one::<i64>("GROUP_ID")
        .ok_or_else(|| anyhow!("A group id is required"))?;
    let mut db = open_database(config)?;

    let outcome = reject_group(
        &mut db,
        group_id,
        args.get_one::<String>("note").map(String::as_str),
    )?;
    print_outcome(&outcome);
    Ok(())
}

pub fn handle_ignore(args: &ArgMatches, config: &Config) -> anyhow::Result<()> {
    let site_id = *args
        .get_one::<i64>("SITE_ID")
        .ok_or_else(|| anyhow!("A site id is required"))?;
    let mut db = open_database(config)?;

    if args.get_flag("undo") {
        unignore_site(&db, site_id)?;
        println!("{} Site {} is eligible for grouping again", "✓".green().bold(), site_id);
    } else {
        ignore_site(&mut db, site_id)?;
        println!("{} Site {} ignored", "✓".green().bold(), site_id);
    }
    Ok(())
}

pub fn handle_status(config: &Config) -> anyhow::Result<()> {
    let db = open_database(config)?;
    print!("{}", render_status(&db)?);
    Ok(())
}

pub fn handle_show_group(args: &ArgMatches, config: &Config) -> anyhow::Result<()> {
    let group_id = *args
        .get_one::<i64>("GROUP_ID")
        .ok_or_else(|| anyhow!("A group id is required"))?;
    let db = open_database(config)?;
    print!("{}", render_group(&db, group_id)?);
    Ok(())
}

pub fn handle_export(args: &ArgMatches, config: &Config) -> anyhow::Result<()> {
    let db = open_database(config)?;
    let format = args
        .get_one::<String>("format")
        .and_then(|f| ExportFormat::parse(f))
        .unwrap_or(ExportFormat::Json);

    let data = gather_export_data(&db, args.get_flag("include-candidates"))?;
    let content = render_export(&data, format)?;

    match args.get_one::<PathBuf>("output") {
        Some(path) => {
            save_export(&content, path)?;
            println!(
                "{} Exported {} group(s), {} site(s) to {}",
                "✓".green().bold(),
                data.total_groups.to_string().cyan(),
                data.total_sites.to_string().cyan(),
                path.display().to_string().bright_white()
            );
        }
        None => print!("{}", content),
    }
    Ok(())
}
