use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use relval_core::config::{TcmsConfig, load_config};
use relval_core::wiki::{
    EventCriteria, MediaWikiClient, ReportItem, get_current_compose, get_validation_page,
    report_validation_results,
};

#[derive(Debug, Parser)]
#[command(
    name = "relval",
    version,
    about = "Report and inspect release validation results on the wiki"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "Config file (defaults to relval.toml)")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Show the current validation event pointer")]
    Current(CurrentArgs),
    #[command(about = "List the result rows of a validation page")]
    Rows(RowsArgs),
    #[command(name = "page-name", about = "Print the canonical page name for criteria")]
    PageName(PageNameArgs),
    #[command(about = "File one result on a validation page")]
    Report(ReportArgs),
}

#[derive(Debug, Args)]
struct CurrentArgs {
    #[arg(long, value_name = "DIST")]
    dist: Option<String>,
}

#[derive(Debug, Args)]
struct PageCriteriaArgs {
    #[arg(long, value_name = "N")]
    release: Option<String>,
    #[arg(long, value_name = "NAME")]
    milestone: Option<String>,
    #[arg(long, value_name = "ID")]
    compose: Option<String>,
    #[arg(
        long,
        value_name = "COMPOSE_ID",
        help = "Fully-qualified compose id; overrides the other criteria"
    )]
    cid: Option<String>,
    #[arg(long, value_name = "DIST")]
    dist: Option<String>,
}

impl PageCriteriaArgs {
    fn to_criteria(&self) -> EventCriteria {
        EventCriteria {
            release: self.release.clone().unwrap_or_default(),
            milestone: self.milestone.clone().unwrap_or_default(),
            compose: self.compose.clone().unwrap_or_default(),
            cid: self.cid.clone().unwrap_or_default(),
            dist: self.dist.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Args)]
struct RowsArgs {
    #[arg(long, value_name = "TYPE")]
    testtype: String,
    #[command(flatten)]
    criteria: PageCriteriaArgs,
}

#[derive(Debug, Args)]
struct PageNameArgs {
    #[arg(long, value_name = "TYPE")]
    testtype: String,
    #[command(flatten)]
    criteria: PageCriteriaArgs,
}

#[derive(Debug, Args)]
struct ReportArgs {
    #[arg(long, value_name = "TYPE")]
    testtype: String,
    #[arg(long, value_name = "NAME")]
    testcase: String,
    #[arg(long, value_name = "STATUS", help = "pass, fail, warn or inprogress")]
    status: String,
    #[arg(long, value_name = "HEADING")]
    section: Option<String>,
    #[arg(long, value_name = "NAME")]
    testname: Option<String>,
    #[arg(long, value_name = "ENV")]
    env: Option<String>,
    #[arg(long, value_name = "USER", help = "Defaults to the login username")]
    user: Option<String>,
    #[arg(long = "bug", value_name = "ID")]
    bugs: Vec<String>,
    #[arg(long, value_name = "TEXT")]
    comment: Option<String>,
    #[arg(long, help = "Mark the result as coming from automated testing")]
    bot: bool,
    #[arg(long, help = "File the result even if the user already reported one")]
    allow_dupe: bool,
    #[command(flatten)]
    criteria: PageCriteriaArgs,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from("relval.toml"));
    let config = load_config(&config_path)?;

    match cli.command {
        Commands::Current(args) => run_current(&config, args),
        Commands::Rows(args) => run_rows(&config, args),
        Commands::PageName(args) => run_page_name(&config, args),
        Commands::Report(args) => run_report(&config, args),
    }
}

fn run_current(config: &TcmsConfig, args: CurrentArgs) -> Result<()> {
    let dist = args.dist.unwrap_or_else(|| config.default_dist().to_string());
    let mut client = MediaWikiClient::new(config)?;
    let curr = get_current_compose(&mut client, config, &dist)?;
    if curr.is_empty() {
        bail!("no current validation event exists for dist {dist}");
    }
    println!("dist: {dist}");
    for key in ["full", "release", "milestone", "compose", "date"] {
        if let Some(value) = curr.get(key) {
            println!("{key}: {value}");
        }
    }
    Ok(())
}

fn run_rows(config: &TcmsConfig, args: RowsArgs) -> Result<()> {
    let mut client = MediaWikiClient::new(config)?;
    let mut page = get_validation_page(
        &mut client,
        config,
        &args.testtype,
        &args.criteria.to_criteria(),
    )?;
    println!("page: {}", page.name());

    let rows = page.get_resultrows(&mut client, config)?;
    println!("rows: {}", rows.len());
    for row in rows {
        println!("\n{} (section: {})", row.name, row.section);
        if row.testcase != row.name {
            println!("  testcase: {}", row.testcase);
        }
        for (env, results) in &row.results {
            if results.is_empty() {
                println!("  {env}: no results");
                continue;
            }
            for result in results {
                println!("  {env}: {result}");
            }
        }
    }
    Ok(())
}

fn run_page_name(config: &TcmsConfig, args: PageNameArgs) -> Result<()> {
    let mut client = MediaWikiClient::new(config)?;
    let page = get_validation_page(
        &mut client,
        config,
        &args.testtype,
        &args.criteria.to_criteria(),
    )?;
    println!("{}", page.name());
    Ok(())
}

fn run_report(config: &TcmsConfig, args: ReportArgs) -> Result<()> {
    let username =
        env::var("WIKI_USERNAME").context("WIKI_USERNAME is required to report results")?;
    let password =
        env::var("WIKI_PASSWORD").context("WIKI_PASSWORD is required to report results")?;

    let mut client = MediaWikiClient::new(config)?;
    client.login(username.trim(), password.trim())?;

    let criteria = args.criteria.to_criteria();
    let page = get_validation_page(&mut client, config, &args.testtype, &criteria)?;
    println!("page: {}", page.name());

    let item = ReportItem {
        testtype: args.testtype,
        release: criteria.release.clone(),
        milestone: criteria.milestone.clone(),
        compose: criteria.compose.clone(),
        testcase: args.testcase,
        section: args.section.unwrap_or_default(),
        testname: args.testname.unwrap_or_default(),
        env: args.env.unwrap_or_default(),
        status: args.status,
        user: args.user.unwrap_or_default(),
        bugs: args.bugs,
        comment: args.comment.unwrap_or_default(),
        bot: args.bot,
        cid: criteria.cid.clone(),
        dist: criteria.dist.clone(),
    };
    let (insufficients, dupes) =
        report_validation_results(&mut client, config, &[item], &username, args.allow_dupe)?;

    if !insufficients.is_empty() {
        bail!(
            "the given criteria did not identify exactly one test row; \
             add --section, --testname or --env to narrow it down"
        );
    }
    if let Some(dupe) = dupes.first() {
        println!(
            "duplicate: {} already reported a result for {} in environment {}",
            dupe.user, dupe.testname, dupe.env
        );
        println!("pass --allow-dupe to file it anyway");
        return Ok(());
    }
    println!("result filed");
    Ok(())
}
