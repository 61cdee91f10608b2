use std::path::PathBuf;

use clap::{value_parser, Arg, ArgAction, Command};

use crate::app::app_cfg::{resolve_db_dir, AppCfg, ReportVerbosity};

//connection
const API_URL: &str = "Hydrus client API URL";
const API_KEY: &str = "Hydrus client API access key";
const VERIFY_CERT: &str = "CA bundle path";

//file selection
const QUERY: &str = "Custom query";

//search configuration
const THRESHOLD: &str = "Similarity threshold";
const ONE_SIDED: &str = "One-sided gate";

//phase toggles
const SKIP_HASHING: &str = "Skip hashing";
const SKIP_SEARCH: &str = "Skip search";
const CLEAR_SEARCH_CACHE: &str = "Clear search cache";
const CLEAR_CACHE: &str = "Clear entire cache";

//resources
const JOB_COUNT: &str = "Job count";
const DB_DIR: &str = "Database directory";

//verbosity
const VERBOSITY_QUIET: &str = "Quiet";
const VERBOSITY_VERBOSE: &str = "Verbose";

fn build_command() -> Command {
    Command::new("vid_dedup")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Finds potential duplicate videos in a Hydrus library and reports them through the client API for manual adjudication.")
        .arg(
            Arg::new(API_URL)
                .long("api-url")
                .env("HYDRUS_API_URL")
                .default_value("https://localhost:45869")
                .help("URL of the Hydrus client API."),
        )
        .arg(
            Arg::new(API_KEY)
                .long("api-key")
                .env("HYDRUS_API_KEY")
                .required(true)
                .help("Access key for the Hydrus client API."),
        )
        .arg(
            Arg::new(VERIFY_CERT)
                .long("verify-cert")
                .value_parser(value_parser!(PathBuf))
                .help("Path to a CA bundle used to verify the API's TLS certificate."),
        )
        .arg(
            Arg::new(QUERY)
                .long("query")
                .action(ArgAction::Append)
                .help("Extra Hydrus tag predicate to narrow which files are processed. May be given multiple times."),
        )
        .arg(
            Arg::new(THRESHOLD)
                .long("threshold")
                .value_parser(value_parser!(u32))
                .default_value("75")
                .help("Similarity threshold in percent. A pair is reported when both videos match at least this fraction of their own frames; 100 means near-identical."),
        )
        .arg(
            Arg::new(ONE_SIDED)
                .long("one-sided")
                .action(ArgAction::SetTrue)
                .help("Gate pairs on the query side's match fraction only, as older versions did. Finds clips embedded in longer videos at the cost of more false positives."),
        )
        .arg(
            Arg::new(SKIP_HASHING)
                .long("skip-hashing")
                .action(ArgAction::SetTrue)
                .help("Skip perceptual hashing and only search the already-cached fingerprints."),
        )
        .arg(
            Arg::new(SKIP_SEARCH)
                .long("skip-search")
                .action(ArgAction::SetTrue)
                .help("Hash new files but do not search for duplicates."),
        )
        .arg(
            Arg::new(CLEAR_SEARCH_CACHE)
                .long("clear-search-cache")
                .action(ArgAction::SetTrue)
                .help("Forget which files have already been compared, keeping their fingerprints. The next search covers the whole library again."),
        )
        .arg(
            Arg::new(CLEAR_CACHE)
                .long("clear-cache")
                .action(ArgAction::SetTrue)
                .help("Delete every cached fingerprint and the search index."),
        )
        .arg(
            Arg::new(JOB_COUNT)
                .long("job-count")
                .value_parser(value_parser!(usize))
                .help("Number of worker threads for perceptual hashing. Defaults to the logical CPU count."),
        )
        .arg(
            Arg::new(DB_DIR)
                .long("db-dir")
                .value_parser(value_parser!(PathBuf))
                .help("Directory for the fingerprint database. Defaults to $DEDUP_DATABASE_DIR, then the per-user data directory."),
        )
        .arg(
            Arg::new(VERBOSITY_QUIET)
                .long("quiet")
                .short('q')
                .action(ArgAction::SetTrue)
                .conflicts_with(VERBOSITY_VERBOSE)
                .help("Only print warnings and errors."),
        )
        .arg(
            Arg::new(VERBOSITY_VERBOSE)
                .long("verbose")
                .short('v')
                .action(ArgAction::SetTrue)
                .help("Print per-file detail."),
        )
}

pub fn parse_args() -> eyre::Result<AppCfg> {
    parse_args_from(std::env::args_os())
}

fn parse_args_from<I, T>(args: I) -> eyre::Result<AppCfg>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let matches = build_command().get_matches_from(args);

    let threshold = *matches.get_one::<u32>(THRESHOLD).expect("defaulted");
    if threshold > 100 {
        return Err(eyre::Report::msg(
            "similarity threshold must be between 0 and 100",
        ));
    }

    let verbosity = if matches.get_flag(VERBOSITY_QUIET) {
        ReportVerbosity::Quiet
    } else if matches.get_flag(VERBOSITY_VERBOSE) {
        ReportVerbosity::Verbose
    } else {
        ReportVerbosity::Default
    };

    //blank query terms are dropped rather than sent to the host
    let query = matches
        .get_many::<String>(QUERY)
        .unwrap_or_default()
        .filter(|term| !term.trim().is_empty())
        .cloned()
        .collect();

    Ok(AppCfg {
        api_url: matches
            .get_one::<String>(API_URL)
            .expect("defaulted")
            .clone(),
        api_key: matches
            .get_one::<String>(API_KEY)
            .expect("required")
            .clone(),
        query,
        threshold,
        one_sided: matches.get_flag(ONE_SIDED),
        skip_hashing: matches.get_flag(SKIP_HASHING),
        skip_search: matches.get_flag(SKIP_SEARCH),
        clear_search_cache: matches.get_flag(CLEAR_SEARCH_CACHE),
        clear_cache: matches.get_flag(CLEAR_CACHE),
        verify_cert: matches.get_one::<PathBuf>(VERIFY_CERT).cloned(),
        job_count: matches
            .get_one::<usize>(JOB_COUNT)
            .copied()
            .unwrap_or_else(num_cpus::get),
        db_dir: resolve_db_dir(matches.get_one::<PathBuf>(DB_DIR).cloned()),
        verbosity,
    })
}
