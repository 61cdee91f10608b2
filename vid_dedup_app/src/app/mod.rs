use std::error::Error;

use vid_dedup_lib::{
    CancelToken, HashStore, Pipeline, PipelineCfg, PipelineReport, SimilarityCfg,
};

mod app_cfg;
mod arg_parse;
mod hydrus_client;
mod progress;
mod vpdq_builder;

use app_cfg::{AppCfg, ReportVerbosity, INDEX_FILE_NAME, STORE_FILE_NAME};
use hydrus_client::HydrusClient;
use progress::TerminalProgress;
use vpdq_builder::VpdqBuilder;

//store writes hit the disk at least this often (in modified entries)
const STORE_SAVE_THRESHOLD: u32 = 256;

pub fn run_app() -> i32 {
    let cfg = match arg_parse::parse_args() {
        Ok(cfg) => cfg,
        //usage errors surface before logging is configured
        #[allow(clippy::print_stderr)]
        Err(e) => {
            eprintln!("{e}");
            return 2;
        }
    };
    configure_logs(cfg.verbosity);

    match run_app_inner(&cfg) {
        Ok(()) => 0,
        Err(fatal_error) => {
            print_fatal_err(&fatal_error, cfg.verbosity);
            1
        }
    }
}

fn run_app_inner(cfg: &AppCfg) -> eyre::Result<()> {
    info!("vid_dedup {}", env!("CARGO_PKG_VERSION"));

    if !ffmpeg_frame_stream::ffmpeg_and_ffprobe_are_callable() {
        return Err(eyre::Report::msg(
            "ffmpeg and ffprobe must be installed and visible on the command line",
        ));
    }

    let store_path = cfg.db_dir.join(STORE_FILE_NAME);
    let index_path = cfg.db_dir.join(INDEX_FILE_NAME);

    let store = HashStore::open(&store_path, STORE_SAVE_THRESHOLD)?;
    if store.len() > 0 {
        info!(
            "found existing fingerprint database at {} with {} entries",
            store_path.display(),
            store.len()
        );
    }

    if cfg.clear_cache {
        store.clear()?;
        if index_path.exists() {
            std::fs::remove_file(&index_path)?;
        }
        info!("cleared the fingerprint cache");
    } else if cfg.clear_search_cache {
        store.clear_search_progress()?;
        info!("cleared the search cache");
    }

    info!("connecting to Hydrus at {}", cfg.api_url);
    let client = HydrusClient::new(&cfg.api_url, &cfg.api_key, cfg.verify_cert.as_deref())?;
    client.verify_connection()?;

    //first Ctrl+C cancels cooperatively; a second one kills the process
    let cancel = CancelToken::new();
    let ctrlc_token = cancel.clone();
    ctrlc::set_handler(move || {
        if ctrlc_token.is_cancelled() {
            std::process::exit(130);
        }
        warn!("cancellation requested; finishing in-flight work");
        ctrlc_token.cancel();
    })?;

    let builder = VpdqBuilder::default();
    let pipeline_cfg = PipelineCfg {
        similarity: SimilarityCfg {
            threshold: cfg.threshold,
            one_sided: cfg.one_sided,
        },
        query: cfg.query.clone(),
        job_count: cfg.job_count,
        skip_hashing: cfg.skip_hashing,
        skip_search: cfg.skip_search,
        max_retries: vid_dedup_lib::DEFAULT_MAX_HOST_RETRIES,
        index_path,
    };

    let progress = TerminalProgress::new(cfg.verbosity);
    let pipeline = Pipeline::new(&client, &client, &builder, &store, pipeline_cfg);
    let report = pipeline.run(&cancel, &progress)?;
    drop(progress);

    print_summary(&report, &store);
    Ok(())
}

#[allow(clippy::print_stdout)]
fn print_summary(report: &PipelineReport, store: &HashStore) {
    if report.cancelled {
        println!("Run cancelled; progress so far is saved.");
    }
    println!(
        "{} files hashed ({} failed, {} skipped), {} searched, {} potential duplicate pairs sent to Hydrus.",
        report.hashed, report.failed, report.skipped, report.searched, report.pairs
    );

    //failed entries stay addressable for follow-up
    let mut failed_ids = Vec::new();
    store.for_each_entry(|entry| {
        if entry.flags.failed {
            failed_ids.push(entry.media_id.to_string());
        }
    });
    if !failed_ids.is_empty() {
        println!(
            "{} files could not be hashed; rerun with --verbose for their ids.",
            failed_ids.len()
        );
        for id in failed_ids {
            debug!("failed file: {id}");
        }
    }
}

fn print_fatal_err(fatal_err: &eyre::Report, verbosity: ReportVerbosity) {
    error!(target: "app-errorlog", "{}", fatal_err);

    if verbosity == ReportVerbosity::Verbose {
        let mut source: Option<&(dyn Error + 'static)> = fatal_err.source();
        while let Some(e) = source {
            error!(target: "app-errorlog", "    caused by: {}", e);
            source = e.source();
        }
    }
}

pub fn configure_logs(verbosity: ReportVerbosity) {
    use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};

    let mut cfg = ConfigBuilder::new();
    cfg.add_filter_ignore("store_transactions".to_string());

    let min_loglevel = match verbosity {
        ReportVerbosity::Quiet => LevelFilter::Warn,
        ReportVerbosity::Default => LevelFilter::Info,
        ReportVerbosity::Verbose => LevelFilter::Trace,
    };

    TermLogger::init(
        min_loglevel,
        cfg.build(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )
    .expect("TermLogger failed to initialize");
}
