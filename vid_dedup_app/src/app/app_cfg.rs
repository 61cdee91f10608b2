//! The configuration record owned by the application. Everything that was an
//! environment lookup or a process-wide default lives here as a plain value.

use std::path::PathBuf;

/// How much the app prints to stderr.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReportVerbosity {
    Quiet,
    Default,
    Verbose,
}

#[derive(Clone, Debug)]
pub struct AppCfg {
    /// Base URL of the Hydrus client API.
    pub api_url: String,
    /// Access key for the client API.
    pub api_key: String,
    /// Extra query predicates appended to the built-in video search.
    pub query: Vec<String>,
    /// Similarity threshold in percent, 0..=100.
    pub threshold: u32,
    /// Gate on the query-side match fraction only (legacy behavior).
    pub one_sided: bool,
    pub skip_hashing: bool,
    pub skip_search: bool,
    /// Forget which files have been compared, keeping their fingerprints.
    pub clear_search_cache: bool,
    /// Delete every fingerprint and start over.
    pub clear_cache: bool,
    /// Path to a CA bundle for the API connection.
    pub verify_cert: Option<PathBuf>,
    /// Worker pool size for hashing.
    pub job_count: usize,
    /// Directory holding the fingerprint store and index snapshot.
    pub db_dir: PathBuf,
    pub verbosity: ReportVerbosity,
}

/// The directory for persistent state: `--db-dir` flag, then the
/// `DEDUP_DATABASE_DIR` environment variable, then the per-user data
/// directory.
pub fn resolve_db_dir(flag: Option<PathBuf>) -> PathBuf {
    if let Some(dir) = flag {
        return dir;
    }
    if let Some(dir) = std::env::var_os("DEDUP_DATABASE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vid_dedup")
}

pub const STORE_FILE_NAME: &str = "fingerprints.db";
pub const INDEX_FILE_NAME: &str = "index.snapshot";
