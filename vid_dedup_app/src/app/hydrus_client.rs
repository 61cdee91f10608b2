//! The Hydrus client API implementation of the core's host traits: listing
//! files by query, streaming file bytes, and posting potential-duplicate
//! relationships.

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use vid_dedup_lib::{HostClient, HostError, MediaId, PairReporter};

const ACCESS_KEY_HEADER: &str = "Hydrus-Client-API-Access-Key";

//Hydrus DuplicateStatus value for "potential duplicates"
const POTENTIAL_DUPLICATES: u32 = 0;

//Predicates always applied when listing files, matching what the Hydrus
//duplicates page itself considers. system:filetype tags are inconsistent
//across clients, hence the catch-all list.
const BASE_QUERY: [&str; 3] = [
    "system:filetype=video, gif, apng",
    "system:has duration",
    "system:file service is not currently in trash",
];

/// A failure constructing the client or verifying the connection; fatal at
/// startup, before any pipeline work begins.
#[derive(Error, Debug)]
pub enum HydrusClientError {
    #[error("could not read CA bundle {path}: {src}")]
    CaBundle {
        path: String,
        #[source]
        src: std::io::Error,
    },

    #[error("could not build http client: {0}")]
    Http(#[from] reqwest::Error),

    #[error("could not verify the Hydrus connection: {0}")]
    Verify(HostError),
}

#[derive(Deserialize)]
struct SearchFilesResponse {
    hashes: Vec<String>,
}

#[derive(Deserialize)]
struct ApiVersionResponse {
    version: u64,
    hydrus_version: u64,
}

/// A blocking client for the Hydrus client API.
pub struct HydrusClient {
    http: Client,
    api_url: String,
}

impl HydrusClient {
    /// Build a client for `api_url` with the given access key. When
    /// `verify_cert` names a CA bundle, only that bundle is trusted.
    pub fn new(
        api_url: &str,
        access_key: &str,
        verify_cert: Option<&Path>,
    ) -> Result<Self, HydrusClientError> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut key_value = reqwest::header::HeaderValue::from_str(access_key)
            .map_err(|_| HydrusClientError::Verify(HostError::Permanent(
                "access key contains characters not allowed in a header".to_string(),
            )))?;
        key_value.set_sensitive(true);
        headers.insert(ACCESS_KEY_HEADER, key_value);

        let mut builder = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            //file downloads can legitimately take minutes
            .timeout(None);

        if let Some(path) = verify_cert {
            let pem = std::fs::read(path).map_err(|src| HydrusClientError::CaBundle {
                path: path.display().to_string(),
                src,
            })?;
            let certificate = reqwest::Certificate::from_pem(&pem)?;
            builder = builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(certificate);
        } else {
            //Hydrus serves a self-signed certificate by default
            builder = builder.danger_accept_invalid_certs(true);
        }

        Ok(Self {
            http: builder.build()?,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    /// Check the connection and log the API versions. Run once at startup.
    pub fn verify_connection(&self) -> Result<(), HydrusClientError> {
        let response = self
            .get("/api_version", &[])
            .map_err(HydrusClientError::Verify)?;
        let versions: ApiVersionResponse = response
            .json()
            .map_err(|e| HydrusClientError::Verify(HostError::Permanent(e.to_string())))?;
        info!(
            "connected to Hydrus {} (client API v{})",
            versions.hydrus_version, versions.version
        );

        self.get("/verify_access_key", &[])
            .map_err(HydrusClientError::Verify)?;
        Ok(())
    }

    fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Response, HostError> {
        let url = format!("{}{path}", self.api_url);
        let response = self
            .http
            .get(&url)
            .query(query)
            .send()
            .map_err(classify_request_error)?;
        check_status(response)
    }

    fn post_json(&self, path: &str, body: &serde_json::Value) -> Result<Response, HostError> {
        let url = format!("{}{path}", self.api_url);
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .map_err(classify_request_error)?;
        check_status(response)
    }
}

impl HostClient for HydrusClient {
    fn list_media(&self, query: &[String]) -> Result<Vec<MediaId>, HostError> {
        let mut tags: Vec<&str> = BASE_QUERY.to_vec();
        tags.extend(query.iter().map(String::as_str));
        let tags_json =
            serde_json::to_string(&tags).map_err(|e| HostError::Permanent(e.to_string()))?;

        let response = self.get(
            "/get_files/search_files",
            &[
                ("tags", tags_json),
                ("return_hashes", "true".to_string()),
                ("return_file_ids", "false".to_string()),
            ],
        )?;

        let parsed: SearchFilesResponse = response
            .json()
            .map_err(|e| HostError::Permanent(format!("bad search_files response: {e}")))?;

        parsed
            .hashes
            .iter()
            .map(|hash| {
                hex::decode(hash)
                    .map(MediaId::from_bytes)
                    .map_err(|e| HostError::Permanent(format!("bad file hash from host: {e}")))
            })
            .collect()
    }

    fn fetch_bytes(&self, media_id: &MediaId) -> Result<Box<dyn Read + Send>, HostError> {
        let response = self.get("/get_files/file", &[("hash", media_id.to_string())])?;
        Ok(Box::new(response))
    }
}

impl PairReporter for HydrusClient {
    fn report_potential_duplicate(
        &self,
        a: &MediaId,
        b: &MediaId,
        _score: f64,
    ) -> Result<(), HostError> {
        let body = serde_json::json!({
            "relationships": [{
                "hash_a": a.to_string(),
                "hash_b": b.to_string(),
                "relationship": POTENTIAL_DUPLICATES,
                "do_default_content_merge": true,
            }]
        });
        self.post_json("/manage_file_relationships/set_file_relationships", &body)?;
        Ok(())
    }
}

fn classify_request_error(error: reqwest::Error) -> HostError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        HostError::Transient(error.to_string())
    } else {
        HostError::Permanent(error.to_string())
    }
}

fn check_status(response: Response) -> Result<Response, HostError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let detail = format!("{status} from {}", response.url());
    if is_transient_status(status) {
        Err(HostError::Transient(detail))
    } else {
        Err(HostError::Permanent(detail))
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}
