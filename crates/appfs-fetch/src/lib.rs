//! # appfs-fetch
//!
//! HTTPS fetch pipeline for AppFS (spec.md component C2).
//!
//! Two operations: `fetch_blob` pulls a single content-addressed file into
//! the local [`appfs_cas::CasStore`], verifying its SHA-1 on the wire before
//! it becomes visible; `fetch_index` pulls a site's signed package index and
//! verifies its signature against a pre-provisioned public key before
//! returning the payload for ingestion. Both retry transient failures with
//! exponential backoff; both digest and signature failures are treated as
//! permanent and are never retried past their own verification.
//!
//! Concurrent requests for the same blob hash are coalesced: only one HTTP
//! GET is ever in flight per hash at a time, and every other caller blocks
//! on that single fetch rather than starting its own.

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use appfs_cas::{hash_to_hex, CasStore, Sha1Hash};
use base64::Engine;
use dashmap::DashMap;
use ring::signature::{self, UnparsedPublicKey};
use thiserror::Error;
use tracing::{instrument, warn};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("fetch of {hash} failed: {reason}")]
    FetchFailed { hash: String, reason: String },

    #[error("index signature verification failed for {hostname}")]
    SignatureInvalid { hostname: String },

    #[error("malformed signed index document from {hostname}: {reason}")]
    MalformedIndexDocument { hostname: String, reason: String },

    #[error(transparent)]
    Cas(#[from] appfs_cas::CasError),
}

pub type Result<T> = std::result::Result<T, FetchError>;

/// RSA PKCS#1 v1.5 with SHA-256, the signature scheme index documents are
/// signed with. A site's public key is an RSA public key in DER form.
const INDEX_SIGNATURE_ALGORITHM: &signature::RsaParameters =
    &signature::RSA_PKCS1_2048_8192_SHA256;

pub struct Fetcher {
    http: reqwest::blocking::Client,
    cas: Arc<CasStore>,
    inflight: DashMap<Sha1Hash, Arc<Mutex<()>>>,
}

impl Fetcher {
    pub fn new(cas: Arc<CasStore>) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(concat!("appfsd/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| FetchError::FetchFailed {
                hash: String::new(),
                reason: format!("building HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            cas,
            inflight: DashMap::new(),
        })
    }

    /// Ensure the blob with SHA-1 `hash` is present locally, fetching it
    /// from `https://<hostname>/appfs/sha1/<hh>/<rest>` if absent.
    #[instrument(skip(self), fields(hash = %hash_to_hex(hash)))]
    pub fn fetch_blob(&self, hostname: &str, hash: &Sha1Hash) -> Result<()> {
        if self.cas.has(hash) {
            return Ok(());
        }

        let lock = self
            .inflight
            .entry(*hash)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().unwrap();

        // Another caller may have completed the fetch while we waited.
        if self.cas.has(hash) {
            return Ok(());
        }

        let hex = hash_to_hex(hash);
        let url = format!(
            "https://{hostname}/appfs/sha1/{}/{}",
            &hex[..2],
            &hex[2..]
        );

        let bytes = self.get_with_retry(&url).map_err(|reason| FetchError::FetchFailed {
            hash: hex.clone(),
            reason,
        })?;

        self.cas.insert_atomic(&bytes[..], hash)?;
        self.inflight.remove(hash);
        Ok(())
    }

    /// Fetch and verify `https://<hostname>/appfs/index`, returning the
    /// verified payload text. Rejects the response outright on signature
    /// failure without touching any caller-visible state.
    #[instrument(skip(self, public_key_der), fields(hostname))]
    pub fn fetch_index(&self, hostname: &str, public_key_der: &[u8]) -> Result<String> {
        let url = format!("https://{hostname}/appfs/index");
        let bytes = self
            .get_with_retry(&url)
            .map_err(|reason| FetchError::FetchFailed {
                hash: String::new(),
                reason,
            })?;

        let (signature, payload) = split_signed_document(&bytes).ok_or_else(|| {
            FetchError::MalformedIndexDocument {
                hostname: hostname.to_string(),
                reason: "missing signature header line".to_string(),
            }
        })?;

        let public_key = UnparsedPublicKey::new(INDEX_SIGNATURE_ALGORITHM, public_key_der);
        if public_key.verify(payload, &signature).is_err() {
            warn!(hostname, "index signature verification failed");
            return Err(FetchError::SignatureInvalid {
                hostname: hostname.to_string(),
            });
        }

        String::from_utf8(payload.to_vec()).map_err(|e| FetchError::MalformedIndexDocument {
            hostname: hostname.to_string(),
            reason: format!("non-UTF-8 index payload: {e}"),
        })
    }

    fn get_with_retry(&self, url: &str) -> std::result::Result<Vec<u8>, String> {
        let op = || -> std::result::Result<Vec<u8>, backoff::Error<String>> {
            let response = self.http.get(url).send().map_err(|e| {
                backoff::Error::transient(format!("request error: {e}"))
            })?;

            let status = response.status();
            if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(backoff::Error::transient(format!(
                    "server returned {status}"
                )));
            }
            if !status.is_success() {
                return Err(backoff::Error::permanent(format!(
                    "server returned {status}"
                )));
            }

            let mut buf = Vec::new();
            response
                .take(256 * 1024 * 1024)
                .read_to_end(&mut buf)
                .map_err(|e| backoff::Error::transient(format!("reading body: {e}")))?;
            Ok(buf)
        };

        let policy = backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(100))
            .with_max_elapsed_time(Some(Duration::from_secs(10)))
            .build();

        backoff::retry(policy, op).map_err(|e| match e {
            backoff::Error::Permanent(msg) => msg,
            backoff::Error::Transient { err, .. } => err,
        })
    }
}

/// An index document is the base64-encoded signature, a newline, and the
/// raw TSV payload. Returns `(signature_bytes, payload_bytes)`.
fn split_signed_document(document: &[u8]) -> Option<(Vec<u8>, &[u8])> {
    let newline_pos = document.iter().position(|&b| b == b'\n')?;
    let (sig_line, rest) = document.split_at(newline_pos);
    let payload = &rest[1..];
    let signature = base64::engine::general_purpose::STANDARD.decode(sig_line).ok()?;
    Some((signature, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_signed_document_separates_signature_from_payload() {
        let doc = b"c2lnbmF0dXJl\npackage\t1.0\tlinux\tamd64\tabc\t1\n";
        let (sig, payload) = split_signed_document(doc).unwrap();
        assert_eq!(sig, b"signature");
        assert_eq!(payload, b"package\t1.0\tlinux\tamd64\tabc\t1\n");
    }

    #[test]
    fn split_signed_document_rejects_missing_newline() {
        assert!(split_signed_document(b"no newline here").is_none());
    }
}
