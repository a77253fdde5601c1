//! Durable file-per-request buffer for undeliverable webhooks.
//!
//! One immutable JSON file per buffered request. The filename encodes the
//! creation instant (`{unix_millis}_{random}.json`), so a plain lexicographic
//! listing yields chronological order and the replay engine never needs an
//! index. Files are written once by the buffering path and deleted (or
//! quarantined) by the replay path; nothing mutates a file in place.
//!
//! A file that fails to parse on read (e.g. a partial write from a crash) is
//! deleted rather than allowed to block the rest of the queue.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Subdirectory for requests that exhausted their replay budget.
pub const DEAD_LETTER_DIR: &str = "dead";

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// One buffered inbound request, exactly as it will be replayed.
///
/// The body is base64-encoded so binary payloads survive the JSON format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    #[serde(rename = "bodyBase64")]
    pub body_base64: Option<String>,
    #[serde(rename = "bufferedAt")]
    pub buffered_at: String,
}

impl BufferedRequest {
    /// Capture a request for buffering. An empty body is stored as absent.
    pub fn capture(
        method: &str,
        url: &str,
        headers: BTreeMap<String, String>,
        body: &[u8],
    ) -> Self {
        BufferedRequest {
            method: method.to_owned(),
            url: url.to_owned(),
            headers,
            body_base64: if body.is_empty() {
                None
            } else {
                Some(BASE64.encode(body))
            },
            buffered_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        }
    }

    /// Decode the body bytes, `None` when the request had no body.
    pub fn body(&self) -> Result<Option<Vec<u8>>, BufferError> {
        match &self.body_base64 {
            Some(b64) => Ok(Some(BASE64.decode(b64)?)),
            None => Ok(None),
        }
    }
}

/// Error type for buffer-store operations.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Invalid base64 body: {0}")]
    Base64(#[from] base64::DecodeError),
}

// ---------------------------------------------------------------------------
// BufferStore
// ---------------------------------------------------------------------------

/// File-per-request persistence in a single directory.
pub struct BufferStore {
    dir: PathBuf,
}

impl BufferStore {
    /// Open (or create) the buffer directory.
    pub fn open(dir: &Path) -> Result<Self, BufferError> {
        std::fs::create_dir_all(dir)?;
        Ok(BufferStore {
            dir: dir.to_owned(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist one request; returns the filename it was stored under.
    ///
    /// The random suffix keeps concurrent same-millisecond enqueues from
    /// colliding.
    pub fn enqueue(&self, request: &BufferedRequest) -> Result<String, BufferError> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let filename = format!(
            "{}_{}.json",
            chrono::Utc::now().timestamp_millis(),
            &suffix[..6]
        );
        let data = serde_json::to_vec(request)?;
        std::fs::write(self.dir.join(&filename), data)?;
        Ok(filename)
    }

    /// All buffered filenames in ascending (= chronological) order.
    pub fn list(&self) -> Result<Vec<String>, BufferError> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(".json") {
                    names.push(name.to_owned());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Parse one buffered file.
    pub fn load(&self, filename: &str) -> Result<BufferedRequest, BufferError> {
        let data = std::fs::read(self.dir.join(filename))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Delete a buffered file after confirmed replay (or on parse failure).
    pub fn remove(&self, filename: &str) -> Result<(), BufferError> {
        std::fs::remove_file(self.dir.join(filename))?;
        Ok(())
    }

    /// Move a poisoned file into the dead-letter subdirectory.
    pub fn quarantine(&self, filename: &str) -> Result<(), BufferError> {
        let dead = self.dir.join(DEAD_LETTER_DIR);
        std::fs::create_dir_all(&dead)?;
        std::fs::rename(self.dir.join(filename), dead.join(filename))?;
        Ok(())
    }

    /// Exact number of buffered files, `0` when the directory is unreadable.
    ///
    /// Used by `/health`; a broken buffer dir must not break the endpoint.
    pub fn count(&self) -> usize {
        self.list().map(|names| names.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> (BufferStore, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let store = BufferStore::open(dir.path()).expect("open store");
        (store, dir)
    }

    #[test]
    fn binary_body_survives_a_round_trip() {
        let (store, _dir) = store();
        let body = [0u8, 159, 146, 150, 255];
        let req = BufferedRequest::capture("POST", "/webhook", BTreeMap::new(), &body);
        let name = store.enqueue(&req).expect("enqueue");
        let loaded = store.load(&name).expect("load");
        assert_eq!(loaded.body().expect("decode"), Some(body.to_vec()));
    }

    #[test]
    fn empty_body_is_stored_as_absent() {
        let req = BufferedRequest::capture("GET", "/", BTreeMap::new(), &[]);
        assert!(req.body_base64.is_none());
        assert_eq!(req.body().expect("decode"), None);
    }

    #[test]
    fn list_returns_enqueue_order() {
        let (store, _dir) = store();
        let mut expected = Vec::new();
        for i in 0..5 {
            let req = BufferedRequest::capture(
                "POST",
                &format!("/webhook/{i}"),
                BTreeMap::new(),
                b"x",
            );
            expected.push(store.enqueue(&req).expect("enqueue"));
            // Distinct millisecond prefixes keep the order assertion honest.
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(store.list().expect("list"), expected);
    }

    #[test]
    fn remove_deletes_exactly_one_file() {
        let (store, _dir) = store();
        let req = BufferedRequest::capture("POST", "/webhook", BTreeMap::new(), b"x");
        let a = store.enqueue(&req).expect("enqueue a");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = store.enqueue(&req).expect("enqueue b");

        store.remove(&a).expect("remove");
        assert_eq!(store.list().expect("list"), vec![b]);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn quarantine_moves_file_out_of_the_listing() {
        let (store, dir) = store();
        let req = BufferedRequest::capture("POST", "/webhook", BTreeMap::new(), b"x");
        let name = store.enqueue(&req).expect("enqueue");

        store.quarantine(&name).expect("quarantine");
        assert!(store.list().expect("list").is_empty());
        assert!(dir.path().join(DEAD_LETTER_DIR).join(&name).exists());
    }

    #[test]
    fn non_json_files_and_subdirectories_are_ignored() {
        let (store, dir) = store();
        std::fs::write(dir.path().join("notes.txt"), "ignore me").expect("write");
        std::fs::create_dir(dir.path().join("subdir.json")).expect("mkdir");
        assert!(store.list().expect("list").is_empty());
        assert_eq!(store.count(), 0);
    }
}
