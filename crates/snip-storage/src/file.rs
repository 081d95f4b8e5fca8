use crate::pipeline::{DeletionPipeline, DeletionTarget, PipelineSettings};
use crate::table::{Admission, RecordTable};
use async_trait::async_trait;
use parking_lot::RwLock;
use snip_core::{
    BackendKind, BatchInput, BatchOutput, DeletionTicket, OwnerId, Record, RecordId, Resolved,
    Result, ShortCode, Storage, StorageError, UserUrl,
};
use snip_generator::{AlphabeticGenerator, Generator};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Storage persisted as a stream of JSON documents, one [`Record`] each.
///
/// The whole file is loaded into memory on [`FileStorage::open`]. New
/// records are appended; deletions rewrite the file. Both writers hold the
/// same lock, so the file and the in-memory view never diverge.
///
/// A file with a malformed document is served read-only: lookups see the
/// records before the bad bytes, while appends and deletions are refused
/// with [`StorageError::InvalidData`].
pub struct FileStorage<G = AlphabeticGenerator> {
    inner: Arc<FileInner>,
    generator: Arc<G>,
    base_url: Arc<str>,
    pipeline: PipelineSettings,
}

struct FileInner {
    path: PathBuf,
    table: RwLock<RecordTable>,
    file_lock: Mutex<()>,
    /// Byte offset where the last well-formed document ends, if the file is corrupt.
    malformed_at: Option<usize>,
}

/// Where decoding stopped and why.
struct Malformed {
    offset: usize,
    error: serde_json::Error,
}

impl FileStorage {
    /// Loads `path`, treating a missing file as an empty store.
    ///
    /// A malformed document stops the load: the records before it are kept
    /// and the rest of the file is ignored.
    pub async fn open(path: impl Into<PathBuf>, base_url: impl Into<String>) -> Result<Self> {
        let path = path.into();
        let bytes = read_or_empty(&path).await?;

        let (records, malformed) = decode_documents(&bytes);
        if let Some(Malformed { offset, error }) = &malformed {
            warn!(
                path = %path.display(),
                loaded = records.len(),
                offset,
                error = %error,
                "malformed document in storage file, serving the prefix read-only"
            );
        }

        let table = RecordTable::from_records(records);
        info!(path = %path.display(), records = table.len(), "opened file storage");

        Ok(Self {
            inner: Arc::new(FileInner {
                path,
                table: RwLock::new(table),
                file_lock: Mutex::new(()),
                malformed_at: malformed.map(|m| m.offset),
            }),
            generator: Arc::new(AlphabeticGenerator::new()),
            base_url: Arc::from(base_url.into()),
            pipeline: PipelineSettings::default(),
        })
    }
}

impl<G: Generator> FileStorage<G> {
    pub fn with_generator<H: Generator>(self, generator: H) -> FileStorage<H> {
        FileStorage {
            inner: self.inner,
            generator: Arc::new(generator),
            base_url: self.base_url,
            pipeline: self.pipeline,
        }
    }

    pub fn with_pipeline(mut self, pipeline: PipelineSettings) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl<G> Clone for FileStorage<G> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            generator: Arc::clone(&self.generator),
            base_url: Arc::clone(&self.base_url),
            pipeline: self.pipeline.clone(),
        }
    }
}

impl FileInner {
    async fn append(&self, record: &Record) -> Result<()> {
        if let Some(offset) = self.malformed_at {
            return Err(StorageError::InvalidData(format!(
                "{} is malformed after byte {offset}, refusing to append",
                self.path.display()
            )));
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut line = encode(record)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    /// Re-reads the file, flags `ids` as deleted and writes everything back.
    async fn rewrite_deleted(&self, ids: &[RecordId]) -> Result<bool> {
        let bytes = read_or_empty(&self.path).await?;
        let (mut records, malformed) = decode_documents(&bytes);
        if let Some(Malformed { offset, error }) = malformed {
            return Err(StorageError::InvalidData(format!(
                "cannot rewrite {}, malformed after byte {offset}: {error}",
                self.path.display()
            )));
        }

        let wanted: HashSet<&RecordId> = ids.iter().collect();
        let mut changed = false;
        for record in records.iter_mut() {
            if !record.deleted && wanted.contains(&record.id) {
                record.deleted = true;
                changed = true;
            }
        }
        if !changed {
            return Ok(false);
        }

        let mut buf = Vec::with_capacity(bytes.len());
        for record in &records {
            buf.extend(encode(record)?);
            buf.push(b'\n');
        }
        tokio::fs::write(&self.path, buf).await?;
        Ok(true)
    }
}

async fn read_or_empty(path: &Path) -> Result<Vec<u8>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Decodes consecutive JSON documents, stopping at the first malformed one.
fn decode_documents(bytes: &[u8]) -> (Vec<Record>, Option<Malformed>) {
    let mut records = Vec::new();
    let mut offset = 0;
    let mut stream = serde_json::Deserializer::from_slice(bytes).into_iter::<Record>();
    while let Some(document) = stream.next() {
        match document {
            Ok(record) => {
                records.push(record);
                offset = stream.byte_offset();
            }
            Err(error) => return (records, Some(Malformed { offset, error })),
        }
    }
    (records, None)
}

fn encode(record: &Record) -> Result<Vec<u8>> {
    serde_json::to_vec(record).map_err(|e| {
        StorageError::InvalidData(format!("failed to encode record {}: {e}", record.id))
    })
}

#[async_trait]
impl<G: Generator> Storage for FileStorage<G> {
    async fn add_url(&self, owner: &OwnerId, original_url: &str) -> Result<ShortCode> {
        if original_url.is_empty() {
            return Err(StorageError::BlankInput);
        }

        let _guard = self.inner.file_lock.lock().await;
        let admission = self
            .inner
            .table
            .read()
            .admit(owner, original_url, self.generator.as_ref())?;
        let record = match admission {
            Admission::Existing(code) => return Ok(code),
            Admission::New(record) => record,
        };

        self.inner.append(&record).await?;
        let code = record.short_code.clone();
        self.inner.table.write().push(record);
        debug!(code = %code, "appended record to storage file");
        Ok(code)
    }

    async fn get_full_url(&self, code: &ShortCode) -> Result<Resolved> {
        self.inner
            .table
            .read()
            .get_by_code(code)
            .map(|record| Resolved {
                original_url: record.original_url.clone(),
                deleted: record.deleted,
            })
            .ok_or_else(|| StorageError::NotFound(code.to_string()))
    }

    async fn add_batch(
        &self,
        owner: &OwnerId,
        items: Vec<BatchInput>,
    ) -> Result<Vec<BatchOutput>> {
        let mut outputs = Vec::with_capacity(items.len());
        for item in items {
            let code = self.add_url(owner, &item.original_url).await?;
            outputs.push(BatchOutput {
                correlation_id: item.correlation_id,
                short_url: code.to_url(&self.base_url),
            });
        }
        Ok(outputs)
    }

    async fn get_user_urls(&self, owner: &OwnerId) -> Result<Vec<UserUrl>> {
        if owner.is_anonymous() {
            return Ok(Vec::new());
        }
        Ok(self.inner.table.read().user_urls(owner, &self.base_url))
    }

    fn delete_urls(
        &self,
        owner: &OwnerId,
        codes: Vec<ShortCode>,
        cancel: CancellationToken,
    ) -> DeletionTicket {
        DeletionPipeline::new(Arc::new(self.clone()), self.pipeline.clone()).spawn(
            owner.clone(),
            codes,
            cancel,
        )
    }

    async fn ping(&self) -> bool {
        true
    }

    fn backend(&self) -> BackendKind {
        BackendKind::File
    }
}

#[async_trait]
impl<G: Generator> DeletionTarget for FileStorage<G> {
    async fn resolve_owned(&self, owner: &OwnerId, code: &ShortCode) -> Result<Option<RecordId>> {
        Ok(self.inner.table.read().owned_id(owner, code))
    }

    async fn commit_deleted(&self, ids: Vec<RecordId>) -> Result<u64> {
        let _guard = self.inner.file_lock.lock().await;
        if self.inner.rewrite_deleted(&ids).await? {
            debug!(path = %self.inner.path.display(), "rewrote storage file");
        }
        Ok(self.inner.table.write().mark_deleted(&ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snip_generator::SeqGenerator;
    use tempfile::TempDir;

    const BASE: &str = "http://localhost:8080";

    /// One complete record owned by alice, then a truncated document.
    const CORRUPT: &str = concat!(
        r#"{"uuid":"1","short_url":"Test","original_url":"http://test.com","user_id":"alice"}"#,
        "\n",
        r#"{"uuid":"#,
    );

    fn code(value: &str) -> ShortCode {
        ShortCode::new_unchecked(value)
    }

    fn owner(id: &str) -> OwnerId {
        OwnerId::new(id)
    }

    async fn open(dir: &TempDir) -> FileStorage<SeqGenerator> {
        FileStorage::open(dir.path().join("urls.json"), BASE)
            .await
            .unwrap()
            .with_generator(SeqGenerator::with_prefix("f"))
    }

    #[tokio::test]
    async fn missing_file_is_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();

        let storage = open(&dir).await;

        assert!(storage.get_user_urls(&owner("alice")).await.unwrap().is_empty());
        assert!(!storage.path().exists());
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let code = {
            let storage = open(&dir).await;
            storage.add_url(&owner("alice"), "http://test.com/").await.unwrap()
        };

        let reopened = FileStorage::open(dir.path().join("urls.json"), BASE)
            .await
            .unwrap();

        assert_eq!(
            reopened.get_full_url(&code).await.unwrap().original_url,
            "http://test.com/"
        );
        // Dedup holds against what was loaded from disk.
        assert_eq!(
            reopened.add_url(&owner("bob"), "http://test.com/").await.unwrap(),
            code
        );
    }

    #[tokio::test]
    async fn append_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("urls.json");
        let storage = FileStorage::open(&path, BASE).await.unwrap();

        storage.add_url(&owner("alice"), "http://a.com").await.unwrap();

        assert!(path.exists());
    }

    #[tokio::test]
    async fn file_holds_one_document_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&dir).await;
        storage.add_url(&owner("alice"), "http://a.com").await.unwrap();
        storage.add_url(&owner("alice"), "http://b.com").await.unwrap();

        let raw = std::fs::read_to_string(storage.path()).unwrap();
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["short_url"], "f000000");
        assert_eq!(lines[1]["original_url"], "http://b.com");
        assert_eq!(lines[1]["user_id"], "alice");
        assert_eq!(lines[1]["is_deleted"], false);
    }

    #[tokio::test]
    async fn deletion_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&dir).await;
        let gone = storage.add_url(&owner("alice"), "http://a.com").await.unwrap();
        let kept = storage.add_url(&owner("alice"), "http://b.com").await.unwrap();

        let report = storage
            .delete_urls(&owner("alice"), vec![gone.clone()], CancellationToken::new())
            .wait()
            .await
            .unwrap();
        assert_eq!(report.deleted, 1);

        let reopened = FileStorage::open(storage.path(), BASE).await.unwrap();
        assert!(reopened.get_full_url(&gone).await.unwrap().deleted);
        assert!(!reopened.get_full_url(&kept).await.unwrap().deleted);
        assert_eq!(
            reopened.get_user_urls(&owner("alice")).await.unwrap(),
            vec![UserUrl {
                short_url: format!("{BASE}/{kept}"),
                original_url: "http://b.com".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn foreign_codes_leave_the_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&dir).await;
        let code = storage.add_url(&owner("bob"), "http://a.com").await.unwrap();
        let before = std::fs::read(storage.path()).unwrap();

        let report = storage
            .delete_urls(&owner("alice"), vec![code], CancellationToken::new())
            .wait()
            .await
            .unwrap();

        assert_eq!(report.deleted, 0);
        assert_eq!(std::fs::read(storage.path()).unwrap(), before);
    }

    #[tokio::test]
    async fn loads_concatenated_and_pretty_printed_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.json");
        std::fs::write(
            &path,
            r#"{"uuid":"1","short_url":"Test","original_url":"http://test.com"}
{
  "uuid": "2",
  "short_url": "Other",
  "original_url": "http://other.com",
  "user_id": "alice",
  "is_deleted": true
}"#,
        )
        .unwrap();

        let storage = FileStorage::open(&path, BASE).await.unwrap();

        let first = storage.get_full_url(&code("Test")).await.unwrap();
        assert_eq!(first.original_url, "http://test.com");
        assert!(!first.deleted);
        assert!(storage.get_full_url(&code("Other")).await.unwrap().deleted);
    }

    #[tokio::test]
    async fn malformed_tail_keeps_loaded_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.json");
        std::fs::write(&path, CORRUPT).unwrap();

        let storage = FileStorage::open(&path, BASE).await.unwrap();

        assert!(storage.get_full_url(&code("Test")).await.is_ok());
    }

    #[tokio::test]
    async fn corrupt_file_refuses_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.json");
        std::fs::write(&path, CORRUPT).unwrap();
        let storage = FileStorage::open(&path, BASE)
            .await
            .unwrap()
            .with_generator(SeqGenerator::with_prefix("f"));

        let err = storage.add_url(&owner("alice"), "http://new.com").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidData(_)));
        assert!(matches!(
            storage
                .add_batch(
                    &owner("alice"),
                    vec![BatchInput::new("1", "http://batch.com")],
                )
                .await,
            Err(StorageError::InvalidData(_))
        ));
        // Known URLs still resolve to their stored code.
        assert_eq!(
            storage.add_url(&owner("bob"), "http://test.com").await.unwrap(),
            code("Test")
        );
        assert_eq!(std::fs::read(&path).unwrap(), CORRUPT.as_bytes());

        let reopened = FileStorage::open(&path, BASE).await.unwrap();
        assert!(reopened.get_full_url(&code("Test")).await.is_ok());
        assert_eq!(
            reopened.get_user_urls(&owner("alice")).await.unwrap(),
            vec![UserUrl {
                short_url: format!("{BASE}/Test"),
                original_url: "http://test.com".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn corrupt_file_fails_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.json");
        std::fs::write(&path, CORRUPT).unwrap();
        let storage = FileStorage::open(&path, BASE).await.unwrap();

        let err = storage
            .delete_urls(&owner("alice"), vec![code("Test")], CancellationToken::new())
            .wait()
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::InvalidData(_)));
        assert_eq!(std::fs::read(&path).unwrap(), CORRUPT.as_bytes());
        assert!(!storage.get_full_url(&code("Test")).await.unwrap().deleted);
    }

    #[tokio::test]
    async fn concurrent_appends_are_all_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&dir).await;

        let mut handles = Vec::new();
        for i in 0..20 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                storage
                    .add_url(&OwnerId::new("alice"), &format!("http://site{i}.com"))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let reopened = FileStorage::open(storage.path(), BASE).await.unwrap();
        assert_eq!(reopened.get_user_urls(&owner("alice")).await.unwrap().len(), 20);
    }
}
