//! One JSON array on disk, rewritten through temp file + rename.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::document::{self, Document};
use crate::query::{matches, sort_documents, Filter};
use crate::{Backend, DocumentCollection, FindOptions, Page, StorageError, UpsertOutcome};

#[derive(Debug)]
pub struct FileCollection {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCollection {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn display_path(&self) -> String {
        self.path.display().to_string()
    }

    /// Read the whole collection. A missing file is an empty collection.
    pub async fn load(&self) -> Result<Vec<Document>, StorageError> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StorageError::Io {
                    path: self.display_path(),
                    source,
                })
            }
        };
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&text).map_err(|source| StorageError::Corrupt {
            path: self.display_path(),
            source,
        })
    }

    async fn persist(&self, docs: &[Document]) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(docs)?;
        let io_err = |path: &Path| {
            let path = path.display().to_string();
            move |source| StorageError::Io { path, source }
        };

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await.map_err(io_err(&parent))?;

        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "collection".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let written = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await
                .map_err(io_err(&temp_path))?;
            file.write_all(&bytes).await.map_err(io_err(&temp_path))?;
            file.flush().await.map_err(io_err(&temp_path))?;
            file.sync_all().await.map_err(io_err(&temp_path))?;
            drop(file);
            fs::rename(&temp_path, &self.path).await.map_err(io_err(&self.path))
        }
        .await;
        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err);
        }
        debug!(path = %self.path.display(), records = docs.len(), "collection persisted");
        Ok(())
    }
}

#[async_trait]
impl DocumentCollection for FileCollection {
    fn backend(&self) -> Backend {
        Backend::File
    }

    async fn find(&self, filter: &Filter, options: &FindOptions) -> Result<Page, StorageError> {
        let mut items: Vec<Document> = self
            .load()
            .await?
            .into_iter()
            .filter(|doc| matches(doc, filter))
            .collect();
        sort_documents(&mut items, &options.sort);
        let total = items.len();
        let items = match options.limit {
            Some(limit) => items.into_iter().skip(options.offset()).take(limit).collect(),
            None => items,
        };
        Ok(Page { items, total })
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Document>, StorageError> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .find(|doc| document::document_id(doc) == Some(id)))
    }

    async fn create(&self, data: Document) -> Result<Document, StorageError> {
        let record = document::stamp_new(data, &document::new_document_id(), Utc::now())?;
        let _guard = self.write_lock.lock().await;
        let mut docs = self.load().await?;
        docs.push(record.clone());
        self.persist(&docs).await?;
        Ok(record)
    }

    async fn update(&self, id: &str, patch: Document) -> Result<Option<Document>, StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut docs = self.load().await?;
        let Some(doc) = docs
            .iter_mut()
            .find(|doc| document::document_id(doc) == Some(id))
        else {
            return Ok(None);
        };
        document::apply_patch(doc, &patch)?;
        document::touch(doc, Utc::now());
        let updated = doc.clone();
        self.persist(&docs).await?;
        Ok(Some(updated))
    }

    async fn update_many(&self, filter: &Filter, patch: Document) -> Result<usize, StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut docs = self.load().await?;
        let now = Utc::now();
        let mut changed = 0usize;
        for doc in docs.iter_mut().filter(|doc| matches(doc, filter)) {
            document::apply_patch(doc, &patch)?;
            document::touch(doc, now);
            changed += 1;
        }
        if changed > 0 {
            self.persist(&docs).await?;
        }
        Ok(changed)
    }

    async fn upsert(&self, filter: &Filter, data: Document) -> Result<UpsertOutcome, StorageError> {
        let _guard = self.write_lock.lock().await;
        let mut docs = self.load().await?;
        let now = Utc::now();
        let outcome = match docs.iter_mut().find(|doc| matches(doc, filter)) {
            Some(existing) => {
                document::apply_patch(existing, &data)?;
                document::touch(existing, now);
                UpsertOutcome {
                    created: false,
                    updated: true,
                    record: existing.clone(),
                }
            }
            None => {
                let record = document::stamp_new(data, &document::new_document_id(), now)?;
                docs.push(record.clone());
                UpsertOutcome {
                    created: true,
                    updated: false,
                    record,
                }
            }
        };
        self.persist(&docs).await?;
        Ok(outcome)
    }

    async fn count(&self, filter: &Filter) -> Result<usize, StorageError> {
        Ok(self
            .load()
            .await?
            .iter()
            .filter(|doc| matches(doc, filter))
            .count())
    }
}
