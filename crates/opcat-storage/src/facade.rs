//! Routes to the database while it is available, else to the file.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::query::Filter;
use crate::{
    Backend, Document, DocumentCollection, FileCollection, FindOptions, Page, StorageError,
    UpsertOutcome,
};

pub struct Storage {
    file: Arc<FileCollection>,
    database: Option<Arc<dyn DocumentCollection>>,
    database_available: AtomicBool,
}

impl Storage {
    pub fn file_only(file: FileCollection) -> Self {
        Self {
            file: Arc::new(file),
            database: None,
            database_available: AtomicBool::new(false),
        }
    }

    /// The database starts out unavailable.
    pub fn with_database(file: FileCollection, database: Arc<dyn DocumentCollection>) -> Self {
        Self {
            file: Arc::new(file),
            database: Some(database),
            database_available: AtomicBool::new(false),
        }
    }

    /// Ignored (stays on the file) when no database collection is configured.
    pub fn set_backend_available(&self, available: bool) {
        let available = available && self.database.is_some();
        let previous = self.database_available.swap(available, Ordering::SeqCst);
        if previous != available {
            info!(backend = %self.active_backend(), "storage backend switched");
        }
    }

    pub fn active_backend(&self) -> Backend {
        if self.database.is_some() && self.database_available.load(Ordering::SeqCst) {
            Backend::Database
        } else {
            Backend::File
        }
    }

    /// Ping the database collection and record whether it answered.
    pub async fn refresh_backend(&self) -> Backend {
        if let Some(database) = &self.database {
            let available = match database.ping().await {
                Ok(()) => true,
                Err(err) => {
                    warn!(error = %err, "database unavailable; serving from file collection");
                    false
                }
            };
            self.set_backend_available(available);
        }
        self.active_backend()
    }

    fn active(&self) -> &dyn DocumentCollection {
        match (&self.database, self.active_backend()) {
            (Some(database), Backend::Database) => database.as_ref(),
            _ => self.file.as_ref(),
        }
    }
}

#[async_trait]
impl DocumentCollection for Storage {
    fn backend(&self) -> Backend {
        self.active_backend()
    }

    async fn find(&self, filter: &Filter, options: &FindOptions) -> Result<Page, StorageError> {
        self.active().find(filter, options).await
    }

    async fn find_one(&self, filter: &Filter) -> Result<Option<Document>, StorageError> {
        self.active().find_one(filter).await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Document>, StorageError> {
        self.active().find_by_id(id).await
    }

    async fn create(&self, data: Document) -> Result<Document, StorageError> {
        self.active().create(data).await
    }

    async fn update(&self, id: &str, patch: Document) -> Result<Option<Document>, StorageError> {
        self.active().update(id, patch).await
    }

    async fn update_many(&self, filter: &Filter, patch: Document) -> Result<usize, StorageError> {
        self.active().update_many(filter, patch).await
    }

    async fn upsert(&self, filter: &Filter, data: Document) -> Result<UpsertOutcome, StorageError> {
        self.active().upsert(filter, data).await
    }

    async fn count(&self, filter: &Filter) -> Result<usize, StorageError> {
        self.active().count(filter).await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.active().ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    struct Unreachable;

    #[async_trait]
    impl DocumentCollection for Unreachable {
        fn backend(&self) -> Backend {
            Backend::Database
        }
        async fn find(&self, _: &Filter, _: &FindOptions) -> Result<Page, StorageError> {
            Err(StorageError::InvalidDocument("database down".into()))
        }
        async fn find_by_id(&self, _: &str) -> Result<Option<Document>, StorageError> {
            Err(StorageError::InvalidDocument("database down".into()))
        }
        async fn create(&self, _: Document) -> Result<Document, StorageError> {
            Err(StorageError::InvalidDocument("database down".into()))
        }
        async fn update(&self, _: &str, _: Document) -> Result<Option<Document>, StorageError> {
            Err(StorageError::InvalidDocument("database down".into()))
        }
        async fn update_many(&self, _: &Filter, _: Document) -> Result<usize, StorageError> {
            Err(StorageError::InvalidDocument("database down".into()))
        }
        async fn upsert(&self, _: &Filter, _: Document) -> Result<UpsertOutcome, StorageError> {
            Err(StorageError::InvalidDocument("database down".into()))
        }
        async fn count(&self, _: &Filter) -> Result<usize, StorageError> {
            Err(StorageError::InvalidDocument("database down".into()))
        }
        async fn ping(&self) -> Result<(), StorageError> {
            Err(StorageError::InvalidDocument("database down".into()))
        }
    }

    #[tokio::test]
    async fn file_only_facade_never_reports_database() {
        let dir = tempdir().expect("tempdir");
        let storage = Storage::file_only(FileCollection::new(dir.path().join("c.json")));
        storage.set_backend_available(true);
        assert_eq!(storage.active_backend(), Backend::File);
        assert_eq!(storage.refresh_backend().await, Backend::File);
        storage.create(json!({"title": "A"})).await.unwrap();
        assert_eq!(storage.count(&Filter::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn routes_by_availability_flag() {
        let dir = tempdir().expect("tempdir");
        let storage = Storage::with_database(
            FileCollection::new(dir.path().join("c.json")),
            Arc::new(Unreachable),
        );
        assert_eq!(storage.active_backend(), Backend::File);
        storage.create(json!({"title": "A"})).await.unwrap();

        storage.set_backend_available(true);
        assert_eq!(storage.backend(), Backend::Database);
        assert!(storage.count(&Filter::new()).await.is_err());

        storage.set_backend_available(false);
        assert_eq!(storage.count(&Filter::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn refresh_falls_back_when_ping_fails() {
        let dir = tempdir().expect("tempdir");
        let storage = Storage::with_database(
            FileCollection::new(dir.path().join("c.json")),
            Arc::new(Unreachable),
        );
        storage.set_backend_available(true);
        assert_eq!(storage.refresh_backend().await, Backend::File);
        assert_eq!(storage.count(&Filter::new()).await.unwrap(), 0);
    }
}
