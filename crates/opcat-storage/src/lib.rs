//! Dual-backend document storage for the opportunity catalog.

pub mod document;
pub mod facade;
pub mod file;
pub mod pattern;
pub mod postgres;
pub mod query;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use document::Document;
pub use facade::Storage;
pub use file::FileCollection;
pub use postgres::PgCollection;
pub use query::{matches, Condition, Filter, InItem, Pattern, QueryError, Sort};

pub const CRATE_NAME: &str = "opcat-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("collection file {path} is not a JSON array of documents: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing documents: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Which implementation served a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Database,
    File,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Database => f.write_str("database"),
            Backend::File => f.write_str("file"),
        }
    }
}

/// `page` is 1-based; `limit: None` returns every match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindOptions {
    pub page: usize,
    pub limit: Option<usize>,
    pub sort: Sort,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            page: 1,
            limit: None,
            sort: Sort::default(),
        }
    }
}

impl FindOptions {
    pub fn paged(page: usize, limit: usize) -> Self {
        Self {
            page,
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn with_sort(mut self, sort: Sort) -> Self {
        self.sort = sort;
        self
    }

    pub fn offset(&self) -> usize {
        match self.limit {
            Some(limit) => self.page.max(1).saturating_sub(1).saturating_mul(limit),
            None => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<Document>,
    /// Matching records before pagination.
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    pub created: bool,
    pub updated: bool,
    pub record: Document,
}

/// One logical collection of JSON documents.
#[async_trait]
pub trait DocumentCollection: Send + Sync {
    fn backend(&self) -> Backend;

    async fn find(&self, filter: &Filter, options: &FindOptions) -> Result<Page, StorageError>;

    async fn find_one(&self, filter: &Filter) -> Result<Option<Document>, StorageError> {
        let page = self.find(filter, &FindOptions::paged(1, 1)).await?;
        Ok(page.items.into_iter().next())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Document>, StorageError>;

    async fn create(&self, data: Document) -> Result<Document, StorageError>;

    async fn update(&self, id: &str, patch: Document) -> Result<Option<Document>, StorageError>;

    /// Apply `patch` to every match; returns how many records changed.
    async fn update_many(&self, filter: &Filter, patch: Document) -> Result<usize, StorageError>;

    /// Merge `data` into the first match (insertion order) or create it.
    async fn upsert(&self, filter: &Filter, data: Document) -> Result<UpsertOutcome, StorageError>;

    async fn count(&self, filter: &Filter) -> Result<usize, StorageError>;

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
