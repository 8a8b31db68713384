//! Postgres-backed document collection: JSONB rows in one `documents` table
//! keyed by `(collection, id)`, with `seq` recording insertion order.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opcat_core::parse_date_like;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, info};

use crate::document::{self, Document};
use crate::query::{Clause, Condition, Filter, InItem, Sort, SortDirection};
use crate::{Backend, DocumentCollection, FindOptions, Page, StorageError, UpsertOutcome};

/// Bound parameter value, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    TextArray(Vec<String>),
    Json(JsonValue),
    Float(f64),
    Int(i64),
    Bool(bool),
    Timestamp(DateTime<Utc>),
}

/// Renders filters as parameterized SQL. Placeholders are numbered in push
/// order.
#[derive(Debug, Default)]
pub struct SqlTranslator {
    params: Vec<SqlParam>,
}

enum EqOperand {
    Date(String),
    Json(String),
}

impl SqlTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }

    pub fn params(&self) -> &[SqlParam] {
        &self.params
    }

    pub fn into_params(self) -> Vec<SqlParam> {
        self.params
    }

    /// Boolean SQL expression over the `doc` column.
    pub fn filter(&mut self, filter: &Filter) -> String {
        if filter.is_empty() {
            return "TRUE".to_string();
        }
        let parts: Vec<String> = filter
            .clauses()
            .iter()
            .map(|clause| self.clause(clause))
            .collect();
        if parts.len() == 1 {
            parts[0].clone()
        } else {
            format!("({})", parts.join(" AND "))
        }
    }

    fn clause(&mut self, clause: &Clause) -> String {
        match clause {
            Clause::Or(alternatives) => {
                let parts: Vec<String> = alternatives.iter().map(|alt| self.filter(alt)).collect();
                match parts.len() {
                    0 => "FALSE".to_string(),
                    1 => parts[0].clone(),
                    _ => format!("({})", parts.join(" OR ")),
                }
            }
            Clause::Field { path, condition } => {
                if never_matches(condition) {
                    return "FALSE".to_string();
                }
                let path = self.path(path);
                self.condition(&path, condition)
            }
        }
    }

    fn path(&mut self, path: &str) -> String {
        let segments = path.split('.').map(str::to_string).collect();
        let p = self.push(SqlParam::TextArray(segments));
        format!("(doc #> {p}::text[])")
    }

    fn condition(&mut self, j: &str, condition: &Condition) -> String {
        match condition {
            Condition::Eq(expected) => {
                let operand = self.eq_operand(expected);
                let whole = eq_sql(&format!("COALESCE({j}, 'null'::jsonb)"), &operand);
                if expected.is_array() || expected.is_object() {
                    whole
                } else {
                    format!(
                        "({whole} OR EXISTS (SELECT 1 FROM jsonb_array_elements({}) AS el(v) WHERE {}))",
                        array_or_empty(j),
                        eq_sql("el.v", &operand)
                    )
                }
            }
            Condition::Regex(pattern) => {
                let re = self.push(SqlParam::Text(pattern.postgres_are().to_string()));
                format!(
                    "({} OR EXISTS (SELECT 1 FROM jsonb_array_elements({}) AS el(v) WHERE {}))",
                    regex_sql(j, &re),
                    array_or_empty(j),
                    regex_sql("el.v", &re)
                )
            }
            Condition::Gte(bound) => self.range(j, ">=", bound),
            Condition::Lt(bound) => self.range(j, "<", bound),
            Condition::In(items) => {
                if items.is_empty() {
                    return "FALSE".to_string();
                }
                let tests: Vec<Box<dyn Fn(&str) -> String>> = items
                    .iter()
                    .map(|item| -> Box<dyn Fn(&str) -> String> {
                        match item {
                            InItem::Value(value) => {
                                let operand = self.eq_operand(value);
                                Box::new(move |x: &str| eq_sql(x, &operand))
                            }
                            InItem::Pattern(pattern) => {
                                let re = self.push(SqlParam::Text(pattern.postgres_are().to_string()));
                                Box::new(move |x: &str| regex_sql(x, &re))
                            }
                        }
                    })
                    .collect();
                let any = |x: &str| {
                    let parts: Vec<String> = tests.iter().map(|test| test(x)).collect();
                    format!("({})", parts.join(" OR "))
                };
                format!(
                    "(CASE WHEN jsonb_typeof({j}) = 'array' \
                     THEN EXISTS (SELECT 1 FROM jsonb_array_elements({j}) AS el(v) WHERE {}) \
                     ELSE {} END)",
                    any("el.v"),
                    any(&format!("COALESCE({j}, 'null'::jsonb)"))
                )
            }
        }
    }

    fn eq_operand(&mut self, expected: &JsonValue) -> EqOperand {
        match parse_date_like(expected) {
            Some(ts) => EqOperand::Date(self.push(SqlParam::Timestamp(ts))),
            None => EqOperand::Json(self.push(SqlParam::Json(expected.clone()))),
        }
    }

    fn range(&mut self, j: &str, op: &str, bound: &JsonValue) -> String {
        if let Some(ts) = parse_date_like(bound) {
            let p = self.push(SqlParam::Timestamp(ts));
            return format!(
                "(jsonb_typeof({j}) = 'string' AND opcat_date({j} #>> '{{}}') {op} {p}::timestamptz)"
            );
        }
        match bound {
            JsonValue::Number(n) => match n.as_f64() {
                Some(n) => {
                    let p = self.push(SqlParam::Float(n));
                    format!(
                        "(CASE WHEN jsonb_typeof({j}) = 'number' \
                         THEN ({j} #>> '{{}}')::float8 {op} {p}::float8 ELSE FALSE END)"
                    )
                }
                None => "FALSE".to_string(),
            },
            JsonValue::String(text) => {
                let p = self.push(SqlParam::Text(text.clone()));
                format!(
                    "(jsonb_typeof({j}) = 'string' AND ({j} #>> '{{}}') COLLATE \"C\" {op} {p}::text)"
                )
            }
            JsonValue::Bool(flag) => {
                let p = self.push(SqlParam::Bool(*flag));
                format!(
                    "(CASE WHEN jsonb_typeof({j}) = 'boolean' \
                     THEN ({j} #>> '{{}}')::boolean {op} {p}::boolean ELSE FALSE END)"
                )
            }
            _ => "FALSE".to_string(),
        }
    }

    /// `LIMIT`/`OFFSET` for a paged read. Counts past `i64::MAX` are clamped.
    pub fn page_window(&mut self, options: &FindOptions) -> String {
        let Some(limit) = options.limit else {
            return String::new();
        };
        let limit = self.push(SqlParam::Int(i64::try_from(limit).unwrap_or(i64::MAX)));
        let offset = self.push(SqlParam::Int(i64::try_from(options.offset()).unwrap_or(i64::MAX)));
        format!(" LIMIT {limit} OFFSET {offset}")
    }

    /// ORDER BY list reproducing [`crate::query::compare_values`].
    pub fn order_by(&mut self, sort: &Sort) -> String {
        let mut parts = Vec::new();
        for key in sort.keys() {
            let j = self.path(&key.path);
            let (dir, dates_nulls) = match key.direction {
                SortDirection::Asc => ("ASC", "NULLS LAST"),
                SortDirection::Desc => ("DESC", "NULLS FIRST"),
            };
            parts.push(format!(
                "CASE jsonb_typeof({j}) WHEN 'string' THEN 1 WHEN 'number' THEN 2 \
                 WHEN 'boolean' THEN 3 WHEN 'array' THEN 4 WHEN 'object' THEN 5 ELSE 0 END {dir}"
            ));
            parts.push(format!(
                "CASE WHEN jsonb_typeof({j}) = 'string' THEN opcat_date({j} #>> '{{}}') END {dir} {dates_nulls}"
            ));
            parts.push(format!(
                "CASE WHEN jsonb_typeof({j}) = 'string' AND opcat_date({j} #>> '{{}}') IS NULL \
                 THEN ({j} #>> '{{}}') COLLATE \"C\" END {dir}"
            ));
            parts.push(format!(
                "CASE WHEN jsonb_typeof({j}) = 'number' THEN ({j} #>> '{{}}')::float8 END {dir}"
            ));
            parts.push(format!(
                "CASE WHEN jsonb_typeof({j}) IN ('boolean', 'array', 'object') THEN {j} END {dir}"
            ));
        }
        parts.push("seq ASC".to_string());
        parts.join(", ")
    }
}

fn never_matches(condition: &Condition) -> bool {
    match condition {
        Condition::In(items) => items.is_empty(),
        Condition::Gte(bound) | Condition::Lt(bound) => {
            parse_date_like(bound).is_none()
                && match bound {
                    JsonValue::Number(n) => n.as_f64().is_none(),
                    JsonValue::String(_) | JsonValue::Bool(_) => false,
                    _ => true,
                }
        }
        _ => false,
    }
}

fn eq_sql(x: &str, operand: &EqOperand) -> String {
    match operand {
        EqOperand::Date(p) => format!(
            "(jsonb_typeof({x}) = 'string' AND opcat_date({x} #>> '{{}}') = {p}::timestamptz)"
        ),
        EqOperand::Json(p) => format!("({x} = {p}::jsonb)"),
    }
}

fn regex_sql(x: &str, re: &str) -> String {
    format!("(jsonb_typeof({x}) = 'string' AND ({x} #>> '{{}}') ~ {re})")
}

fn array_or_empty(j: &str) -> String {
    format!("CASE WHEN jsonb_typeof({j}) = 'array' THEN {j} ELSE '[]'::jsonb END")
}

fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: Vec<SqlParam>,
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            SqlParam::Text(value) => query.bind(value),
            SqlParam::TextArray(value) => query.bind(value),
            SqlParam::Json(value) => query.bind(value),
            SqlParam::Float(value) => query.bind(value),
            SqlParam::Int(value) => query.bind(value),
            SqlParam::Bool(value) => query.bind(value),
            SqlParam::Timestamp(value) => query.bind(value),
        };
    }
    query
}

fn row_document(row: &PgRow) -> Result<Document, StorageError> {
    Ok(row.try_get::<JsonValue, _>("doc")?)
}

#[derive(Debug, Clone)]
pub struct PgCollection {
    pool: PgPool,
    collection: String,
}

impl PgCollection {
    pub fn new(pool: PgPool, collection: impl Into<String>) -> Self {
        Self {
            pool,
            collection: collection.into(),
        }
    }

    pub async fn connect(database_url: &str, collection: impl Into<String>) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool, collection))
    }

    /// Connect without touching the server; the first query opens a connection.
    pub fn connect_lazy(database_url: &str, collection: impl Into<String>) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy(database_url)?;
        Ok(Self::new(pool, collection))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!(collection = %self.collection, "database migrations applied");
        Ok(())
    }

    /// `SELECT <columns> FROM documents WHERE collection = $1 AND <filter>`
    /// plus its parameters.
    fn select(&self, columns: &str, filter: &Filter) -> (String, SqlTranslator) {
        let mut sql = SqlTranslator::new();
        let coll = sql.push(SqlParam::Text(self.collection.clone()));
        let clause = sql.filter(filter);
        (
            format!("SELECT {columns} FROM documents WHERE collection = {coll} AND {clause}"),
            sql,
        )
    }

    async fn insert<'e, E>(&self, executor: E, record: &Document) -> Result<(), StorageError>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let id = document::document_id(record)
            .ok_or_else(|| StorageError::InvalidDocument("record has no id".to_string()))?;
        sqlx::query("INSERT INTO documents (collection, id, doc) VALUES ($1, $2, $3)")
            .bind(&self.collection)
            .bind(id)
            .bind(record)
            .execute(executor)
            .await?;
        Ok(())
    }

    async fn replace<'e, E>(&self, executor: E, id: &str, record: &Document) -> Result<(), StorageError>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        sqlx::query("UPDATE documents SET doc = $3 WHERE collection = $1 AND id = $2")
            .bind(&self.collection)
            .bind(id)
            .bind(record)
            .execute(executor)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentCollection for PgCollection {
    fn backend(&self) -> Backend {
        Backend::Database
    }

    async fn find(&self, filter: &Filter, options: &FindOptions) -> Result<Page, StorageError> {
        let total = self.count(filter).await?;

        let (mut statement, mut sql) = self.select("doc", filter);
        let order = sql.order_by(&options.sort);
        statement.push_str(&format!(" ORDER BY {order}"));
        statement.push_str(&sql.page_window(options));
        let rows = bind_params(sqlx::query(&statement), sql.into_params())
            .fetch_all(&self.pool)
            .await?;
        let items = rows.iter().map(row_document).collect::<Result<Vec<_>, _>>()?;
        Ok(Page { items, total })
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Document>, StorageError> {
        let row = sqlx::query("SELECT doc FROM documents WHERE collection = $1 AND id = $2")
            .bind(&self.collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_document).transpose()
    }

    async fn create(&self, data: Document) -> Result<Document, StorageError> {
        let record = document::stamp_new(data, &document::new_document_id(), Utc::now())?;
        self.insert(&self.pool, &record).await?;
        Ok(record)
    }

    async fn update(&self, id: &str, patch: Document) -> Result<Option<Document>, StorageError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT doc FROM documents WHERE collection = $1 AND id = $2 FOR UPDATE")
            .bind(&self.collection)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut doc = row_document(&row)?;
        document::apply_patch(&mut doc, &patch)?;
        document::touch(&mut doc, Utc::now());
        self.replace(&mut *tx, id, &doc).await?;
        tx.commit().await?;
        Ok(Some(doc))
    }

    async fn update_many(&self, filter: &Filter, patch: Document) -> Result<usize, StorageError> {
        let (mut statement, sql) = self.select("id, doc", filter);
        statement.push_str(" ORDER BY seq FOR UPDATE");

        let mut tx = self.pool.begin().await?;
        let rows = bind_params(sqlx::query(&statement), sql.into_params())
            .fetch_all(&mut *tx)
            .await?;
        let now = Utc::now();
        for row in &rows {
            let id: String = row.try_get("id")?;
            let mut doc = row_document(row)?;
            document::apply_patch(&mut doc, &patch)?;
            document::touch(&mut doc, now);
            self.replace(&mut *tx, &id, &doc).await?;
        }
        tx.commit().await?;
        debug!(collection = %self.collection, changed = rows.len(), "update_many applied");
        Ok(rows.len())
    }

    async fn upsert(&self, filter: &Filter, data: Document) -> Result<UpsertOutcome, StorageError> {
        let mut tx = self.pool.begin().await?;
        // Serialize upserts per collection so two writers cannot both insert.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&self.collection)
            .execute(&mut *tx)
            .await?;

        let (mut statement, sql) = self.select("id, doc", filter);
        statement.push_str(" ORDER BY seq LIMIT 1 FOR UPDATE");
        let existing = bind_params(sqlx::query(&statement), sql.into_params())
            .fetch_optional(&mut *tx)
            .await?;

        let now = Utc::now();
        let outcome = match existing {
            Some(row) => {
                let id: String = row.try_get("id")?;
                let mut doc = row_document(&row)?;
                document::apply_patch(&mut doc, &data)?;
                document::touch(&mut doc, now);
                self.replace(&mut *tx, &id, &doc).await?;
                UpsertOutcome {
                    created: false,
                    updated: true,
                    record: doc,
                }
            }
            None => {
                let record = document::stamp_new(data, &document::new_document_id(), now)?;
                self.insert(&mut *tx, &record).await?;
                UpsertOutcome {
                    created: true,
                    updated: false,
                    record,
                }
            }
        };
        tx.commit().await?;
        Ok(outcome)
    }

    async fn count(&self, filter: &Filter) -> Result<usize, StorageError> {
        let (statement, sql) = self.select("COUNT(*) AS total", filter);
        let row = bind_params(sqlx::query(&statement), sql.into_params())
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = row.try_get("total")?;
        Ok(usize::try_from(total).unwrap_or_default())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
