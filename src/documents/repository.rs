// src/documents/repository.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::data_model::{Document, DocumentStatus};
use crate::error::{PipelineError, Result};

/// The document record store: one row per uploaded document.
#[async_trait]
pub trait DocumentRepository: Send + Sync {
    async fn create(&self, document: &Document) -> Result<()>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Document>>;

    async fn find_by_user(&self, user_id: Uuid) -> Result<Vec<Document>>;

    /// Writes status + error message and bumps `updated_at`. Returns the
    /// updated row, or `None` when the id is unknown.
    async fn update_status(
        &self,
        id: Uuid,
        status: DocumentStatus,
        error_message: Option<String>,
    ) -> Result<Option<Document>>;
}

#[derive(Debug, FromRow)]
struct DocumentRow {
    id: Uuid,
    user_id: Uuid,
    blob_key: String,
    status: String,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl DocumentRow {
    fn into_document(self) -> Result<Document> {
        let status = DocumentStatus::parse(&self.status).ok_or_else(|| {
            PipelineError::Unexpected(format!(
                "document {} has unknown status '{}'",
                self.id, self.status
            ))
        })?;
        Ok(Document {
            id: self.id,
            user_id: self.user_id,
            blob_key: self.blob_key,
            status,
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Postgres-backed repository; the deployed document record store.
#[derive(Clone)]
pub struct PgDocumentRepository {
    pool: PgPool,
}

impl PgDocumentRepository {
    pub fn new(pool: PgPool) -> Self {
        PgDocumentRepository { pool }
    }
}

#[async_trait]
impl DocumentRepository for PgDocumentRepository {
    async fn create(&self, document: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, user_id, blob_key, status, error_message, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(document.id)
        .bind(document.user_id)
        .bind(&document.blob_key)
        .bind(document.status.as_str())
        .bind(&document.error_message)
        .bind(document.created_at)
        .bind(document.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Document>> {
        let row: Option<DocumentRow> = sqlx::query_as(
            "SELECT id, user_id, blob_key, status, error_message, created_at, updated_at
             FROM documents WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DocumentRow::into_document).transpose()
    }

    async fn find_by_user(&self, user_id: Uuid) -> Result<Vec<Document>> {
        let rows: Vec<DocumentRow> = sqlx::query_as(
            "SELECT id, user_id, blob_key, status, error_message, created_at, updated_at
             FROM documents WHERE user_id = $1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(DocumentRow::into_document).collect()
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: DocumentStatus,
        error_message: Option<String>,
    ) -> Result<Option<Document>> {
        let row: Option<DocumentRow> = sqlx::query_as(
            r#"
            UPDATE documents
            SET status = $2, error_message = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING id, user_id, blob_key, status, error_message, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error_message)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DocumentRow::into_document).transpose()
    }
}

/// In-memory repository for tests and local runs.
#[derive(Default)]
pub struct InMemoryDocumentRepository {
    documents: RwLock<HashMap<Uuid, Document>>,
}

impl InMemoryDocumentRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentRepository for InMemoryDocumentRepository {
    async fn create(&self, document: &Document) -> Result<()> {
        self.documents
            .write()
            .await
            .insert(document.id, document.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Document>> {
        Ok(self.documents.read().await.get(&id).cloned())
    }

    async fn find_by_user(&self, user_id: Uuid) -> Result<Vec<Document>> {
        let mut docs: Vec<Document> = self
            .documents
            .read()
            .await
            .values()
            .filter(|d| d.user_id == user_id)
            .cloned()
            .collect();
        docs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(docs)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: DocumentStatus,
        error_message: Option<String>,
    ) -> Result<Option<Document>> {
        let mut documents = self.documents.write().await;
        match documents.get_mut(&id) {
            Some(doc) => {
                doc.status = status;
                doc.error_message = error_message;
                doc.updated_at = Utc::now();
                Ok(Some(doc.clone()))
            }
            None => Ok(None),
        }
    }
}
