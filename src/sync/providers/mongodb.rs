use async_trait::async_trait;
use bson::doc;
use chrono::{DateTime, Utc};
use mongodb::options::{ClientOptions, ReplaceOptions};
use mongodb::{Client, Database};

use crate::error::{SyncError, SyncResult};
use crate::sync::remote::{remote_table, RemoteStore, DELETE_MARKER_TABLE};
use crate::vault::models::{DatabaseType, DeleteMarker, SyncDocument};

/// MongoDB replication target: one collection per entity type, documents
/// serialized straight from [`SyncDocument`] (timestamps travel as RFC 3339
/// strings, which also makes the `$gt` marker filter order correctly).
pub struct MongoRemote {
    url: String,
    database: Option<Database>,
}

impl MongoRemote {
    pub fn new(url: String) -> Self {
        Self {
            url,
            database: None,
        }
    }

    fn database(&self) -> SyncResult<&Database> {
        self.database
            .as_ref()
            .ok_or_else(|| SyncError::RemoteUnavailable("mongodb: not connected".into()))
    }
}

#[async_trait]
impl RemoteStore for MongoRemote {
    async fn connect(&mut self) -> SyncResult<()> {
        if self.database.is_some() {
            return Ok(());
        }

        let options = ClientOptions::parse(&self.url)
            .await
            .map_err(|e| SyncError::RemoteUnavailable(format!("mongodb: {}", e)))?;
        let default_db = options
            .default_database
            .clone()
            .unwrap_or_else(|| "kerminal".to_string());

        let client = Client::with_options(options)
            .map_err(|e| SyncError::RemoteUnavailable(format!("mongodb: {}", e)))?;
        self.database = Some(client.database(&default_db));
        self.ping().await
    }

    async fn disconnect(&mut self) -> SyncResult<()> {
        self.database = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.database.is_some()
    }

    async fn ping(&self) -> SyncResult<()> {
        self.database()?
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| SyncError::RemoteUnavailable(format!("mongodb: {}", e)))?;
        Ok(())
    }

    async fn ensure_schema(&self) -> SyncResult<()> {
        // Collections are created on first insert; nothing to do.
        Ok(())
    }

    async fn fetch_documents(&self, entity_type: &str) -> SyncResult<Vec<SyncDocument>> {
        let collection = self
            .database()?
            .collection::<SyncDocument>(remote_table(entity_type)?);

        let mut cursor = collection
            .find(None, None)
            .await
            .map_err(|e| SyncError::Transport(format!("mongodb: {}", e)))?;

        let mut documents = Vec::new();
        while cursor
            .advance()
            .await
            .map_err(|e| SyncError::Transport(format!("mongodb: {}", e)))?
        {
            let document = cursor
                .deserialize_current()
                .map_err(|e| SyncError::SchemaMismatch(format!("mongodb: {}", e)))?;
            documents.push(document);
        }
        Ok(documents)
    }

    async fn upsert_document(&self, doc_record: &SyncDocument) -> SyncResult<()> {
        let collection = self
            .database()?
            .collection::<SyncDocument>(remote_table(&doc_record.entity_type)?);

        collection
            .replace_one(
                doc! { "id": &doc_record.id },
                doc_record,
                ReplaceOptions::builder().upsert(true).build(),
            )
            .await
            .map_err(|e| SyncError::Transport(format!("mongodb: {}", e)))?;
        Ok(())
    }

    async fn delete_document(&self, entity_type: &str, id: &str) -> SyncResult<()> {
        let collection = self
            .database()?
            .collection::<SyncDocument>(remote_table(entity_type)?);
        collection
            .delete_one(doc! { "id": id }, None)
            .await
            .map_err(|e| SyncError::Transport(format!("mongodb: {}", e)))?;
        Ok(())
    }

    async fn fetch_delete_markers(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<Vec<DeleteMarker>> {
        let collection = self
            .database()?
            .collection::<DeleteMarker>(DELETE_MARKER_TABLE);

        let filter = since.map(|since| doc! { "deletedAt": { "$gt": since.to_rfc3339() } });
        let mut cursor = collection
            .find(filter, None)
            .await
            .map_err(|e| SyncError::Transport(format!("mongodb: {}", e)))?;

        let mut markers = Vec::new();
        while cursor
            .advance()
            .await
            .map_err(|e| SyncError::Transport(format!("mongodb: {}", e)))?
        {
            markers.push(
                cursor
                    .deserialize_current()
                    .map_err(|e| SyncError::SchemaMismatch(format!("mongodb: {}", e)))?,
            );
        }
        Ok(markers)
    }

    async fn upsert_delete_marker(&self, marker: &DeleteMarker) -> SyncResult<()> {
        let collection = self
            .database()?
            .collection::<DeleteMarker>(DELETE_MARKER_TABLE);
        collection
            .replace_one(
                doc! { "id": &marker.id },
                marker,
                ReplaceOptions::builder().upsert(true).build(),
            )
            .await
            .map_err(|e| SyncError::Transport(format!("mongodb: {}", e)))?;
        Ok(())
    }

    fn provider_type(&self) -> DatabaseType {
        DatabaseType::Mongodb
    }
}
