//! Persona service: batch key-value operations, app import/export and
//! dataset management on top of a [`StorageEngine`].
//!
//! Batch writes are sequential and non-atomic. Each entry lands in either
//! `successKeys` or `failKeys`; a cancelled request stops the batch with an
//! error instead.

pub mod code;
pub mod types;

pub use code::{ServiceError, ServiceResult};
pub use types::*;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::RequestContext;
use crate::storage::codec;
use crate::storage::{
    DataType, DeleteReport, FieldFilters, KeyVersion, StorageEngine, StorageError, StorageResult,
};

/// Prefix of every key that belongs to an application.
pub const APP_KEY_PREFIX: &str = "app_id:";

/// Which key space a batch operation works on.
#[derive(Clone, Copy, Debug)]
enum Scope {
    Shared,
    User,
}

pub struct PersonaService {
    engine: Arc<dyn StorageEngine>,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

impl PersonaService {
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    async fn set_values(
        &self,
        ctx: &RequestContext,
        scope: Scope,
        req: &BatchSetValueReq,
    ) -> ServiceResult<BatchSetValueResp> {
        if matches!(scope, Scope::User) {
            ctx.require_user_id()?;
        }

        let mut resp = BatchSetValueResp::default();
        for entry in &req.keys {
            let result = match scope {
                Scope::Shared => {
                    self.engine
                        .put_with_version(ctx, &entry.version, &entry.key, &entry.value)
                        .await
                }
                Scope::User => {
                    self.engine
                        .user_put_with_version(ctx, &entry.version, &entry.key, &entry.value)
                        .await
                }
            };

            match result {
                Ok(()) => resp.success_keys.push(entry.key.clone()),
                Err(StorageError::Cancelled) => return Err(StorageError::Cancelled.into()),
                Err(e) => {
                    warn!(key = %entry.key, version = %entry.version, error = %e, "set value failed");
                    resp.fail_keys.push(entry.key.clone());
                }
            }
        }

        debug!(
            ?scope,
            succeeded = resp.success_keys.len(),
            failed = resp.fail_keys.len(),
            "batch set"
        );
        Ok(resp)
    }

    async fn get_values(
        &self,
        ctx: &RequestContext,
        scope: Scope,
        req: &BatchGetValueReq,
    ) -> ServiceResult<BatchGetValueResp> {
        if matches!(scope, Scope::User) {
            ctx.require_user_id()?;
        }

        let mut resp = BatchGetValueResp::default();
        for entry in &req.keys {
            let result = match scope {
                Scope::Shared => self.engine.get_with_version(ctx, &entry.version, &entry.key).await,
                Scope::User => {
                    self.engine
                        .user_get_with_version(ctx, &entry.version, &entry.key)
                        .await
                }
            };

            match result {
                Ok(found) => resp.result.extend(found),
                Err(StorageError::Cancelled) => return Err(StorageError::Cancelled.into()),
                Err(e) => warn!(key = %entry.key, version = %entry.version, error = %e, "get value failed"),
            }
        }
        Ok(resp)
    }

    /// Writes each entry under the caller's user scope.
    pub async fn user_set_value(
        &self,
        ctx: &RequestContext,
        req: &BatchSetValueReq,
    ) -> ServiceResult<BatchSetValueResp> {
        self.set_values(ctx, Scope::User, req).await
    }

    /// Reads each entry from the caller's user scope. Missing and failing
    /// keys are left out of the result.
    pub async fn user_get_value(
        &self,
        ctx: &RequestContext,
        req: &BatchGetValueReq,
    ) -> ServiceResult<BatchGetValueResp> {
        self.get_values(ctx, Scope::User, req).await
    }

    pub async fn set_value(
        &self,
        ctx: &RequestContext,
        req: &BatchSetValueReq,
    ) -> ServiceResult<BatchSetValueResp> {
        self.set_values(ctx, Scope::Shared, req).await
    }

    pub async fn get_value(
        &self,
        ctx: &RequestContext,
        req: &BatchGetValueReq,
    ) -> ServiceResult<BatchGetValueResp> {
        self.get_values(ctx, Scope::Shared, req).await
    }

    /// Copies a versioned value to a new version/key. Returns the copied
    /// value, or `None` when the source does not exist.
    pub async fn clone_value(
        &self,
        ctx: &RequestContext,
        req: &CloneValueReq,
    ) -> ServiceResult<Option<String>> {
        let found = self
            .engine
            .get_with_version(ctx, &req.key.version, &req.key.key)
            .await?;
        let Some(value) = found.into_values().next() else {
            return Ok(None);
        };

        self.engine
            .put_with_version(ctx, &req.new_key.version, &req.new_key.key, &value)
            .await?;
        Ok(Some(value))
    }

    /// Every record of an application.
    pub async fn export_data(
        &self,
        ctx: &RequestContext,
        req: &ExportDataReq,
    ) -> ServiceResult<ExportDataResp> {
        if req.app_id.is_empty() {
            return Err(ServiceError::InvalidParams("appId is required".to_string()));
        }
        let app_data = self
            .engine
            .get_with_prefix(ctx, &format!("{}{}", APP_KEY_PREFIX, req.app_id))
            .await?;
        info!(app_id = %req.app_id, records = app_data.len(), "exported app data");
        Ok(ExportDataResp { app_data })
    }

    /// Writes exported records back. Keys must have the shapes an export
    /// produces; a malformed key rejects the whole import before any write.
    /// Otherwise stops at the first failed write, and records before it stay
    /// written.
    pub async fn import_data(&self, ctx: &RequestContext, req: &ImportDataReq) -> ServiceResult<()> {
        let entries = req
            .app_data
            .iter()
            .map(|pair| codec::decode_exported(APP_KEY_PREFIX, &pair.key).map(|k| (k, &pair.value)))
            .collect::<StorageResult<Vec<_>>>()?;

        for ((key, version), value) in entries {
            match version {
                Some(version) => self.engine.put_with_version(ctx, version, key, value).await?,
                None => self.engine.put(ctx, key, value).await?,
            }
        }
        info!(records = req.app_data.len(), "imported app data");
        Ok(())
    }

    pub async fn create_dataset(
        &self,
        ctx: &RequestContext,
        req: &CreateDataSetReq,
    ) -> ServiceResult<CreateDataSetResp> {
        let documents = self.engine.documents()?;
        let dataset = DataSet {
            id: Uuid::new_v4().to_string(),
            name: req.name.clone(),
            tag: req.tag.clone(),
            kind: req.kind,
            content: req.content.clone(),
            created_at: unix_now(),
            data_type: DataType::DataSet,
        };

        let body = serde_json::to_value(&dataset).map_err(StorageError::from)?;
        documents.put_data(ctx, &dataset.id, &body).await?;
        debug!(id = %dataset.id, "created dataset");
        Ok(CreateDataSetResp { id: dataset.id })
    }

    /// Returns `None` when no dataset exists under `id`. Key-value records
    /// sharing the index are never returned.
    pub async fn get_dataset_by_id(
        &self,
        ctx: &RequestContext,
        id: &str,
    ) -> ServiceResult<Option<DataSetVo>> {
        let documents = self.engine.documents()?;
        match documents.get_data(ctx, id).await? {
            Some(doc) if is_dataset(&doc) => {
                let dataset: DataSet = serde_json::from_value(doc).map_err(StorageError::from)?;
                Ok(Some(dataset.into()))
            }
            _ => Ok(None),
        }
    }

    /// Replaces the mutable fields of a dataset. `id` and `created_at` are
    /// never touched.
    pub async fn update_dataset(&self, ctx: &RequestContext, req: &UpdateDataSetReq) -> ServiceResult<()> {
        let documents = self.engine.documents()?;
        if self.get_dataset_by_id(ctx, &req.id).await?.is_none() {
            return Err(ServiceError::DataSetNotFound(req.id.clone()));
        }

        let partial = json!({
            "name": req.name,
            "tag": req.tag,
            "type": req.kind,
            "content": req.content,
        });
        if !documents.update_data(ctx, &req.id, &partial).await? {
            return Err(ServiceError::DataSetNotFound(req.id.clone()));
        }
        Ok(())
    }

    /// Datasets matching every given condition. At least one condition is
    /// required.
    pub async fn get_by_condition_set(
        &self,
        ctx: &RequestContext,
        req: &GetByConditionSetReq,
    ) -> ServiceResult<GetByConditionSetResp> {
        let documents = self.engine.documents()?;

        let mut filters = FieldFilters::new();
        if let Some(name) = req.name.as_ref().filter(|s| !s.is_empty()) {
            filters.insert("name".to_string(), json!(name));
        }
        if let Some(tag) = req.tag.as_ref().filter(|s| !s.is_empty()) {
            filters.insert("tag".to_string(), json!(tag));
        }
        if let Some(kind) = req.kind.filter(|k| *k != 0) {
            filters.insert("type".to_string(), json!(kind));
        }
        if filters.is_empty() {
            return Err(ServiceError::InvalidParams(
                "at least one of name, tag or type is required".to_string(),
            ));
        }
        filters.insert("data_type".to_string(), json!(DataType::DataSet.as_str()));

        let list = documents
            .get_data_by_kvs(ctx, &filters)
            .await?
            .into_iter()
            .filter_map(|doc| match serde_json::from_value::<DataSetVo>(doc) {
                Ok(vo) => Some(vo),
                Err(e) => {
                    warn!(error = %e, "skipping malformed dataset");
                    None
                }
            })
            .collect();
        Ok(GetByConditionSetResp { list })
    }

    /// Deleting an absent dataset succeeds. Key-value records sharing the
    /// index count as absent and are left alone.
    pub async fn delete_dataset(&self, ctx: &RequestContext, id: &str) -> ServiceResult<()> {
        let documents = self.engine.documents()?;
        match documents.get_data(ctx, id).await? {
            Some(doc) if is_dataset(&doc) => documents.delete_data(ctx, id).await?,
            Some(_) => debug!(id, "delete skipped non-dataset document"),
            None => {}
        }
        Ok(())
    }

    /// Version/key pairs under a physical key prefix.
    pub async fn search_keys(
        &self,
        ctx: &RequestContext,
        prefix: &str,
    ) -> StorageResult<Vec<KeyVersion>> {
        self.engine.search_with_key(ctx, prefix).await
    }

    /// Deletes everything under a physical key prefix.
    pub async fn purge(
        &self,
        ctx: &RequestContext,
        prefix: &str,
    ) -> StorageResult<DeleteReport> {
        self.engine.delete_with_key(ctx, prefix).await
    }
}

fn is_dataset(doc: &Value) -> bool {
    doc.get("data_type").and_then(Value::as_str) == Some(DataType::DataSet.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::search::MemoryIndex;
    use crate::storage::{KeyValuePair, SearchIndexEngine};

    async fn service() -> PersonaService {
        let engine = SearchIndexEngine::new(Arc::new(MemoryIndex::new()), "persona", 10);
        engine.ensure_index().await.unwrap();
        PersonaService::new(Arc::new(engine))
    }

    fn kv(version: &str, key: &str, value: &str) -> VersionKeyValue {
        VersionKeyValue {
            version: version.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    #[tokio::test]
    async fn test_set_and_get_value() {
        let service = service().await;
        let ctx = RequestContext::new();

        let resp = service
            .set_value(&ctx, &BatchSetValueReq {
                keys: vec![kv("v1", "a", "1"), kv("v1", "b", "2"), kv("v1", "", "3")],
            })
            .await
            .unwrap();
        assert_eq!(resp.success_keys, vec!["a", "b"]);
        assert_eq!(resp.fail_keys, vec![""]);

        let got = service
            .get_value(&ctx, &BatchGetValueReq {
                keys: vec![
                    VersionKey { version: "v1".into(), key: "a".into() },
                    VersionKey { version: "v1".into(), key: "b".into() },
                    VersionKey { version: "v2".into(), key: "a".into() },
                ],
            })
            .await
            .unwrap();
        assert_eq!(got.result.len(), 2);
        assert_eq!(got.result["b"], "2");
    }

    #[tokio::test]
    async fn test_user_set_requires_user() {
        let service = service().await;
        let result = service
            .user_set_value(&RequestContext::new(), &BatchSetValueReq {
                keys: vec![kv("v1", "a", "1")],
            })
            .await;
        assert_eq!(result.unwrap_err().code(), code::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_cancelled_batch() {
        let service = service().await;
        let ctx = RequestContext::new();
        ctx.cancel();
        let result = service
            .set_value(&ctx, &BatchSetValueReq { keys: vec![kv("v1", "a", "1")] })
            .await;
        assert!(matches!(result, Err(ServiceError::Storage(StorageError::Cancelled))));
    }

    #[tokio::test]
    async fn test_clone_value() {
        let service = service().await;
        let ctx = RequestContext::new();
        service
            .set_value(&ctx, &BatchSetValueReq { keys: vec![kv("v1", "layout", "grid")] })
            .await
            .unwrap();

        let cloned = service
            .clone_value(&ctx, &CloneValueReq {
                key: VersionKey { version: "v1".into(), key: "layout".into() },
                new_key: VersionKey { version: "v2".into(), key: "layout".into() },
            })
            .await
            .unwrap();
        assert_eq!(cloned.as_deref(), Some("grid"));

        let missing = service
            .clone_value(&ctx, &CloneValueReq {
                key: VersionKey { version: "v9".into(), key: "layout".into() },
                new_key: VersionKey { version: "v10".into(), key: "layout".into() },
            })
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_export_then_import() {
        let service = service().await;
        let ctx = RequestContext::new();
        service.engine().put(&ctx, "app_id:A:theme", "dark").await.unwrap();
        service.engine().put(&ctx, "app_id:A:menu", "left").await.unwrap();
        service.engine().put(&ctx, "app_id:B:theme", "light").await.unwrap();

        let exported = service
            .export_data(&ctx, &ExportDataReq { app_id: "A".into() })
            .await
            .unwrap();
        assert_eq!(exported.app_data.len(), 2);

        let purged = service.purge(&ctx, "app_id:A").await.unwrap();
        assert_eq!(purged.deleted.len(), 2);

        service
            .import_data(&ctx, &ImportDataReq { app_data: exported.app_data.clone() })
            .await
            .unwrap();
        let again = service
            .export_data(&ctx, &ExportDataReq { app_id: "A".into() })
            .await
            .unwrap();
        assert_eq!(again.app_data.len(), 2);

        assert!(matches!(
            service.export_data(&ctx, &ExportDataReq { app_id: String::new() }).await,
            Err(ServiceError::InvalidParams(_))
        ));
    }

    #[tokio::test]
    async fn test_dataset_lifecycle() {
        let service = service().await;
        let ctx = RequestContext::new();

        let created = service
            .create_dataset(&ctx, &CreateDataSetReq {
                name: "regions".into(),
                tag: "geo".into(),
                kind: 1,
                content: "[]".into(),
            })
            .await
            .unwrap();

        let before = service.get_dataset_by_id(&ctx, &created.id).await.unwrap().unwrap();
        assert_eq!(before.name, "regions");

        service
            .update_dataset(&ctx, &UpdateDataSetReq {
                id: created.id.clone(),
                name: "zones".into(),
                tag: "geo".into(),
                kind: 2,
                content: "[1]".into(),
            })
            .await
            .unwrap();

        let after = service.get_dataset_by_id(&ctx, &created.id).await.unwrap().unwrap();
        assert_eq!(after.name, "zones");
        assert_eq!(after.kind, 2);
        assert_eq!(after.created_at, before.created_at);
        assert_eq!(after.id, created.id);

        let found = service
            .get_by_condition_set(&ctx, &GetByConditionSetReq {
                tag: Some("geo".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(found.list, vec![after]);

        service.delete_dataset(&ctx, &created.id).await.unwrap();
        assert!(service.get_dataset_by_id(&ctx, &created.id).await.unwrap().is_none());
        service.delete_dataset(&ctx, &created.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_missing_dataset() {
        let service = service().await;
        let result = service
            .update_dataset(&RequestContext::new(), &UpdateDataSetReq {
                id: "nope".into(),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(ServiceError::DataSetNotFound(_))));
    }

    #[tokio::test]
    async fn test_condition_set_needs_a_condition() {
        let service = service().await;
        let result = service
            .get_by_condition_set(&RequestContext::new(), &GetByConditionSetReq {
                name: Some(String::new()),
                ..Default::default()
            })
            .await;
        assert_eq!(result.unwrap_err().code(), code::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_kv_record_is_not_a_dataset() {
        let service = service().await;
        let ctx = RequestContext::new();
        service.engine().put(&ctx, "plain", "v").await.unwrap();
        assert!(service.get_dataset_by_id(&ctx, "plain").await.unwrap().is_none());

        service.delete_dataset(&ctx, "plain").await.unwrap();
        let kept = service.engine().get(&ctx, "plain").await.unwrap();
        assert_eq!(kept.get("plain").map(String::as_str), Some("v"));
    }

    #[tokio::test]
    async fn test_import_rejects_foreign_shapes() {
        let service = service().await;
        let ctx = RequestContext::new();
        let alice = RequestContext::new().with_user_id("alice");

        let result = service
            .import_data(&ctx, &ImportDataReq {
                app_data: vec![
                    KeyValuePair { key: "app_id:A:ok".into(), value: "1".into() },
                    KeyValuePair { key: "alice\u{1f}v1\u{1f}layout".into(), value: "evil".into() },
                ],
            })
            .await;
        assert_eq!(result.unwrap_err().code(), code::INVALID_PARAMS);

        assert!(service.engine().get(&ctx, "app_id:A:ok").await.unwrap().is_empty());
        assert!(service
            .engine()
            .user_get_with_version(&alice, "v1", "layout")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_import_restores_versioned_keys() {
        let service = service().await;
        let ctx = RequestContext::new();
        service
            .set_value(&ctx, &BatchSetValueReq { keys: vec![kv("v3", "app_id:A:layout", "grid")] })
            .await
            .unwrap();

        let exported = service
            .export_data(&ctx, &ExportDataReq { app_id: "A".into() })
            .await
            .unwrap();
        assert_eq!(exported.app_data.len(), 1);
        service.purge(&ctx, "app_id:A").await.unwrap();

        service
            .import_data(&ctx, &ImportDataReq { app_data: exported.app_data })
            .await
            .unwrap();
        let got = service
            .get_value(&ctx, &BatchGetValueReq {
                keys: vec![VersionKey { version: "v3".into(), key: "app_id:A:layout".into() }],
            })
            .await
            .unwrap();
        assert_eq!(got.result["app_id:A:layout"], "grid");
    }
}
