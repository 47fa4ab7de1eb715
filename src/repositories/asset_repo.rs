use crate::{
    database::DatabasePool,
    error::ApiError,
    models::{Asset, AssetRow},
};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{types::Json, Postgres, Transaction};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

/// Merge step run by [`AssetRepository::upsert`] while the key is held.
pub type MergeFn<'a> = &'a (dyn Fn(Option<Asset>) -> Asset + Send + Sync);

/// Edit step run by [`AssetRepository::update_by_id`] while the row is held.
/// It may run more than once when the asset moves underneath it, so it must
/// be a pure function of its input.
pub type EditFn<'a> = &'a (dyn Fn(Asset) -> Asset + Send + Sync);

#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub asset: Asset,
    pub created: bool,
}

#[async_trait]
pub trait AssetRepository: Send + Sync {
    async fn find_by_key(
        &self,
        organization_id: &str,
        domain: &str,
    ) -> Result<Option<Asset>, ApiError>;

    /// Read the asset for `(organization_id, domain)`, run `merge` on it and
    /// write the result back. Calls for the same key never interleave.
    async fn upsert(
        &self,
        organization_id: &str,
        domain: &str,
        merge: MergeFn<'_>,
    ) -> Result<UpsertOutcome, ApiError>;

    async fn list_by_organization(&self, organization_id: &str) -> Result<Vec<Asset>, ApiError>;

    async fn get_by_id(&self, organization_id: &str, id: &Uuid)
        -> Result<Option<Asset>, ApiError>;

    /// Apply a manual edit. Renaming onto an existing key is a conflict.
    async fn update_by_id(
        &self,
        organization_id: &str,
        id: &Uuid,
        edit: EditFn<'_>,
    ) -> Result<Asset, ApiError>;

    /// Delete the listed assets of one organization; returns how many existed.
    async fn delete_many(&self, organization_id: &str, ids: &[Uuid]) -> Result<u64, ApiError>;
}

pub struct SqlxAssetRepository {
    pool: DatabasePool,
    max_retries: u32,
}

impl SqlxAssetRepository {
    pub fn new(pool: DatabasePool, max_retries: u32) -> Self {
        Self { pool, max_retries }
    }

    async fn upsert_once(
        &self,
        organization_id: &str,
        domain: &str,
        merge: MergeFn<'_>,
    ) -> Result<UpsertOutcome, ApiError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        lock_asset_key(&mut tx, organization_id, domain).await?;

        let existing = sqlx::query_as::<_, AssetRow>(
            r#"
            SELECT id, organization_id, domain, document, last_seen, created_at, updated_at
            FROM assets
            WHERE organization_id = $1 AND domain = $2
            FOR UPDATE
            "#,
        )
        .bind(organization_id)
        .bind(domain)
        .fetch_optional(&mut *tx)
        .await?
        .map(Asset::from);

        let created = existing.is_none();
        let created_at = existing.as_ref().map(|a| a.created_at).unwrap_or(now);

        let mut asset = merge(existing);
        asset.organization_id = organization_id.to_string();
        asset.domain = domain.to_string();
        asset.created_at = created_at;
        asset.updated_at = now;

        let row = sqlx::query_as::<_, AssetRow>(
            r#"
            INSERT INTO assets (id, organization_id, domain, document, last_seen, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (organization_id, domain) DO UPDATE
            SET document = EXCLUDED.document,
                last_seen = EXCLUDED.last_seen,
                updated_at = EXCLUDED.updated_at
            RETURNING id, organization_id, domain, document, last_seen, created_at, updated_at
            "#,
        )
        .bind(asset.id)
        .bind(&asset.organization_id)
        .bind(&asset.domain)
        .bind(Json(&asset))
        .bind(asset.last_seen)
        .bind(asset.created_at)
        .bind(asset.updated_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(UpsertOutcome {
            asset: Asset::from(row),
            created,
        })
    }

    /// One locked edit attempt. `None` means the asset was renamed between the
    /// unlocked read and the locked one, and the caller should start over.
    async fn update_once(
        &self,
        organization_id: &str,
        id: &Uuid,
        edit: EditFn<'_>,
    ) -> Result<Option<Asset>, ApiError> {
        let not_found = || ApiError::not_found(format!("asset {} not found", id));
        let current = self.get_by_id(organization_id, id).await?.ok_or_else(not_found)?;
        let old_domain = current.domain.clone();
        let new_domain = edit(current).domain;

        let mut tx = self.pool.begin().await?;

        // a rename writes the target key too; lock both in key order
        let mut domains = vec![old_domain.as_str(), new_domain.as_str()];
        domains.sort_unstable();
        domains.dedup();
        for domain in domains {
            lock_asset_key(&mut tx, organization_id, domain).await?;
        }

        let existing = sqlx::query_as::<_, AssetRow>(
            r#"
            SELECT id, organization_id, domain, document, last_seen, created_at, updated_at
            FROM assets
            WHERE organization_id = $1 AND id = $2
            FOR UPDATE
            "#,
        )
        .bind(organization_id)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .map(Asset::from)
        .ok_or_else(not_found)?;
        if existing.domain != old_domain {
            return Ok(None);
        }

        let mut asset = edit(existing);
        asset.id = *id;
        asset.organization_id = organization_id.to_string();
        if asset.domain != new_domain {
            return Ok(None);
        }

        let row = sqlx::query_as::<_, AssetRow>(
            r#"
            UPDATE assets
            SET domain = $1, document = $2, last_seen = $3, updated_at = $4
            WHERE organization_id = $5 AND id = $6
            RETURNING id, organization_id, domain, document, last_seen, created_at, updated_at
            "#,
        )
        .bind(&asset.domain)
        .bind(Json(&asset))
        .bind(asset.last_seen)
        .bind(asset.updated_at)
        .bind(organization_id)
        .bind(id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.code().as_deref() == Some("23505") => {
                ApiError::conflict(format!("an asset for {} already exists", asset.domain))
            }
            other => ApiError::Database(other),
        })?;

        tx.commit().await?;

        Ok(Some(Asset::from(row)))
    }
}

/// Serialize writers of one `(organization, domain)` key for the rest of the transaction.
async fn lock_asset_key(
    tx: &mut Transaction<'_, Postgres>,
    organization_id: &str,
    domain: &str,
) -> Result<(), ApiError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(format!("{}/{}", organization_id, domain))
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Contention errors worth another attempt: serialization failure, deadlock
/// and a lost insert race on the unique key.
fn is_retryable(error: &ApiError) -> bool {
    match error {
        ApiError::Database(sqlx::Error::Database(db)) => {
            matches!(db.code().as_deref(), Some("40001") | Some("40P01") | Some("23505"))
        }
        ApiError::Database(sqlx::Error::PoolTimedOut) => true,
        _ => false,
    }
}

#[async_trait]
impl AssetRepository for SqlxAssetRepository {
    async fn find_by_key(
        &self,
        organization_id: &str,
        domain: &str,
    ) -> Result<Option<Asset>, ApiError> {
        let row = sqlx::query_as::<_, AssetRow>(
            r#"
            SELECT id, organization_id, domain, document, last_seen, created_at, updated_at
            FROM assets
            WHERE organization_id = $1 AND domain = $2
            "#,
        )
        .bind(organization_id)
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Asset::from))
    }

    async fn upsert(
        &self,
        organization_id: &str,
        domain: &str,
        merge: MergeFn<'_>,
    ) -> Result<UpsertOutcome, ApiError> {
        let mut attempt = 0;
        loop {
            match self.upsert_once(organization_id, domain, merge).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if attempt < self.max_retries && is_retryable(&e) => {
                    attempt += 1;
                    tracing::warn!(
                        organization_id,
                        domain,
                        attempt,
                        error = %e,
                        "asset upsert contended, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(25 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn list_by_organization(&self, organization_id: &str) -> Result<Vec<Asset>, ApiError> {
        let rows = sqlx::query_as::<_, AssetRow>(
            r#"
            SELECT id, organization_id, domain, document, last_seen, created_at, updated_at
            FROM assets
            WHERE organization_id = $1
            ORDER BY domain
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Asset::from).collect())
    }

    async fn get_by_id(
        &self,
        organization_id: &str,
        id: &Uuid,
    ) -> Result<Option<Asset>, ApiError> {
        let row = sqlx::query_as::<_, AssetRow>(
            r#"
            SELECT id, organization_id, domain, document, last_seen, created_at, updated_at
            FROM assets
            WHERE organization_id = $1 AND id = $2
            "#,
        )
        .bind(organization_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Asset::from))
    }

    async fn update_by_id(
        &self,
        organization_id: &str,
        id: &Uuid,
        edit: EditFn<'_>,
    ) -> Result<Asset, ApiError> {
        let mut attempt = 0;
        loop {
            match self.update_once(organization_id, id, edit).await? {
                Some(asset) => return Ok(asset),
                None if attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(organization_id, %id, attempt, "asset moved during update, retrying");
                }
                None => {
                    return Err(ApiError::conflict(format!(
                        "asset {} changed concurrently",
                        id
                    )))
                }
            }
        }
    }

    async fn delete_many(&self, organization_id: &str, ids: &[Uuid]) -> Result<u64, ApiError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query("DELETE FROM assets WHERE organization_id = $1 AND id = ANY($2)")
            .bind(organization_id)
            .bind(ids)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

type AssetKey = (String, String);
type KeyLocks = Mutex<HashMap<AssetKey, Arc<tokio::sync::Mutex<()>>>>;

/// Held lock on one asset key. Dropping it releases the key and removes the
/// table entry once nobody else holds or waits on it.
struct KeyGuard<'a> {
    table: &'a KeyLocks,
    key: AssetKey,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let Ok(mut locks) = self.table.lock() else {
            return;
        };
        // table entry plus this guard: no other holder or waiter
        let idle = Arc::strong_count(&self.lock) == 2
            && locks
                .get(&self.key)
                .is_some_and(|entry| Arc::ptr_eq(entry, &self.lock));
        if idle {
            locks.remove(&self.key);
        }
    }
}

/// Process-local store with the same per-key guarantees as the SQL store.
#[derive(Default)]
pub struct InMemoryAssetRepository {
    assets: tokio::sync::RwLock<HashMap<AssetKey, Asset>>,
    key_locks: KeyLocks,
}

impl InMemoryAssetRepository {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_key(&self, key: AssetKey) -> Result<KeyGuard<'_>, ApiError> {
        let lock = {
            let mut locks = self
                .key_locks
                .lock()
                .map_err(|_| ApiError::internal("asset key lock table poisoned"))?;
            locks.entry(key.clone()).or_default().clone()
        };
        let guard = lock.clone().lock_owned().await;
        Ok(KeyGuard {
            table: &self.key_locks,
            key,
            lock,
            guard: Some(guard),
        })
    }

    /// Lock one or two keys, always in key order so renames cannot deadlock.
    async fn lock_keys(&self, a: &AssetKey, b: &AssetKey) -> Result<Vec<KeyGuard<'_>>, ApiError> {
        let mut keys = vec![a.clone(), b.clone()];
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push(self.lock_key(key).await?);
        }
        Ok(guards)
    }

    async fn key_of(&self, organization_id: &str, id: &Uuid) -> Option<AssetKey> {
        self.assets
            .read()
            .await
            .iter()
            .find(|((org, _), asset)| org.as_str() == organization_id && asset.id == *id)
            .map(|(key, _)| key.clone())
    }
}

#[async_trait]
impl AssetRepository for InMemoryAssetRepository {
    async fn find_by_key(
        &self,
        organization_id: &str,
        domain: &str,
    ) -> Result<Option<Asset>, ApiError> {
        let key = (organization_id.to_string(), domain.to_string());
        Ok(self.assets.read().await.get(&key).cloned())
    }

    async fn upsert(
        &self,
        organization_id: &str,
        domain: &str,
        merge: MergeFn<'_>,
    ) -> Result<UpsertOutcome, ApiError> {
        let key = (organization_id.to_string(), domain.to_string());
        let _guard = self.lock_key(key.clone()).await?;

        let existing = self.assets.read().await.get(&key).cloned();
        let created = existing.is_none();
        let now = Utc::now();
        let created_at = existing.as_ref().map(|a| a.created_at).unwrap_or(now);

        let mut asset = merge(existing);
        asset.organization_id = key.0.clone();
        asset.domain = key.1.clone();
        asset.created_at = created_at;
        asset.updated_at = now;

        self.assets.write().await.insert(key, asset.clone());
        Ok(UpsertOutcome { asset, created })
    }

    async fn list_by_organization(&self, organization_id: &str) -> Result<Vec<Asset>, ApiError> {
        let mut assets: Vec<Asset> = self
            .assets
            .read()
            .await
            .values()
            .filter(|a| a.organization_id == organization_id)
            .cloned()
            .collect();
        assets.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(assets)
    }

    async fn get_by_id(
        &self,
        organization_id: &str,
        id: &Uuid,
    ) -> Result<Option<Asset>, ApiError> {
        Ok(self
            .assets
            .read()
            .await
            .values()
            .find(|a| a.organization_id == organization_id && a.id == *id)
            .cloned())
    }

    async fn update_by_id(
        &self,
        organization_id: &str,
        id: &Uuid,
        edit: EditFn<'_>,
    ) -> Result<Asset, ApiError> {
        let not_found = || ApiError::not_found(format!("asset {} not found", id));
        loop {
            let key = self.key_of(organization_id, id).await.ok_or_else(not_found)?;
            let current = self.assets.read().await.get(&key).cloned().ok_or_else(not_found)?;
            let new_key = (key.0.clone(), edit(current).domain);

            // a rename writes the target key too, so both keys are held
            let _guards = self.lock_keys(&key, &new_key).await?;
            let mut assets = self.assets.write().await;

            let Some(existing) = assets.get(&key).filter(|a| a.id == *id).cloned() else {
                continue;
            };
            let mut asset = edit(existing);
            asset.id = *id;
            asset.organization_id = key.0.clone();
            if asset.domain != new_key.1 {
                continue;
            }

            if new_key != key {
                if assets.contains_key(&new_key) {
                    return Err(ApiError::conflict(format!(
                        "an asset for {} already exists",
                        asset.domain
                    )));
                }
                assets.remove(&key);
            }
            assets.insert(new_key, asset.clone());
            return Ok(asset);
        }
    }

    async fn delete_many(&self, organization_id: &str, ids: &[Uuid]) -> Result<u64, ApiError> {
        let mut assets = self.assets.write().await;
        let before = assets.len();
        assets.retain(|(org, _), asset| !(org.as_str() == organization_id && ids.contains(&asset.id)));
        Ok((before - assets.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HostFacts, HostObservation, Port, SourceName};
    use crate::services::reconciliation::Reconciler;

    fn observation(domain: &str, port: u16) -> HostObservation {
        HostObservation::new(
            "org1",
            domain,
            SourceName::Shodan,
            Utc::now(),
            HostFacts {
                ports: vec![Port::new("tcp", port)],
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_upsert_creates_then_updates() {
        let repo = InMemoryAssetRepository::new();
        let reconciler = Reconciler::default();

        let first = observation("a.example.com", 80);
        let outcome = repo
            .upsert("org1", "a.example.com", &|existing| reconciler.reconcile(existing, &first))
            .await
            .unwrap();
        assert!(outcome.created);

        let second = observation("a.example.com", 443);
        let outcome = repo
            .upsert("org1", "a.example.com", &|existing| reconciler.reconcile(existing, &second))
            .await
            .unwrap();
        assert!(!outcome.created);
        assert_eq!(outcome.asset.ports.len(), 2);

        let listed = repo.list_by_organization("org1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(repo.list_by_organization("org2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_upserts_on_one_key_do_not_lose_ports() {
        let repo = Arc::new(InMemoryAssetRepository::new());
        let mut handles = Vec::new();

        for port in 1..=20u16 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                let obs = observation("busy.example.com", port);
                let reconciler = Reconciler::default();
                repo.upsert("org1", "busy.example.com", &|existing| {
                    reconciler.reconcile(existing, &obs)
                })
                .await
                .unwrap()
            }));
        }

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap().created {
                created += 1;
            }
        }

        let asset = repo
            .find_by_key("org1", "busy.example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created, 1);
        assert_eq!(asset.ports.len(), 20);
    }

    #[tokio::test]
    async fn test_update_and_delete_by_id() {
        let repo = InMemoryAssetRepository::new();
        let reconciler = Reconciler::default();
        let a = observation("a.example.com", 80);
        let b = observation("b.example.com", 80);
        let asset_a = repo
            .upsert("org1", "a.example.com", &|e| reconciler.reconcile(e, &a))
            .await
            .unwrap()
            .asset;
        repo.upsert("org1", "b.example.com", &|e| reconciler.reconcile(e, &b))
            .await
            .unwrap();

        let conflict = repo
            .update_by_id("org1", &asset_a.id, &|mut asset| {
                asset.domain = "b.example.com".into();
                asset
            })
            .await;
        assert!(matches!(conflict, Err(ApiError::Conflict(_))));

        let renamed = repo
            .update_by_id("org1", &asset_a.id, &|mut asset| {
                asset.domain = "c.example.com".into();
                asset
            })
            .await
            .unwrap();
        assert_eq!(renamed.id, asset_a.id);
        assert!(repo.find_by_key("org1", "a.example.com").await.unwrap().is_none());
        assert!(repo.find_by_key("org1", "c.example.com").await.unwrap().is_some());

        // ids from another organization are not touched
        assert_eq!(repo.delete_many("org2", &[asset_a.id]).await.unwrap(), 0);
        assert_eq!(repo.delete_many("org1", &[asset_a.id]).await.unwrap(), 1);
        assert_eq!(repo.list_by_organization("org1").await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rename_waits_for_upsert_on_target_key() {
        let repo = Arc::new(InMemoryAssetRepository::new());
        let reconciler = Reconciler::default();
        let a = observation("a.example.com", 80);
        let asset_a = repo
            .upsert("org1", "a.example.com", &|e| reconciler.reconcile(e, &a))
            .await
            .unwrap()
            .asset;

        let upsert = {
            let repo = repo.clone();
            tokio::spawn(async move {
                let b = observation("b.example.com", 443);
                let reconciler = Reconciler::default();
                repo.upsert("org1", "b.example.com", &|existing| {
                    std::thread::sleep(Duration::from_millis(200));
                    reconciler.reconcile(existing, &b)
                })
                .await
                .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let rename = repo
            .update_by_id("org1", &asset_a.id, &|mut asset| {
                asset.domain = "b.example.com".into();
                asset
            })
            .await;
        let upserted = upsert.await.unwrap();

        assert!(upserted.created);
        assert!(matches!(rename, Err(ApiError::Conflict(_))));
        let kept = repo.find_by_key("org1", "a.example.com").await.unwrap().unwrap();
        assert_eq!(kept.id, asset_a.id);
        let b = repo.find_by_key("org1", "b.example.com").await.unwrap().unwrap();
        assert_eq!(b.id, upserted.asset.id);
        assert_eq!(repo.list_by_organization("org1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_key_locks_are_released_after_use() {
        let repo = Arc::new(InMemoryAssetRepository::new());
        let mut handles = Vec::new();
        for i in 0..10u16 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                let domain = format!("h{}.example.com", i % 3);
                let obs = observation(&domain, 80 + i);
                let reconciler = Reconciler::default();
                repo.upsert("org1", &domain, &|e| reconciler.reconcile(e, &obs))
                    .await
                    .unwrap()
                    .asset
            }));
        }
        let mut last = None;
        for handle in handles {
            last = Some(handle.await.unwrap());
        }
        let asset = last.unwrap();
        repo.update_by_id("org1", &asset.id, &|mut a| {
            a.domain = "renamed.example.com".into();
            a
        })
        .await
        .unwrap();

        assert!(repo.key_locks.lock().unwrap().is_empty());
        assert_eq!(repo.list_by_organization("org1").await.unwrap().len(), 3);
    }
}
