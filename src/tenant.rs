use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::info;

use crate::compactor;
use crate::config::Config;
use crate::engine::Engine;
use crate::limits::*;
use crate::notify::NotifyHub;

const WAL_EXTENSION: &str = "wal";

/// Strip everything but alphanumerics, `_` and `-` so an organization name
/// is always a plain file stem.
fn sanitize(organization: &str) -> String {
    organization
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

/// Per-organization engines. Each organization gets its own Engine, WAL
/// and compactor; desks and reservations never cross organizations.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    lock_timeout: Duration,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, lock_timeout: Duration) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            lock_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.data_dir.clone(),
            config.compact_threshold,
            config.lock_timeout,
        )
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// WAL location of an organization, after sanitizing its name.
    pub fn wal_path(&self, organization: &str) -> std::io::Result<PathBuf> {
        Ok(self.wal_path_for(&Self::key(organization)?))
    }

    fn wal_path_for(&self, safe_name: &str) -> PathBuf {
        self.data_dir.join(format!("{safe_name}.{WAL_EXTENSION}"))
    }

    /// Sanitized name used both as the engine key and as the WAL file stem,
    /// so aliases of one name share one engine.
    fn key(organization: &str) -> std::io::Result<String> {
        if organization.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "organization name too long",
            ));
        }
        let safe_name = sanitize(organization);
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty organization name",
            ));
        }
        Ok(safe_name)
    }

    /// Get or lazily open the engine for an organization.
    pub fn get_or_create(&self, organization: &str) -> std::io::Result<Arc<Engine>> {
        let safe_name = Self::key(organization)?;
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many organizations"));
        }

        // One engine and one WAL writer per organization, even when opens race.
        let entry = self.engines.entry(safe_name.clone());
        let engine = match entry {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.wal_path_for(&safe_name);
                let notify = Arc::new(NotifyHub::new());
                let engine = Arc::new(Engine::new(wal_path, notify, self.lock_timeout)?);
                slot.insert(engine.clone());
                engine
            }
        };

        tokio::spawn(compactor::run_compactor(engine.clone(), self.compact_threshold));
        info!("opened organization {safe_name}");
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }

    /// Organizations with a WAL in the data directory, sorted.
    pub fn on_disk(&self) -> std::io::Result<Vec<String>> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.data_dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(WAL_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                found.push(stem.to_string());
            }
        }
        found.sort();
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DEFAULT_LOCK_TIMEOUT;
    use chrono::{TimeZone, Utc};
    use std::fs;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("deskslot_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, DEFAULT_LOCK_TIMEOUT)
    }

    #[tokio::test]
    async fn organizations_are_isolated() {
        let tm = manager(test_data_dir("isolation"));
        let acme = tm.get_or_create("acme").unwrap();
        let globex = tm.get_or_create("globex").unwrap();

        let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();

        // Same desk id, same slot, different organizations.
        acme.reserve("desk-1", start, end, "alice").await.unwrap();
        globex.reserve("desk-1", start, end, "bob").await.unwrap();

        assert_eq!(acme.query("desk-1", start, end).await.unwrap()[0].owner_id, "alice");
        assert_eq!(globex.query("desk-1", start, end).await.unwrap()[0].owner_id, "bob");
    }

    #[tokio::test]
    async fn lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());
        assert!(tm.on_disk().unwrap().is_empty());

        let _eng = tm.get_or_create("my_org").unwrap();
        assert!(dir.join("my_org.wal").exists());
        assert_eq!(tm.on_disk().unwrap(), vec!["my_org".to_string()]);
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let tm = manager(test_data_dir("same_eng"));
        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());

        let result = tm.get_or_create("../..");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn aliases_share_one_engine() {
        let dir = test_data_dir("aliases");
        let tm = manager(dir.clone());
        let plain = tm.get_or_create("acme").unwrap();
        let slashed = tm.get_or_create("acme/").unwrap();
        let dotted = tm.get_or_create("../acme").unwrap();
        assert!(Arc::ptr_eq(&plain, &slashed));
        assert!(Arc::ptr_eq(&plain, &dotted));

        let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        plain.reserve("desk-1", start, end, "alice").await.unwrap();
        let err = slashed.reserve("desk-1", start, end, "bob").await.unwrap_err();
        assert!(matches!(err, crate::engine::EngineError::Conflict(_)));

        assert_eq!(tm.wal_path("acme/").unwrap(), dir.join("acme.wal"));
        assert_eq!(tm.on_disk().unwrap(), vec!["acme".to_string()]);
    }

    #[tokio::test]
    async fn name_too_long() {
        let tm = manager(test_data_dir("name_too_long"));
        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("organization name too long"));
    }

    #[tokio::test]
    async fn on_disk_ignores_other_files() {
        let dir = test_data_dir("on_disk");
        fs::write(dir.join("notes.txt"), b"x").unwrap();
        fs::write(dir.join("beta.wal"), b"").unwrap();
        fs::write(dir.join("alpha.wal"), b"").unwrap();
        fs::write(dir.join("alpha.wal.tmp"), b"").unwrap();

        let tm = manager(dir);
        assert_eq!(tm.on_disk().unwrap(), vec!["alpha".to_string(), "beta".to_string()]);
    }

    #[tokio::test]
    async fn reopen_replays_previous_state() {
        let dir = test_data_dir("reopen");
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        {
            let tm = manager(dir.clone());
            tm.get_or_create("acme")
                .unwrap()
                .reserve("desk-1", start, end, "alice")
                .await
                .unwrap();
        }
        let tm = manager(dir);
        let engine = tm.get_or_create("acme").unwrap();
        assert_eq!(engine.query("desk-1", start, end).await.unwrap().len(), 1);
    }
}
