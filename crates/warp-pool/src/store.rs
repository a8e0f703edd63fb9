//! One-JSON-file-per-account persistence
//!
//! The accounts directory is the durable source of truth. Each account is a
//! single file named after a sanitized form of the account name; loading the
//! directory in lexicographic order reconstructs the pool deterministically.
//! Writes go through a temp-file + rename so a crash mid-write never leaves
//! a torn record, and files are 0600 since they hold refresh tokens.

use std::path::{Path, PathBuf};

use tracing::{debug, error, info};

use crate::account::{Account, DurableRecord};
use crate::error::{Error, Result};

/// File-backed store for durable account records.
pub struct AccountStore {
    dir: PathBuf,
}

impl AccountStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Account names may contain path separators; the file name may not.
    pub fn sanitized_name(name: &str) -> String {
        name.replace(['/', '\\'], "_")
    }

    fn account_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", Self::sanitized_name(name)))
    }

    /// Enumerate `*.json` files in sorted order and parse each into an
    /// account carrying only durable fields. Malformed files are logged and
    /// skipped. Creates the directory if absent; failure to open it is the
    /// one fatal startup error.
    pub async fn load_directory(&self, retry_429_interval: i64) -> Result<Vec<Account>> {
        if !self.dir.exists() {
            tokio::fs::create_dir_all(&self.dir)
                .await
                .map_err(|e| Error::Io(format!("creating {}: {e}", self.dir.display())))?;
            info!(dir = %self.dir.display(), "created accounts directory");
        }

        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| Error::Io(format!("reading {}: {e}", self.dir.display())))?;

        let mut paths = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Io(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut accounts = Vec::new();
        for path in paths {
            match self.load_one(&path, retry_429_interval).await {
                Ok(account) => {
                    info!(
                        account = %account.name,
                        enabled = account.enabled,
                        status = account.status_code.map(|s| s.as_str()).unwrap_or("ok"),
                        "loaded account"
                    );
                    accounts.push(account);
                }
                Err(e) => {
                    error!(file = %path.display(), error = %e, "skipping malformed account file");
                }
            }
        }

        info!(count = accounts.len(), dir = %self.dir.display(), "loaded accounts");
        Ok(accounts)
    }

    async fn load_one(&self, path: &Path, retry_429_interval: i64) -> Result<Account> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Io(e.to_string()))?;
        let record: DurableRecord =
            serde_json::from_str(&contents).map_err(|e| Error::Parse(e.to_string()))?;
        Ok(Account::from_record(record, retry_429_interval))
    }

    /// Write one account's durable record. Best-effort by contract: callers
    /// that cannot propagate use [`AccountStore::save_logged`].
    pub async fn save(&self, record: &DurableRecord) -> Result<()> {
        if !self.dir.exists() {
            tokio::fs::create_dir_all(&self.dir)
                .await
                .map_err(|e| Error::Io(e.to_string()))?;
        }

        let json = serde_json::to_string_pretty(record).map_err(|e| Error::Parse(e.to_string()))?;
        let path = self.account_path(&record.name);
        write_atomic(&path, json.as_bytes()).await?;
        debug!(account = %record.name, path = %path.display(), "persisted account");
        Ok(())
    }

    /// Persist and swallow the error. A failed write does not roll back the
    /// in-memory state; the durable fields re-sync on the next mutation.
    pub async fn save_logged(&self, record: &DurableRecord) {
        if let Err(e) = self.save(record).await {
            error!(account = %record.name, error = %e, "failed to persist account");
        }
    }

    /// Remove the account's file if present.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let path = self.account_path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(account = name, path = %path.display(), "deleted account file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e.to_string())),
        }
    }
}

/// Write to a temp file in the same directory, then rename over the target.
/// 0600 permissions: the record holds a refresh token.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::Io("account path has no parent directory".into()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("account.json");
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, data)
        .await
        .map_err(|e| Error::Io(format!("writing temp account file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting account file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp account file: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::AccountStatus;

    fn record(name: &str) -> DurableRecord {
        DurableRecord {
            name: name.into(),
            refresh_token: Some(format!("rt_{name}")),
            enabled: true,
            status_code: None,
            last_refreshed: None,
            last_attempt: None,
        }
    }

    #[tokio::test]
    async fn load_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path().join("accounts"));
        let accounts = store.load_directory(60).await.unwrap();
        assert!(accounts.is_empty());
        assert!(dir.path().join("accounts").exists());
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path());

        let mut rec = record("alpha");
        rec.status_code = Some("403".into());
        store.save(&rec).await.unwrap();

        let accounts = store.load_directory(60).await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].name, "alpha");
        assert_eq!(accounts[0].status_code, Some(AccountStatus::Blocked));
        assert_eq!(
            accounts[0]
                .refresh_token
                .as_ref()
                .map(|s| s.expose().as_str()),
            Some("rt_alpha")
        );
    }

    #[tokio::test]
    async fn load_order_is_lexicographic() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path());
        for name in ["zeta", "alpha", "mid"] {
            store.save(&record(name)).await.unwrap();
        }

        let names: Vec<String> = store
            .load_directory(60)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn malformed_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path());
        store.save(&record("good")).await.unwrap();
        tokio::fs::write(dir.path().join("bad.json"), b"{not json")
            .await
            .unwrap();

        let accounts = store.load_directory(60).await.unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].name, "good");
    }

    #[tokio::test]
    async fn sanitized_names_replace_path_separators() {
        assert_eq!(AccountStore::sanitized_name("a/b\\c"), "a_b_c");

        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path());
        store.save(&record("team/alice")).await.unwrap();
        assert!(dir.path().join("team_alice.json").exists());
    }

    #[tokio::test]
    async fn delete_removes_file_and_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path());
        store.save(&record("gone")).await.unwrap();

        store.delete("gone").await.unwrap();
        assert!(!dir.path().join("gone.json").exists());
        // Second delete is a no-op
        store.delete("gone").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn account_files_are_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path());
        store.save(&record("locked")).await.unwrap();

        let metadata = tokio::fs::metadata(dir.path().join("locked.json"))
            .await
            .unwrap();
        let mode = metadata.permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "account file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn optional_fields_omitted_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::new(dir.path());
        store.save(&record("bare")).await.unwrap();

        let contents = tokio::fs::read_to_string(dir.path().join("bare.json"))
            .await
            .unwrap();
        assert!(!contents.contains("status_code"));
        assert!(!contents.contains("last_attempt"));
        assert!(contents.contains("\"refresh_token\""));
    }
}
