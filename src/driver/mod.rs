use crate::backup_error::BackupError;
use crate::config::PoolSpec;
use crate::exec::Exec;
use serde::Deserialize;

#[cfg(test)]
mod tests;

/// One snapshot as reported by the pool.
#[derive(Debug, PartialEq, Clone)]
pub struct SnapshotInfo {
    pub id: u64,
    pub name: String,
    pub size: u64,
    pub protected: bool,
}

/// Raw capacity of the cluster backing a pool, in kilobytes.
#[derive(Debug, PartialEq, Clone)]
pub struct ClusterStats {
    pub kb_used: u64,
    pub kb_avail: u64,
}

pub trait PoolDriver {
    /// List the names of all volumes in the pool
    fn list_volumes(&mut self) -> Result<Vec<String>, BackupError>;

    /// List the snapshots of a volume
    ///
    /// * `volume` - name of the volume
    ///
    fn list_snapshots(&mut self, volume: &str) -> Result<Vec<SnapshotInfo>, BackupError>;

    /// Create an empty volume
    ///
    /// The size is a nominal placeholder; the actual size is established by
    /// the first differential import.
    ///
    /// * `volume` - name of the volume
    /// * `size_bytes` - nominal size of the new volume
    ///
    fn create_volume(&mut self, volume: &str, size_bytes: u64) -> Result<(), BackupError>;

    /// Create a snapshot of a volume
    fn create_snapshot(&mut self, volume: &str, snapshot: &str) -> Result<(), BackupError>;

    /// Remove a snapshot from a volume
    fn remove_snapshot(&mut self, volume: &str, snapshot: &str) -> Result<(), BackupError>;

    /// Mark a snapshot as protected against removal
    fn protect_snapshot(&mut self, volume: &str, snapshot: &str) -> Result<(), BackupError>;

    /// Clear the removal protection of a snapshot
    fn unprotect_snapshot(&mut self, volume: &str, snapshot: &str) -> Result<(), BackupError>;

    /// Report whether a snapshot is protected against removal
    fn is_protected(&mut self, volume: &str, snapshot: &str) -> Result<bool, BackupError>;

    /// Compose the argument vector producing the differential stream of a
    /// snapshot on standard output
    ///
    /// * `volume` - name of the volume
    /// * `snapshot` - snapshot to export
    /// * `from_snapshot` - base snapshot of the differential; a full export
    ///   is produced when absent
    ///
    fn export_diff_args(
        &self,
        volume: &str,
        snapshot: &str,
        from_snapshot: Option<&str>,
    ) -> Vec<String>;

    /// Compose the argument vector consuming a differential stream from
    /// standard input into a volume
    fn import_diff_args(&self, volume: &str) -> Vec<String>;

    /// Report used and available capacity of the backing cluster
    fn cluster_stats(&mut self) -> Result<ClusterStats, BackupError>;

    /// Report whether the backing cluster is scrubbing the pool
    fn is_scrub_active(&mut self) -> Result<bool, BackupError> {
        Ok(false)
    }
}

/// Driver for one RBD pool, working through the `rbd` and `ceph`
/// command line tools.
pub struct RbdDriver {
    pool: String,
    conf: String,
    user: String,
    keyring: Option<String>,
    exec: Box<dyn Exec>,
}

#[derive(Debug, Deserialize)]
struct SnapRecord {
    id: u64,
    name: String,
    size: u64,
    #[serde(default)]
    protected: Flag,
}

// `rbd snap ls --format json` reports booleans as the strings
// "true" and "false" on older releases.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Text(String),
}

impl Default for Flag {
    fn default() -> Self {
        Flag::Bool(false)
    }
}

impl Flag {
    fn as_bool(&self) -> bool {
        match self {
            Flag::Bool(value) => *value,
            Flag::Text(value) => value == "true",
        }
    }
}

#[derive(Debug, Deserialize)]
struct DfReport {
    stats: DfStats,
}

#[derive(Debug, Deserialize)]
struct DfStats {
    total_used_bytes: u64,
    total_avail_bytes: u64,
}

impl RbdDriver {
    pub fn new(spec: &PoolSpec, exec: Box<dyn Exec>) -> Self {
        RbdDriver {
            pool: spec.pool.clone(),
            conf: spec.conf.clone(),
            user: spec.user.clone(),
            keyring: spec.keyring.clone(),
            exec,
        }
    }

    fn client_args(&self) -> Vec<String> {
        let mut args = vec![
            String::from("-c"),
            self.conf.clone(),
            String::from("--id"),
            self.user.clone(),
        ];

        if let Some(keyring) = &self.keyring {
            args.push(String::from("--keyring"));
            args.push(keyring.clone());
        }

        args
    }

    fn rbd_args(&self, tail: &[&str]) -> Vec<String> {
        let mut args = vec![String::from("rbd")];

        args.extend(self.client_args());
        args.extend(tail.iter().map(|part| part.to_string()));

        args
    }

    fn image_path(&self, volume: &str) -> String {
        format!("{}/{}", self.pool, volume)
    }

    fn snapshot_path(&self, volume: &str, snapshot: &str) -> String {
        format!("{}/{}@{}", self.pool, volume, snapshot)
    }
}

impl PoolDriver for RbdDriver {
    fn list_volumes(&mut self) -> Result<Vec<String>, BackupError> {
        let args = self.rbd_args(&["ls", "--format", "json", self.pool.as_str()]);
        let output = self.exec.run(&args)?;

        Ok(serde_json::from_str(&output)?)
    }

    fn list_snapshots(&mut self, volume: &str) -> Result<Vec<SnapshotInfo>, BackupError> {
        let path = self.image_path(volume);
        let args = self.rbd_args(&["snap", "ls", "--format", "json", path.as_str()]);
        let output = self.exec.run(&args)?;
        let records: Vec<SnapRecord> = serde_json::from_str(&output)?;

        Ok(records
            .into_iter()
            .map(|record| SnapshotInfo {
                id: record.id,
                name: record.name,
                size: record.size,
                protected: record.protected.as_bool(),
            })
            .collect())
    }

    fn create_volume(&mut self, volume: &str, size_bytes: u64) -> Result<(), BackupError> {
        let size = format!("{}B", size_bytes);
        let path = self.image_path(volume);
        let args = self.rbd_args(&["create", "--size", size.as_str(), path.as_str()]);

        self.exec.run(&args).map(|_| ())
    }

    fn create_snapshot(&mut self, volume: &str, snapshot: &str) -> Result<(), BackupError> {
        let path = self.snapshot_path(volume, snapshot);
        let args = self.rbd_args(&["snap", "create", path.as_str()]);

        self.exec.run(&args).map(|_| ())
    }

    fn remove_snapshot(&mut self, volume: &str, snapshot: &str) -> Result<(), BackupError> {
        let path = self.snapshot_path(volume, snapshot);
        let args = self.rbd_args(&["snap", "rm", path.as_str()]);

        self.exec
            .run(&args)
            .map(|_| ())
            .map_err(|e| match e {
                BackupError::Command { ref stderr, .. } if stderr.contains("protected") => {
                    BackupError::Protected(snapshot.to_string())
                }
                other => other,
            })
    }

    fn protect_snapshot(&mut self, volume: &str, snapshot: &str) -> Result<(), BackupError> {
        let path = self.snapshot_path(volume, snapshot);
        let args = self.rbd_args(&["snap", "protect", path.as_str()]);

        self.exec.run(&args).map(|_| ())
    }

    fn unprotect_snapshot(&mut self, volume: &str, snapshot: &str) -> Result<(), BackupError> {
        let path = self.snapshot_path(volume, snapshot);
        let args = self.rbd_args(&["snap", "unprotect", path.as_str()]);

        self.exec.run(&args).map(|_| ())
    }

    fn is_protected(&mut self, volume: &str, snapshot: &str) -> Result<bool, BackupError> {
        Ok(self
            .list_snapshots(volume)?
            .iter()
            .any(|info| info.name == snapshot && info.protected))
    }

    fn export_diff_args(
        &self,
        volume: &str,
        snapshot: &str,
        from_snapshot: Option<&str>,
    ) -> Vec<String> {
        let mut tail = vec!["export-diff"];

        if let Some(base) = from_snapshot {
            tail.push("--from-snap");
            tail.push(base);
        }

        let path = self.snapshot_path(volume, snapshot);
        tail.push(&path);
        tail.push("-");

        self.rbd_args(&tail)
    }

    fn import_diff_args(&self, volume: &str) -> Vec<String> {
        let path = self.image_path(volume);

        self.rbd_args(&["import-diff", "-", path.as_str()])
    }

    fn cluster_stats(&mut self) -> Result<ClusterStats, BackupError> {
        let mut args = vec![String::from("ceph")];
        args.extend(self.client_args());
        args.extend(["df", "--format", "json"].map(String::from));

        let output = self.exec.run(&args)?;
        let report: DfReport = serde_json::from_str(&output)?;

        Ok(ClusterStats {
            kb_used: report.stats.total_used_bytes / 1024,
            kb_avail: report.stats.total_avail_bytes / 1024,
        })
    }
}

#[cfg(test)]
mockall::mock! {
    pub Driver {}
    impl PoolDriver for Driver {
        fn list_volumes(&mut self) -> Result<Vec<String>, BackupError>;
        fn list_snapshots(&mut self, volume: &str) -> Result<Vec<SnapshotInfo>, BackupError>;
        fn create_volume(&mut self, volume: &str, size_bytes: u64) -> Result<(), BackupError>;
        fn create_snapshot(&mut self, volume: &str, snapshot: &str) -> Result<(), BackupError>;
        fn remove_snapshot(&mut self, volume: &str, snapshot: &str) -> Result<(), BackupError>;
        fn protect_snapshot(&mut self, volume: &str, snapshot: &str) -> Result<(), BackupError>;
        fn unprotect_snapshot(&mut self, volume: &str, snapshot: &str) -> Result<(), BackupError>;
        fn is_protected(&mut self, volume: &str, snapshot: &str) -> Result<bool, BackupError>;
        fn export_diff_args<'a>(
            &self,
            volume: &str,
            snapshot: &str,
            from_snapshot: Option<&'a str>,
        ) -> Vec<String>;
        fn import_diff_args(&self, volume: &str) -> Vec<String>;
        fn cluster_stats(&mut self) -> Result<ClusterStats, BackupError>;
    }
}
