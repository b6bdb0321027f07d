use crate::backup_error::BackupError;
use crate::driver::{ClusterStats, PoolDriver, SnapshotInfo};
use chrono::NaiveDateTime;
use std::collections::BTreeMap;


/// Timestamp layout encoded in every backup snapshot name.
pub const SNAPSHOT_FORMAT: &str = "backup%Y-%m-%dT%H.%M.%S";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H.%M.%S";

/// Composes the snapshot name for a point in time.
pub fn snapshot_name(at: NaiveDateTime) -> String {
    at.format(SNAPSHOT_FORMAT).to_string()
}

#[derive(Debug, PartialEq, Clone)]
pub struct Snapshot {
    id: Option<u64>,
    name: String,
    creation: Option<NaiveDateTime>,
    used_bytes: u64,
    protected: bool,
}

impl Snapshot {
    pub fn new(name: &str) -> Self {
        Snapshot {
            id: None,
            name: name.to_string(),
            creation: Self::parse_creation(name),
            used_bytes: 0,
            protected: false,
        }
    }

    fn from_info(info: SnapshotInfo) -> Self {
        Snapshot {
            creation: Self::parse_creation(&info.name),
            id: Some(info.id),
            name: info.name,
            used_bytes: info.size,
            protected: info.protected,
        }
    }

    /// Extracts the creation time from a snapshot name.
    ///
    /// Names not matching the backup pattern exactly yield `None`; such
    /// snapshots are retained but sort after all timestamped ones.
    pub fn parse_creation(name: &str) -> Option<NaiveDateTime> {
        let stamp = name.strip_prefix("backup")?;

        NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()
    }

    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn creation(&self) -> Option<NaiveDateTime> {
        self.creation
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes
    }

    pub fn is_protected(&self) -> bool {
        self.protected
    }
}

/// One volume of a pool along with its snapshots, sorted newest first.
#[derive(Debug, PartialEq, Clone)]
pub struct Volume {
    pool: String,
    name: String,
    exists: bool,
    snapshots: Vec<Snapshot>,
}

impl Volume {
    fn new(pool: &str, name: &str, exists: bool) -> Self {
        Volume {
            pool: pool.to_string(),
            name: name.to_string(),
            exists,
            snapshots: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool_name(&self) -> &str {
        &self.pool
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// The snapshot taken by the in-flight run, if any.
    pub fn current(&self) -> Option<&Snapshot> {
        self.snapshots.first()
    }

    /// The most recent previously replicated snapshot, if any.
    pub fn last(&self) -> Option<&Snapshot> {
        self.snapshots.get(1)
    }

    pub fn snapshot(&self, name: &str) -> Option<&Snapshot> {
        self.snapshots.iter().find(|snapshot| snapshot.name == name)
    }

    /// Returns the newest snapshot present on this volume and, by name, on
    /// the other volume.
    pub fn most_recent_common<'a>(&'a self, other: &Volume) -> Option<&'a Snapshot> {
        self.most_recent_common_before(other, None)
    }

    /// Like [`Volume::most_recent_common`], but only considers snapshots
    /// strictly older than the given creation time.
    pub fn most_recent_common_before<'a>(
        &'a self,
        other: &Volume,
        older_than: Option<NaiveDateTime>,
    ) -> Option<&'a Snapshot> {
        self.snapshots.iter().find(|snapshot| {
            snapshot
                .creation
                .is_some_and(|creation| older_than.is_none_or(|limit| creation < limit))
                && other.snapshot(&snapshot.name).is_some()
        })
    }

    fn insert(&mut self, snapshot: Snapshot) {
        self.snapshots.retain(|existing| existing.name != snapshot.name);
        self.snapshots.push(snapshot);
        self.sort_snapshots();
    }

    fn remove(&mut self, name: &str) {
        self.snapshots.retain(|snapshot| snapshot.name != name);
    }

    fn replace_snapshots(&mut self, infos: Vec<SnapshotInfo>) {
        self.snapshots = infos.into_iter().map(Snapshot::from_info).collect();
        self.sort_snapshots();
    }

    fn sort_snapshots(&mut self) {
        // newest first; None compares below Some, putting unparseable
        // names last
        self.snapshots.sort_by(|a, b| match (&a.creation, &b.creation) {
            (None, None) => a.name.cmp(&b.name),
            _ => b.creation.cmp(&a.creation),
        });

        for pair in self.snapshots.windows(2) {
            if pair[0].creation.is_some() && pair[0].creation == pair[1].creation {
                log::warn!(
                    "volume \"{}/{}\" has snapshots \"{}\" and \"{}\" with equal creation time",
                    self.pool,
                    self.name,
                    pair[0].name,
                    pair[1].name
                );
            }
        }
    }
}

/// In-memory model of one pool and its volumes, backed by a driver session.
pub struct Pool {
    name: String,
    driver: Box<dyn PoolDriver>,
    volumes: BTreeMap<String, Volume>,
    stats: Option<ClusterStats>,
    dry_run: bool,
}

impl Pool {
    /// Connects to a pool and loads all volumes and their snapshots.
    pub fn load(
        name: &str,
        mut driver: Box<dyn PoolDriver>,
        dry_run: bool,
    ) -> Result<Self, BackupError> {
        if driver.is_scrub_active()? {
            return Err(BackupError::PoolBusy(name.to_string()));
        }

        log::info!("loading volume information for pool \"{}\"", name);

        let volume_names = driver
            .list_volumes()
            .map_err(|e| BackupError::Connect(name.to_string(), e.to_string()))?;
        let mut volumes = BTreeMap::new();

        for volume_name in volume_names {
            let mut volume = Volume::new(name, &volume_name, true);
            volume.replace_snapshots(driver.list_snapshots(&volume_name)?);
            volumes.insert(volume_name, volume);
        }

        Ok(Pool {
            name: name.to_string(),
            driver,
            volumes,
            stats: None,
            dry_run,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn volume(&self, name: &str) -> Option<&Volume> {
        self.volumes.get(name)
    }

    pub fn volume_names(&self) -> Vec<String> {
        self.volumes.keys().cloned().collect()
    }

    /// Returns the named volume, creating it on the pool if absent.
    pub fn volume_or_create(
        &mut self,
        name: &str,
        size_bytes: u64,
    ) -> Result<&Volume, BackupError> {
        if !self.volumes.contains_key(name) {
            log::info!("creating volume \"{}\" on pool \"{}\"", name, self.name);

            if self.dry_run {
                log::info!("dry-run: volume creation skipped");
            } else {
                self.driver.create_volume(name, size_bytes)?;
            }

            self.stats = None;
            self.volumes
                .insert(name.to_string(), Volume::new(&self.name, name, true));
        }

        Ok(&self.volumes[name])
    }

    /// Returns the named volume, or a marker without backing storage when
    /// the pool has no such volume.
    pub fn volume_or_empty(&mut self, name: &str) -> &Volume {
        if !self.volumes.contains_key(name) {
            self.volumes
                .insert(name.to_string(), Volume::new(&self.name, name, false));
        }

        &self.volumes[name]
    }

    /// Reloads the snapshot list of one volume from the pool.
    pub fn refresh_volume(&mut self, name: &str) -> Result<(), BackupError> {
        let infos = self.driver.list_snapshots(name)?;
        let volume = self
            .volumes
            .get_mut(name)
            .ok_or(BackupError::NotFound(name.to_string()))?;

        volume.exists = true;
        volume.replace_snapshots(infos);

        Ok(())
    }

    pub fn create_snapshot(&mut self, volume: &str, snapshot: &str) -> Result<(), BackupError> {
        log::info!(
            "creating snapshot \"{}/{}@{}\"",
            self.name,
            volume,
            snapshot
        );

        if self.dry_run {
            log::info!("dry-run: snapshot creation skipped");
        } else {
            self.driver.create_snapshot(volume, snapshot)?;
        }

        self.stats = None;
        self.volume_entry(volume)?.insert(Snapshot::new(snapshot));

        Ok(())
    }

    pub fn remove_snapshot(&mut self, volume: &str, snapshot: &str) -> Result<(), BackupError> {
        log::info!(
            "destroying snapshot \"{}/{}@{}\"",
            self.name,
            volume,
            snapshot
        );

        if self.dry_run {
            log::info!("dry-run: snapshot removal skipped");
        } else {
            self.driver.remove_snapshot(volume, snapshot)?;
        }

        self.stats = None;
        self.volume_entry(volume)?.remove(snapshot);

        Ok(())
    }

    pub fn protect_snapshot(&mut self, volume: &str, snapshot: &str) -> Result<(), BackupError> {
        log::info!(
            "protecting snapshot \"{}/{}@{}\"",
            self.name,
            volume,
            snapshot
        );

        if self.dry_run {
            log::info!("dry-run: snapshot protection skipped");
        } else {
            self.driver.protect_snapshot(volume, snapshot)?;
        }

        self.stats = None;
        self.set_protected(volume, snapshot, true)
    }

    pub fn unprotect_snapshot(&mut self, volume: &str, snapshot: &str) -> Result<(), BackupError> {
        log::info!(
            "releasing protection of snapshot \"{}/{}@{}\"",
            self.name,
            volume,
            snapshot
        );

        if self.dry_run {
            log::info!("dry-run: protection release skipped");
        } else {
            self.driver.unprotect_snapshot(volume, snapshot)?;
        }

        self.stats = None;
        self.set_protected(volume, snapshot, false)
    }

    /// Records a snapshot in the model without touching the pool. Used by
    /// dry runs to mirror the effect of a completed transfer.
    pub fn record_snapshot(&mut self, volume: &str, snapshot: &str) -> Result<(), BackupError> {
        self.volume_entry(volume)?.insert(Snapshot::new(snapshot));

        Ok(())
    }

    /// Used and available capacity of the backing cluster. The value is
    /// cached until the next mutating operation.
    pub fn stats(&mut self) -> Result<ClusterStats, BackupError> {
        match &self.stats {
            Some(stats) => Ok(stats.clone()),
            None => {
                let stats = self.driver.cluster_stats()?;
                self.stats = Some(stats.clone());

                Ok(stats)
            }
        }
    }

    pub fn export_diff_args(
        &self,
        volume: &str,
        snapshot: &str,
        from_snapshot: Option<&str>,
    ) -> Vec<String> {
        self.driver.export_diff_args(volume, snapshot, from_snapshot)
    }

    pub fn import_diff_args(&self, volume: &str) -> Vec<String> {
        self.driver.import_diff_args(volume)
    }

    fn volume_entry(&mut self, name: &str) -> Result<&mut Volume, BackupError> {
        self.volumes
            .get_mut(name)
            .ok_or(BackupError::NotFound(name.to_string()))
    }

    fn set_protected(
        &mut self,
        volume: &str,
        snapshot: &str,
        protected: bool,
    ) -> Result<(), BackupError> {
        let volume = self.volume_entry(volume)?;

        match volume
            .snapshots
            .iter_mut()
            .find(|candidate| candidate.name == snapshot)
        {
            Some(snapshot) => {
                snapshot.protected = protected;
                Ok(())
            }
            None => Err(BackupError::NotFound(snapshot.to_string())),
        }
    }
}
