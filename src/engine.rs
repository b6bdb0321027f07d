use crate::backup_error::BackupError;
use crate::exec::Exec;
use crate::hypervisor::Hypervisor;
use crate::pool::{snapshot_name, Pool, Snapshot};
use chrono::NaiveDateTime;


/// Substring the consuming side emits when the requested snapshot already
/// exists on the backup volume with different content.
const DIVERGENCE_MARKER: &str = "already exists";

/// Replicates one volume from the source pool to the backup pool.
///
/// The timestamp is captured once at run start so that retried transfers
/// keep a consistent snapshot name. All steps are idempotent: an aborted
/// prior run leaves an orphan newest snapshot behind, which simply becomes
/// an eligible incremental base on the next resolution.
pub struct ReplicationEngine<'a> {
    exec: &'a mut dyn Exec,
    now: NaiveDateTime,
    dry_run: bool,
}

#[derive(Debug, PartialEq)]
pub struct ReplicationOutcome {
    pub snapshot: String,
    /// Base snapshot of the successful transfer; a full send when absent.
    pub base: Option<String>,
    pub transferred: bool,
    pub attempts: u32,
}

impl<'a> ReplicationEngine<'a> {
    pub fn new(exec: &'a mut dyn Exec, now: NaiveDateTime, dry_run: bool) -> Self {
        ReplicationEngine { exec, now, dry_run }
    }

    pub fn replicate(
        &mut self,
        source: &mut Pool,
        backup: &mut Pool,
        volume: &str,
        mut hypervisor: Option<(&mut dyn Hypervisor, &str)>,
    ) -> Result<ReplicationOutcome, BackupError> {
        let snapshot = snapshot_name(self.now);

        self.recover(source, backup, volume)?;

        // RESOLVING
        let mut base = self.common_base(source, backup, volume, None)?;

        if base.as_deref() == Some(snapshot.as_str()) {
            log::info!(
                "snapshot \"{}\" of volume \"{}\" already replicated, nothing to do",
                snapshot,
                volume
            );

            return Ok(ReplicationOutcome {
                snapshot,
                base: None,
                transferred: false,
                attempts: 0,
            });
        }

        // SNAPSHOTTING
        self.snapshot_source(source, volume, &snapshot, &mut hypervisor)?;

        // TRANSFERRING, with bounded divergence recovery
        let mut attempts = 0;

        loop {
            attempts += 1;

            let export = source.export_diff_args(volume, &snapshot, base.as_deref());
            let import = backup.import_diff_args(volume);

            if self.dry_run {
                log::info!("dry-run: {} | {}", export.join(" "), import.join(" "));
                break;
            }

            log::debug!(
                "differential transfer of \"{}\" from pool \"{}\" to pool \"{}\"",
                volume,
                source.name(),
                backup.name()
            );

            let status = self.exec.run_piped(&export, &import)?;

            if status.success() {
                log::info!(
                    "snapshot \"{}\" of volume \"{}\" exported to pool \"{}\"",
                    snapshot,
                    volume,
                    backup.name()
                );
                break;
            }

            if !status.stderr.contains(DIVERGENCE_MARKER) {
                log::error!(
                    "snapshot \"{}\" of volume \"{}\" failed to export",
                    snapshot,
                    volume
                );
                return Err(BackupError::Transfer(status.stderr));
            }

            let Some(failed_base) = base.take() else {
                // a full send was rejected; there is nothing left to demote
                return Err(BackupError::Transfer(status.stderr));
            };

            base = self.demote_base(source, backup, volume, &failed_base)?;

            if base.is_none() {
                log::warn!(
                    "no common snapshot left for volume \"{}\", falling back to a full send",
                    volume
                );
            }
        }

        // COMMITTING
        if self.dry_run {
            backup.record_snapshot(volume, &snapshot)?;
        } else {
            backup.refresh_volume(volume)?;
        }

        Ok(ReplicationOutcome {
            snapshot,
            base,
            transferred: true,
            attempts,
        })
    }

    /// RECOVERING: roles are derived from ordinal position, so an orphan
    /// newest snapshot from an aborted run needs no physical rename. It is
    /// reported here and stays eligible as an incremental base.
    fn recover(&self, source: &Pool, backup: &Pool, volume: &str) -> Result<(), BackupError> {
        let source_volume = source
            .volume(volume)
            .ok_or(BackupError::NotFound(volume.to_string()))?;
        let backup_volume = backup
            .volume(volume)
            .ok_or(BackupError::NotFound(volume.to_string()))?;

        for (side, newest, other) in [
            ("source", source_volume.current(), backup_volume),
            ("backup", backup_volume.current(), source_volume),
        ] {
            if let Some(orphan) = newest {
                if other.snapshot(orphan.name()).is_none() {
                    log::info!(
                        "recovering volume \"{}\": {} snapshot \"{}\" has no counterpart \
                         and rolls over to an incremental base candidate",
                        volume,
                        side,
                        orphan.name()
                    );
                }
            }
        }

        Ok(())
    }

    fn snapshot_source(
        &self,
        source: &mut Pool,
        volume: &str,
        snapshot: &str,
        hypervisor: &mut Option<(&mut dyn Hypervisor, &str)>,
    ) -> Result<(), BackupError> {
        let present = source
            .volume(volume)
            .is_some_and(|v| v.snapshot(snapshot).is_some());

        if present {
            log::debug!(
                "snapshot \"{}\" already present on volume \"{}\"",
                snapshot,
                volume
            );
            return Ok(());
        }

        let mut quiesced = false;

        if let Some((hypervisor, guest)) = hypervisor.as_mut() {
            match hypervisor.quiesce(guest) {
                Ok(()) => quiesced = true,
                Err(e) => log::warn!("continuing without quiescing \"{}\": {}", guest, e),
            }
        }

        let created = source.create_snapshot(volume, snapshot);

        // the guest resumes on every exit path
        if quiesced {
            if let Some((hypervisor, guest)) = hypervisor.as_mut() {
                if let Err(e) = hypervisor.resume(guest) {
                    log::error!("cannot resume guest \"{}\": {}", guest, e);
                }
            }
        }

        created
    }

    /// Divergence recovery: the backup side holds a snapshot by the
    /// requested name with different content. Destroy the failed base if it
    /// was the source's Last-role snapshot, then resolve a strictly older
    /// common base. The backup's own Last-role snapshot rolls over
    /// logically by position.
    fn demote_base(
        &self,
        source: &mut Pool,
        backup: &Pool,
        volume: &str,
        failed_base: &str,
    ) -> Result<Option<String>, BackupError> {
        log::warn!(
            "divergent snapshot on backup volume \"{}\", demoting base \"{}\"",
            volume,
            failed_base
        );

        let failed_creation = Snapshot::parse_creation(failed_base);
        let was_last = source
            .volume(volume)
            .and_then(|v| v.last())
            .is_some_and(|last| last.name() == failed_base);

        if was_last {
            source.remove_snapshot(volume, failed_base)?;
        }

        self.common_base(source, backup, volume, failed_creation)
    }

    fn common_base(
        &self,
        source: &Pool,
        backup: &Pool,
        volume: &str,
        older_than: Option<NaiveDateTime>,
    ) -> Result<Option<String>, BackupError> {
        let source_volume = source
            .volume(volume)
            .ok_or(BackupError::NotFound(volume.to_string()))?;

        Ok(backup.volume(volume).and_then(|backup_volume| {
            source_volume
                .most_recent_common_before(backup_volume, older_than)
                .map(|snapshot| snapshot.name().to_string())
        }))
    }
}
