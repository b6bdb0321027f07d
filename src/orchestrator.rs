use crate::config::{Configuration, PoolSpec};
use crate::driver::RbdDriver;
use crate::engine::ReplicationEngine;
use crate::exec::CommandExec;
use crate::hypervisor::{Hypervisor, XeCli};
use crate::pool::Pool;
use crate::retention::RetentionPlanner;
use anyhow::{Context as _, Result};
use chrono::NaiveDateTime;

/// Nominal size of a freshly created backup volume. The differential
/// import establishes the real size.
const NOMINAL_VOLUME_SIZE: u64 = 10 << 20;

/// Gateway metadata pools replicated per configured geography.
const RGW_POOL_BASES: [&str; 13] = [
    ".rgw.root",
    ".rgw.control",
    ".rgw.gc",
    ".rgw.buckets",
    ".rgw.buckets.index",
    ".rgw.buckets.extra",
    ".log",
    ".intent-log",
    ".usage",
    ".users",
    ".users.email",
    ".users.swift",
    ".users.uid",
];

/// Walks the configured volume list: per volume, replicate from the
/// source pool to the backup pool, then prune both sides. Failures are
/// isolated per volume.
pub struct Orchestrator {
    config: Configuration,
    now: NaiveDateTime,
    dry_run: bool,
    clean_only: bool,
}

impl Orchestrator {
    pub fn new(
        config: Configuration,
        now: NaiveDateTime,
        dry_run: bool,
        clean_only: bool,
    ) -> Self {
        Orchestrator {
            config,
            now,
            dry_run,
            clean_only,
        }
    }

    pub fn run(&self) -> Result<()> {
        let planner = RetentionPlanner::from_config(&self.config.policy, self.now)
            .context("invalid retention policy")?;

        let mut source = self.connect(&self.config.source)?;
        let mut backup = self.connect(&self.config.backup)?;

        log_usage(&mut source);
        log_usage(&mut backup);

        let mut hypervisor = self
            .config
            .xen
            .as_ref()
            .map(|xen| XeCli::new(xen, Box::new(CommandExec)));

        for (volume, guest) in block_volumes(&self.config) {
            let bracket: Option<(&mut dyn Hypervisor, &str)> = match (&mut hypervisor, &guest) {
                (Some(hypervisor), Some(guest)) => {
                    Some((hypervisor as &mut dyn Hypervisor, guest.as_str()))
                }
                _ => None,
            };

            if let Err(e) = self.backup_volume(&mut source, &mut backup, &planner, &volume, bracket)
            {
                log::error!("backup of volume \"{}\" failed: {:#}", volume, e);
            }
        }

        for geography in &self.config.geographies {
            if let Err(e) = self.backup_geography(geography, &planner) {
                log::error!("backup of geography \"{}\" failed: {:#}", geography, e);
            }
        }

        Ok(())
    }

    fn backup_volume(
        &self,
        source: &mut Pool,
        backup: &mut Pool,
        planner: &RetentionPlanner,
        volume: &str,
        hypervisor: Option<(&mut dyn Hypervisor, &str)>,
    ) -> Result<()> {
        if !self.clean_only {
            if source.volume(volume).is_none() {
                anyhow::bail!(
                    "volume \"{}\" does not exist on source pool \"{}\"",
                    volume,
                    source.name()
                );
            }

            backup.volume_or_create(volume, NOMINAL_VOLUME_SIZE)?;

            let mut exec = CommandExec;
            let outcome = ReplicationEngine::new(&mut exec, self.now, self.dry_run)
                .replicate(source, backup, volume, hypervisor)?;

            if outcome.transferred {
                log::info!(
                    "volume \"{}\": snapshot \"{}\" replicated ({})",
                    volume,
                    outcome.snapshot,
                    match &outcome.base {
                        Some(base) => format!("incremental from \"{}\"", base),
                        None => String::from("full send"),
                    }
                );
            }
        }

        planner.prune(source, volume)?;
        planner.prune(backup, volume)?;

        Ok(())
    }

    fn backup_geography(&self, geography: &str, planner: &RetentionPlanner) -> Result<()> {
        for pool_name in gateway_pool_names(geography) {
            let source_spec = PoolSpec {
                pool: pool_name.clone(),
                ..self.config.source.clone()
            };
            let backup_spec = PoolSpec {
                pool: pool_name.clone(),
                ..self.config.backup.clone()
            };

            let mut source = match self.connect(&source_spec) {
                Ok(pool) => pool,
                Err(e) => {
                    log::error!("skipping gateway pool \"{}\": {:#}", pool_name, e);
                    continue;
                }
            };
            let mut backup = self.connect(&backup_spec)?;

            for volume in source.volume_names() {
                if let Err(e) =
                    self.backup_volume(&mut source, &mut backup, planner, &volume, None)
                {
                    log::error!(
                        "backup of gateway volume \"{}/{}\" failed: {:#}",
                        pool_name,
                        volume,
                        e
                    );
                }
            }
        }

        Ok(())
    }

    fn connect(&self, spec: &PoolSpec) -> Result<Pool> {
        Pool::load(
            &spec.pool,
            Box::new(RbdDriver::new(spec, Box::new(CommandExec))),
            self.dry_run,
        )
        .with_context(|| format!("cannot open pool \"{}\"", spec.pool))
    }
}

/// Volumes of the block pathway along with the guest to quiesce, if any.
/// Each VM identifier backs the volume `vm-<id>`; raw volume names carry
/// no guest.
fn block_volumes(config: &Configuration) -> Vec<(String, Option<String>)> {
    config
        .vm_backups
        .iter()
        .map(|id| (format!("vm-{}", id), Some(id.clone())))
        .chain(config.rbd_backups.iter().map(|name| (name.clone(), None)))
        .collect()
}

fn gateway_pool_names(geography: &str) -> Vec<String> {
    let prefix = if geography == "default" {
        String::new()
    } else {
        format!(".{}", geography)
    };

    RGW_POOL_BASES
        .iter()
        .map(|base| format!("{}{}", prefix, base))
        .collect()
}

fn log_usage(pool: &mut Pool) {
    match pool.stats() {
        Ok(stats) => log::info!(
            "pool \"{}\": {} KB used, {} KB available",
            pool.name(),
            stats.kb_used,
            stats.kb_avail
        ),
        Err(e) => log::warn!("cannot read cluster stats of pool \"{}\": {}", pool.name(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;

    fn config(vms: &[&str], raw: &[&str]) -> Configuration {
        Configuration {
            source: PoolSpec {
                pool: "rbd".into(),
                conf: "/etc/ceph/ceph.conf".into(),
                user: "admin".into(),
                keyring: None,
            },
            backup: PoolSpec {
                pool: "rbdbackup".into(),
                conf: "/etc/ceph/ceph.backup.conf".into(),
                user: "backup".into(),
                keyring: None,
            },
            xen: None,
            vm_backups: vms.iter().map(|v| v.to_string()).collect(),
            rbd_backups: raw.iter().map(|v| v.to_string()).collect(),
            geographies: Vec::new(),
            policy: PolicyConfig::default(),
        }
    }

    #[test]
    fn vm_identifiers_map_to_prefixed_volumes() {
        let volumes = block_volumes(&config(&["100", "205"], &["scratch"]));

        assert_eq!(
            volumes,
            [
                (String::from("vm-100"), Some(String::from("100"))),
                (String::from("vm-205"), Some(String::from("205"))),
                (String::from("scratch"), None),
            ]
        );
    }

    #[test]
    fn default_geography_has_no_prefix() {
        let names = gateway_pool_names("default");

        assert_eq!(names[0], ".rgw.root");
        assert_eq!(names.len(), RGW_POOL_BASES.len());
    }

    #[test]
    fn named_geographies_are_prefixed() {
        let names = gateway_pool_names("paris");

        assert_eq!(names[0], ".paris.rgw.root");
        assert_eq!(names[4], ".paris.rgw.buckets.index");
    }
}
