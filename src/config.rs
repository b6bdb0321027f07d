use crate::backup_error::BackupError;
use ini::Ini;
use std::path::Path;

/// Connection parameters of one cluster pool.
#[derive(Debug, PartialEq, Clone)]
pub struct PoolSpec {
    pub pool: String,
    pub conf: String,
    pub user: String,
    pub keyring: Option<String>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct XenConfig {
    pub master: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, PartialEq, Clone, Default)]
pub struct PolicyConfig {
    pub time_to_live: Option<String>,
    pub max_retention: Option<String>,
    pub retention_policy: Option<String>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct Configuration {
    pub source: PoolSpec,
    pub backup: PoolSpec,
    pub xen: Option<XenConfig>,
    pub vm_backups: Vec<String>,
    pub rbd_backups: Vec<String>,
    pub geographies: Vec<String>,
    pub policy: PolicyConfig,
}

impl Configuration {
    pub fn read_from_file<P: AsRef<Path>>(filepath: P) -> Result<Self, BackupError> {
        let ini = Ini::load_from_file(&filepath).map_err(|e| {
            BackupError::Config(format!(
                "could not read configuration file \"{}\": {}",
                filepath.as_ref().display(),
                e
            ))
        })?;

        Self::from_ini(&ini)
    }

    pub fn from_str(contents: &str) -> Result<Self, BackupError> {
        let ini = Ini::load_from_str(contents)
            .map_err(|e| BackupError::Config(format!("invalid configuration: {}", e)))?;

        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, BackupError> {
        let main = |key: &str, default: &str| -> String {
            ini.section(Some("MAIN"))
                .and_then(|section| section.get(key))
                .unwrap_or(default)
                .to_string()
        };
        let main_opt = |key: &str| -> Option<String> {
            ini.section(Some("MAIN"))
                .and_then(|section| section.get(key))
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        let source = PoolSpec {
            pool: main("source_ceph_pool", "rbd"),
            conf: main("source_ceph_conf", "/etc/ceph/ceph.conf"),
            user: main("source_ceph_user", "admin"),
            keyring: main_opt("source_ceph_keyring"),
        };
        let backup = PoolSpec {
            pool: main("backup_ceph_pool", "rbdbackup"),
            conf: main("backup_ceph_conf", "/etc/ceph/ceph.backup.conf"),
            user: main("backup_ceph_user", "backup"),
            keyring: main_opt("backup_ceph_keyring"),
        };

        let xen = match (
            main_opt("xenserver_master"),
            main_opt("xenserver_user"),
            main_opt("xenserver_password"),
        ) {
            (Some(master), Some(user), Some(password)) => Some(XenConfig {
                master,
                user,
                password,
            }),
            (None, None, None) => None,
            _ => {
                return Err(BackupError::Config(String::from(
                    "xenserver_master, xenserver_user and xenserver_password must be set together",
                )))
            }
        };

        Ok(Configuration {
            source,
            backup,
            xen,
            vm_backups: name_list(ini, "VMLIST", "backups"),
            rbd_backups: name_list(ini, "RBDLIST", "backups"),
            geographies: name_list(ini, "RADOSGW", "geographies"),
            policy: PolicyConfig {
                time_to_live: section_opt(ini, "POLICY", "time_to_live"),
                max_retention: section_opt(ini, "POLICY", "max_retention"),
                retention_policy: section_opt(ini, "POLICY", "retention_policy"),
            },
        })
    }
}

fn section_opt(ini: &Ini, section: &str, key: &str) -> Option<String> {
    ini.section(Some(section))
        .and_then(|properties| properties.get(key))
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn name_list(ini: &Ini, section: &str, key: &str) -> Vec<String> {
    section_opt(ini, section, key)
        .map(|value| {
            value
                .split_whitespace()
                .map(str::to_string)
                .collect::<Vec<String>>()
        })
        .unwrap_or_default()
}
