use super::{ClusterStats, PoolDriver, RbdDriver, SnapshotInfo};
use crate::config::PoolSpec;
use crate::exec::MockExec;

fn spec(keyring: Option<&str>) -> PoolSpec {
    PoolSpec {
        pool: "rbd".into(),
        conf: "/etc/ceph/ceph.conf".into(),
        user: "admin".into(),
        keyring: keyring.map(str::to_string),
    }
}

#[test]
fn list_volumes() {
    let mut mock = MockExec::new();

    mock.expect_run()
        .once()
        .withf(|argv| {
            assert_eq!(
                argv,
                [
                    "rbd",
                    "-c",
                    "/etc/ceph/ceph.conf",
                    "--id",
                    "admin",
                    "ls",
                    "--format",
                    "json",
                    "rbd",
                ]
            );
            true
        })
        .returning(|_| Ok(String::from(r#"["vm-100","vm-101"]"#)));

    let mut driver = RbdDriver::new(&spec(None), Box::new(mock));

    assert_eq!(driver.list_volumes().unwrap(), vec!["vm-100", "vm-101"]);
}

#[test]
fn list_snapshots_parses_protected_strings() {
    let mut mock = MockExec::new();

    mock.expect_run()
        .once()
        .withf(|argv| {
            assert_eq!(
                argv,
                [
                    "rbd",
                    "-c",
                    "/etc/ceph/ceph.conf",
                    "--id",
                    "admin",
                    "snap",
                    "ls",
                    "--format",
                    "json",
                    "rbd/vm-100",
                ]
            );
            true
        })
        .returning(|_| {
            Ok(String::from(
                r#"[
                    {"id":4,"name":"backup2024-01-14T09.00.00","size":10737418240,"protected":"true"},
                    {"id":7,"name":"backup2024-01-15T09.00.00","size":10737418240,"protected":false}
                ]"#,
            ))
        });

    let mut driver = RbdDriver::new(&spec(None), Box::new(mock));

    assert_eq!(
        driver.list_snapshots("vm-100").unwrap(),
        vec![
            SnapshotInfo {
                id: 4,
                name: "backup2024-01-14T09.00.00".into(),
                size: 10737418240,
                protected: true,
            },
            SnapshotInfo {
                id: 7,
                name: "backup2024-01-15T09.00.00".into(),
                size: 10737418240,
                protected: false,
            },
        ]
    );
}

#[test]
fn create_snapshot_uses_keyring() {
    let mut mock = MockExec::new();

    mock.expect_run()
        .once()
        .withf(|argv| {
            assert_eq!(
                argv,
                [
                    "rbd",
                    "-c",
                    "/etc/ceph/ceph.conf",
                    "--id",
                    "admin",
                    "--keyring",
                    "/etc/ceph/admin.keyring",
                    "snap",
                    "create",
                    "rbd/vm-100@backup2024-01-15T09.00.00",
                ]
            );
            true
        })
        .returning(|_| Ok(String::new()));

    let mut driver = RbdDriver::new(&spec(Some("/etc/ceph/admin.keyring")), Box::new(mock));

    assert!(driver
        .create_snapshot("vm-100", "backup2024-01-15T09.00.00")
        .is_ok());
}

#[test]
fn create_volume_passes_nominal_size() {
    let mut mock = MockExec::new();

    mock.expect_run()
        .once()
        .withf(|argv| {
            assert_eq!(argv[5..], ["create", "--size", "10485760B", "rbd/vm-100"]);
            true
        })
        .returning(|_| Ok(String::new()));

    let mut driver = RbdDriver::new(&spec(None), Box::new(mock));

    assert!(driver.create_volume("vm-100", 10485760).is_ok());
}

#[test]
fn remove_snapshot_maps_protected_failure() {
    let mut mock = MockExec::new();

    mock.expect_run().once().returning(|_| {
        Err(crate::backup_error::BackupError::Command {
            code: 16,
            stderr: String::from("rbd: snapshot 'backup2024-01-14T09.00.00' is protected from removal."),
        })
    });

    let mut driver = RbdDriver::new(&spec(None), Box::new(mock));

    assert!(matches!(
        driver.remove_snapshot("vm-100", "backup2024-01-14T09.00.00"),
        Err(crate::backup_error::BackupError::Protected(_))
    ));
}

#[test]
fn is_protected_checks_the_snapshot_listing() {
    let mut mock = MockExec::new();

    mock.expect_run().times(2).returning(|_| {
        Ok(String::from(
            r#"[{"id":4,"name":"backup2024-01-14T09.00.00","size":0,"protected":"true"}]"#,
        ))
    });

    let mut driver = RbdDriver::new(&spec(None), Box::new(mock));

    assert!(driver
        .is_protected("vm-100", "backup2024-01-14T09.00.00")
        .unwrap());
    assert!(!driver
        .is_protected("vm-100", "backup2024-01-15T09.00.00")
        .unwrap());
}

#[test]
fn export_diff_args_with_base() {
    let driver = RbdDriver::new(&spec(None), Box::new(MockExec::new()));

    assert_eq!(
        driver.export_diff_args(
            "vm-100",
            "backup2024-01-15T09.00.00",
            Some("backup2024-01-14T09.00.00"),
        ),
        [
            "rbd",
            "-c",
            "/etc/ceph/ceph.conf",
            "--id",
            "admin",
            "export-diff",
            "--from-snap",
            "backup2024-01-14T09.00.00",
            "rbd/vm-100@backup2024-01-15T09.00.00",
            "-",
        ]
    );
}

#[test]
fn export_diff_args_full_send() {
    let driver = RbdDriver::new(&spec(None), Box::new(MockExec::new()));

    assert_eq!(
        driver.export_diff_args("vm-100", "backup2024-01-15T09.00.00", None)[5..],
        ["export-diff", "rbd/vm-100@backup2024-01-15T09.00.00", "-"]
    );
}

#[test]
fn import_diff_args() {
    let driver = RbdDriver::new(&spec(None), Box::new(MockExec::new()));

    assert_eq!(
        driver.import_diff_args("vm-100")[5..],
        ["import-diff", "-", "rbd/vm-100"]
    );
}

#[test]
fn cluster_stats_reads_ceph_df() {
    let mut mock = MockExec::new();

    mock.expect_run()
        .once()
        .withf(|argv| {
            assert_eq!(
                argv,
                [
                    "ceph",
                    "-c",
                    "/etc/ceph/ceph.conf",
                    "--id",
                    "admin",
                    "df",
                    "--format",
                    "json",
                ]
            );
            true
        })
        .returning(|_| {
            Ok(String::from(
                r#"{"stats":{"total_bytes":3072,"total_used_bytes":2048,"total_avail_bytes":1024}}"#,
            ))
        });

    let mut driver = RbdDriver::new(&spec(None), Box::new(mock));

    assert_eq!(
        driver.cluster_stats().unwrap(),
        ClusterStats {
            kb_used: 2,
            kb_avail: 1,
        }
    );
}
