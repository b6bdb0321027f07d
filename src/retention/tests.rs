use super::{PruneOutcome, RetentionPlanner};
use crate::config::PolicyConfig;
use crate::driver::{MockDriver, SnapshotInfo};
use crate::pool::Pool;
use chrono::{NaiveDate, NaiveDateTime};

fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(h, 0, 0)
        .unwrap()
}

fn info(name: &str, protected: bool) -> SnapshotInfo {
    SnapshotInfo {
        id: 1,
        name: name.into(),
        size: 0,
        protected,
    }
}

fn planner(policy: PolicyConfig, now: NaiveDateTime) -> RetentionPlanner {
    RetentionPlanner::from_config(&policy, now).unwrap()
}

fn pool_with(mock: MockDriver) -> Pool {
    Pool::load("rbdbackup", Box::new(mock), false).unwrap()
}

fn expect_volume(mock: &mut MockDriver, snapshots: Vec<SnapshotInfo>) {
    mock.expect_list_volumes()
        .times(1)
        .returning(|| Ok(vec![String::from("vm-100")]));
    mock.expect_list_snapshots()
        .times(1)
        .returning(move |_| Ok(snapshots.clone()));
}

#[test]
fn bucket_policy_destroys_trash_only() {
    let mut mock = MockDriver::new();

    // six dailies ending 2024-01-15; policy keeps two dailies
    expect_volume(
        &mut mock,
        vec![
            info("backup2024-01-15T09.00.00", false),
            info("backup2024-01-14T09.00.00", false),
            info("backup2024-01-13T09.00.00", false),
            info("backup2024-01-12T09.00.00", false),
            info("backup2024-01-11T09.00.00", false),
            info("backup2024-01-10T09.00.00", false),
        ],
    );
    // walk: 15th/14th mandatory, 13th seeds the capacity-0 hour bucket,
    // dailies are 12th/11th/10th with the two newest kept
    mock.expect_remove_snapshot()
        .times(2)
        .withf(|volume, snapshot| {
            assert_eq!(volume, "vm-100");
            assert!(
                snapshot == "backup2024-01-13T09.00.00" || snapshot == "backup2024-01-10T09.00.00"
            );
            true
        })
        .returning(|_, _| Ok(()));

    let mut pool = pool_with(mock);
    let planner = planner(
        PolicyConfig {
            time_to_live: Some("2d".into()),
            max_retention: None,
            retention_policy: None,
        },
        at(2024, 1, 15, 12),
    );

    let outcome = planner.prune(&mut pool, "vm-100").unwrap();

    assert_eq!(
        outcome.destroyed,
        ["backup2024-01-13T09.00.00", "backup2024-01-10T09.00.00"]
    );
    assert_eq!(pool.volume("vm-100").unwrap().snapshots().len(), 4);
}

#[test]
fn retention_policy_protects_and_rescues_from_trash() {
    let mut mock = MockDriver::new();

    expect_volume(
        &mut mock,
        vec![
            info("backup2024-01-15T09.00.00", false),
            info("backup2024-01-14T09.00.00", false),
            info("backup2024-01-13T09.00.00", false),
            info("backup2023-12-01T00.00.00@pinned", false),
        ],
    );
    // the pinned snapshot gains the keep tag; the three recent ones
    // match "1 week" and gain it as well
    mock.expect_protect_snapshot()
        .times(4)
        .returning(|_, _| Ok(()));
    // the hour-bucket seed (13th) is trashed by capacity but matches
    // "1 week", so nothing is destroyed
    let mut pool = pool_with(mock);
    let planner = planner(
        PolicyConfig {
            time_to_live: Some("0d".into()),
            max_retention: None,
            retention_policy: Some("@pinned and 1 week".into()),
        },
        at(2024, 1, 15, 12),
    );

    let outcome = planner.prune(&mut pool, "vm-100").unwrap();

    assert_eq!(outcome.destroyed, Vec::<String>::new());
    assert_eq!(outcome.protected.len(), 4);
    assert!(pool
        .volume("vm-100")
        .unwrap()
        .snapshot("backup2023-12-01T00.00.00@pinned")
        .unwrap()
        .is_protected());
}

#[test]
fn stale_protection_tags_are_released() {
    let mut mock = MockDriver::new();

    expect_volume(
        &mut mock,
        vec![
            info("backup2024-01-15T09.00.00", false),
            info("backup2024-01-14T09.00.00", true),
        ],
    );
    mock.expect_unprotect_snapshot()
        .once()
        .withf(|volume, snapshot| {
            assert_eq!(volume, "vm-100");
            assert_eq!(snapshot, "backup2024-01-14T09.00.00");
            true
        })
        .returning(|_, _| Ok(()));

    let mut pool = pool_with(mock);
    // no retention policy configured: no snapshot may carry the tag
    let planner = planner(
        PolicyConfig {
            time_to_live: None,
            max_retention: None,
            retention_policy: None,
        },
        at(2024, 1, 15, 12),
    );

    let outcome = planner.prune(&mut pool, "vm-100").unwrap();

    assert_eq!(outcome.released, ["backup2024-01-14T09.00.00"]);
    assert_eq!(outcome.destroyed, Vec::<String>::new());
}

#[test]
fn max_retention_alone_does_not_destroy_kept_buckets() {
    let mut mock = MockDriver::new();

    expect_volume(
        &mut mock,
        vec![
            info("backup2024-01-15T09.00.00", false),
            info("backup2024-01-14T09.00.00", false),
            info("backup2024-01-13T09.00.00", false),
            info("backup2024-01-12T09.00.00", false),
        ],
    );
    // 13th seeds the hour bucket (capacity 1): kept although it fails
    // max_retention; the 12th is a daily within capacity
    let mut pool = pool_with(mock);
    let planner = planner(
        PolicyConfig {
            time_to_live: Some("1h,5d".into()),
            max_retention: Some("1 day".into()),
            retention_policy: None,
        },
        at(2024, 1, 15, 12),
    );

    let outcome = planner.prune(&mut pool, "vm-100").unwrap();

    assert_eq!(outcome, PruneOutcome::default());
}

#[test]
fn missing_volume_is_a_no_op() {
    let mut mock = MockDriver::new();

    mock.expect_list_volumes().times(1).returning(|| Ok(vec![]));

    let mut pool = pool_with(mock);
    let planner = planner(PolicyConfig::default(), at(2024, 1, 15, 12));

    assert_eq!(
        planner.prune(&mut pool, "vm-404").unwrap(),
        PruneOutcome::default()
    );
}

#[test]
fn dry_run_logs_but_does_not_touch_the_pool() {
    let mut mock = MockDriver::new();

    expect_volume(
        &mut mock,
        vec![
            info("backup2024-01-15T09.00.00", false),
            info("backup2024-01-14T09.00.00", false),
            info("backup2024-01-13T09.00.00", false),
            info("backup2024-01-12T09.00.00", false),
        ],
    );
    // no remove/protect expectations: any driver mutation fails the test

    let mut pool = Pool::load("rbdbackup", Box::new(mock), true).unwrap();
    let planner = planner(
        PolicyConfig {
            time_to_live: Some("0d".into()),
            max_retention: None,
            retention_policy: None,
        },
        at(2024, 1, 15, 12),
    );

    let outcome = planner.prune(&mut pool, "vm-100").unwrap();

    // identical decisions, no cluster mutation
    assert_eq!(
        outcome.destroyed,
        ["backup2024-01-13T09.00.00", "backup2024-01-12T09.00.00"]
    );
}
