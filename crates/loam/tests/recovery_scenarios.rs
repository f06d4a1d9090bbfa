//! End-to-end crash-recovery scenarios driven through the public API.

use loam::{
    CycleManager, Metrics, SegmentGroup, SegmentGroupConfig, SegmentWriter, Strategy,
    UnlimitedChecker,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn test_cycle() -> CycleManager {
    CycleManager::new(Duration::from_secs(3600))
}

fn open_group(dir: &Path, cycle: &CycleManager) -> loam::Result<SegmentGroup> {
    SegmentGroup::open(
        SegmentGroupConfig::new(dir, Strategy::Replace),
        Arc::new(Metrics::new()),
        Arc::new(UnlimitedChecker),
        cycle,
    )
}

fn write_segment(dir: &Path, file_name: &str, entries: &[(&[u8], Option<&[u8]>)]) {
    let mut writer =
        SegmentWriter::create(dir.join(file_name), Strategy::Replace, 0, true).unwrap();
    for (key, value) in entries {
        match value {
            Some(value) => writer.push_replace(key, value).unwrap(),
            None => writer.push_tombstone(key).unwrap(),
        }
    }
    writer.finish().unwrap();
}

fn sorted_dir(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

#[test]
fn test_clean_start() {
    let temp_dir = TempDir::new().unwrap();
    write_segment(temp_dir.path(), "segment-01.db", &[(b"k", Some(b"v1"))]);
    write_segment(temp_dir.path(), "segment-02.db", &[(b"k", Some(b"v2"))]);
    write_segment(temp_dir.path(), "segment-03.db", &[(b"other", Some(b"x"))]);

    let cycle = test_cycle();
    let group = open_group(temp_dir.path(), &cycle).unwrap();

    assert_eq!(group.len(), 3);
    // the newest occurrence of k is in segment 02
    assert_eq!(group.get(b"k").unwrap(), Some(b"v2".to_vec()));
    assert_eq!(group.get(b"other").unwrap(), Some(b"x".to_vec()));
    cycle.stop();
}

#[test]
fn test_wal_present_discards_segment() {
    let temp_dir = TempDir::new().unwrap();
    write_segment(temp_dir.path(), "segment-02.db", &[(b"k", Some(b"v"))]);
    fs::write(temp_dir.path().join("segment-02.wal"), b"pending").unwrap();

    let cycle = test_cycle();
    let group = open_group(temp_dir.path(), &cycle).unwrap();

    assert_eq!(group.len(), 0);
    assert!(group.is_empty());
    assert_eq!(sorted_dir(temp_dir.path()), vec!["segment-02.wal"]);
    cycle.stop();
}

#[test]
fn test_finished_compaction_not_yet_cleaned() {
    let temp_dir = TempDir::new().unwrap();
    write_segment(temp_dir.path(), "segment-01.db", &[(b"a", Some(b"1"))]);
    write_segment(temp_dir.path(), "segment-02.db", &[(b"b", Some(b"2"))]);
    write_segment(temp_dir.path(), "segment-01_02.db.tmp", &[(b"a", Some(b"1"))]);

    let cycle = test_cycle();
    let group = open_group(temp_dir.path(), &cycle).unwrap();

    assert_eq!(group.len(), 2);
    assert_eq!(
        sorted_dir(temp_dir.path()),
        vec!["segment-01.db", "segment-02.db"]
    );
    cycle.stop();
}

#[test]
fn test_crashed_compaction_inputs_gone() {
    let temp_dir = TempDir::new().unwrap();
    write_segment(
        temp_dir.path(),
        "segment-01_02.db.tmp",
        &[(b"a", Some(b"1")), (b"b", Some(b"2"))],
    );

    let cycle = test_cycle();
    let group = open_group(temp_dir.path(), &cycle).unwrap();

    assert_eq!(group.len(), 1);
    assert_eq!(sorted_dir(temp_dir.path()), vec!["segment-02.db"]);
    assert_eq!(group.get(b"a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(group.get(b"b").unwrap(), Some(b"2".to_vec()));
    cycle.stop();
}

#[test]
fn test_left_only_aftermath_fails() {
    let temp_dir = TempDir::new().unwrap();
    write_segment(temp_dir.path(), "segment-01.db", &[(b"a", Some(b"1"))]);
    write_segment(temp_dir.path(), "segment-01_02.db.tmp", &[(b"a", Some(b"1"))]);

    let cycle = test_cycle();
    let err = open_group(temp_dir.path(), &cycle).unwrap_err();
    assert!(err.to_string().contains("missing right segment"));
    cycle.stop();
}

#[test]
fn test_recovery_idempotent_across_reopens() {
    let temp_dir = TempDir::new().unwrap();
    write_segment(temp_dir.path(), "segment-01.db", &[(b"k", Some(b"v1"))]);
    write_segment(temp_dir.path(), "segment-02.db", &[(b"k", None)]);
    // stale duplicate: both inputs still present
    write_segment(temp_dir.path(), "segment-01_02.db.tmp", &[(b"k", None)]);
    fs::write(temp_dir.path().join("segment-00.db.deleted"), b"x").unwrap();

    let cycle = test_cycle();

    let group = open_group(temp_dir.path(), &cycle).unwrap();
    let first_len = group.len();
    let first_value = group.get(b"k").unwrap();
    group.shutdown(Duration::from_secs(1)).unwrap();
    let files = sorted_dir(temp_dir.path());

    for _ in 0..3 {
        let group = open_group(temp_dir.path(), &cycle).unwrap();
        assert_eq!(group.len(), first_len);
        assert_eq!(group.get(b"k").unwrap(), first_value);
        group.shutdown(Duration::from_secs(1)).unwrap();
        assert_eq!(sorted_dir(temp_dir.path()), files);
    }
    cycle.stop();
}
