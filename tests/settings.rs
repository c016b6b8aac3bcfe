mod support;

use commitctl::core::error::CommitError;
use commitctl::core::registry::{ModuleOptions, Registry};
use commitctl::core::settings::{self, ChangeDetector, MissingFile, Pass, Section};
use std::collections::BTreeSet;
use std::path::Path;
use support::{Log, Probe, entries, new_log, write};

fn registry(log: &Log) -> Registry {
    let mut r = Registry::new();
    for name in ["net", "dns"] {
        r.register_module(name, ModuleOptions::default(), Probe::new(name, log))
            .unwrap();
    }
    r
}

fn digests_of(path: &Path) -> ChangeDetector {
    let log = new_log();
    let mut r = registry(&log);
    let mut detector = ChangeDetector::new(false);
    settings::parse_file(
        &mut r,
        &mut detector,
        path,
        Pass::New,
        Section::Modules,
        MissingFile::Fail,
    )
    .unwrap();
    detector.finalize(["net", "dns"]);
    detector
}

#[test]
fn same_file_gives_same_digests() {
    let tmp = tempfile::tempdir().unwrap();
    let file = tmp.path().join("a.tune");
    write(&file, "net.if = eth0\nnet.mtu = 1500\ndns.server = 1.1.1.1\n");

    let first = digests_of(&file);
    let second = digests_of(&file);
    for module in ["net", "dns"] {
        assert_eq!(first.digests(module).unwrap().1, second.digests(module).unwrap().1);
    }
}

#[test]
fn one_changed_pair_changes_only_its_module() {
    let tmp = tempfile::tempdir().unwrap();
    let current = tmp.path().join("current.tune");
    let candidate = tmp.path().join("candidate.tune");
    write(&current, "net.if = eth0\nnet.mtu = 1500\ndns.server = 1.1.1.1\n");
    write(&candidate, "net.if = eth0\nnet.mtu = 9000\ndns.server = 1.1.1.1\n");

    let log = new_log();
    let mut r = registry(&log);
    let mut detector = ChangeDetector::new(false);
    settings::parse_file(
        &mut r,
        &mut detector,
        &current,
        Pass::Current,
        Section::Modules,
        MissingFile::Fail,
    )
    .unwrap();
    settings::parse_file(
        &mut r,
        &mut detector,
        &candidate,
        Pass::New,
        Section::Modules,
        MissingFile::Fail,
    )
    .unwrap();
    detector.finalize(["net", "dns", "first"]);

    assert!(detector.is_modified("net"));
    assert!(!detector.is_modified("dns"));
    assert!(!detector.is_modified("first"));
}

#[test]
fn bootstrap_marks_everything_modified() {
    let mut detector = ChangeDetector::new(true);
    detector.finalize(["net", "dns"]);
    assert!(detector.is_modified("net"));
    assert!(detector.is_modified("dns"));
}

#[test]
fn callbacks_get_unquoted_values_and_double_dot_names() {
    let tmp = tempfile::tempdir().unwrap();
    let file = tmp.path().join("a.tune");
    write(
        &file,
        "# comment\n\nnet..if = foo\nnet.descr = \"uplink \\\"A\\\"\"\nunknown.key = 1\n",
    );

    let log = new_log();
    let mut r = registry(&log);
    let mut detector = ChangeDetector::new(false);
    let stats = settings::parse_file(
        &mut r,
        &mut detector,
        &file,
        Pass::New,
        Section::Modules,
        MissingFile::Fail,
    )
    .unwrap();

    assert_eq!(stats.lines, 5);
    assert_eq!(stats.settings, 2);
    assert_eq!(stats.skipped, 1);
    let log = entries(&log);
    assert!(log.contains(&"net:parse:net..if=foo:new".to_string()), "{:?}", log);
    assert!(log.contains(&"net:parse:net.descr=uplink \"A\":new".to_string()), "{:?}", log);
}

#[test]
fn malformed_line_reports_its_number() {
    let tmp = tempfile::tempdir().unwrap();
    let file = tmp.path().join("a.tune");
    write(&file, "net.if = eth0\n\nthis line has no separator\n");

    let log = new_log();
    let mut r = registry(&log);
    let mut detector = ChangeDetector::new(false);
    let err = settings::parse_file(
        &mut r,
        &mut detector,
        &file,
        Pass::New,
        Section::Modules,
        MissingFile::Fail,
    )
    .unwrap_err();
    match err {
        CommitError::ParseError { line, .. } => assert_eq!(line, 3),
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn system_prefix_only_in_system_file() {
    let tmp = tempfile::tempdir().unwrap();
    let file = tmp.path().join("a.tune");
    write(&file, "sys.serial = ABC123\n");

    let log = new_log();
    let mut r = registry(&log);
    let mut detector = ChangeDetector::new(false);
    assert!(
        settings::parse_file(
            &mut r,
            &mut detector,
            &file,
            Pass::New,
            Section::Modules,
            MissingFile::Fail,
        )
        .is_err()
    );
    assert!(
        settings::parse_file(
            &mut r,
            &mut detector,
            &file,
            Pass::New,
            Section::System,
            MissingFile::Fail,
        )
        .is_ok()
    );

    write(&file, "net.if = eth0\n");
    assert!(
        settings::parse_file(
            &mut r,
            &mut detector,
            &file,
            Pass::New,
            Section::System,
            MissingFile::Fail,
        )
        .is_err()
    );
}

#[test]
fn missing_file_tolerated_only_when_asked() {
    let tmp = tempfile::tempdir().unwrap();
    let missing = tmp.path().join("absent.tune");
    let log = new_log();
    let mut r = registry(&log);
    let mut detector = ChangeDetector::new(false);

    let stats = settings::parse_file(
        &mut r,
        &mut detector,
        &missing,
        Pass::Current,
        Section::Modules,
        MissingFile::Tolerate,
    )
    .unwrap();
    assert_eq!(stats.settings, 0);
    assert!(matches!(
        settings::parse_file(
            &mut r,
            &mut detector,
            &missing,
            Pass::New,
            Section::Modules,
            MissingFile::Fail,
        ),
        Err(CommitError::NotFound(_))
    ));
}

#[test]
fn merge_replaces_only_excluded_modules() {
    let tmp = tempfile::tempdir().unwrap();
    let committed = tmp.path().join("committed.tune");
    let replacement = tmp.path().join("replacement.tune");
    write(&committed, "net.if = eth0\ndns.server = 1.1.1.1\n");
    write(&replacement, "net.if = eth9\ndns.server = 9.9.9.9\ndns.search = lan\n");

    let log = new_log();
    let r = registry(&log);
    let excluded: BTreeSet<String> = ["dns".to_string()].into();
    let mut out = Vec::new();
    let written =
        settings::merge_settings(&r, &committed, &replacement, &excluded, &mut out).unwrap();

    assert_eq!(written, 3);
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "net.if = eth0\ndns.server = 9.9.9.9\ndns.search = lan\n"
    );

    let unknown: BTreeSet<String> = ["ghost".to_string()].into();
    let mut sink = Vec::<u8>::new();
    assert!(settings::merge_settings(&r, &committed, &replacement, &unknown, &mut sink).is_err());
}
