//! Built-in modules driven through the full engine against a temp root.

use commitctl::core::config::EngineConfig;
use commitctl::core::engine::Engine;
use commitctl::core::logging::{self, Profile};
use commitctl::core::pipeline::{CommitRequest, Phase};
use commitctl::modules::{self, hostname, motd};
use std::fs;
use std::path::Path;

fn engine(config: &EngineConfig) -> Engine {
    logging::init(Profile::Quiet);
    let registry = modules::register_builtin(config).unwrap();
    Engine::new(registry, config.clone()).unwrap()
}

fn put(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn read(root: &Path, rel: &str) -> String {
    fs::read_to_string(root.join(rel)).unwrap()
}

#[test]
fn hostname_is_committed_before_motd() {
    let tmp = tempfile::tempdir().unwrap();
    let config = EngineConfig::rooted_at(tmp.path());
    let engine = engine(&config);
    let hostname_pos = engine.plan().position(hostname::NAME).unwrap();
    let motd_pos = engine.plan().position(motd::NAME).unwrap();
    assert!(hostname_pos < motd_pos);
    assert!(engine.plan().level_of(hostname::NAME) < engine.plan().level_of(motd::NAME));
}

#[test]
fn bootstrap_writes_hostname_and_banner() {
    let tmp = tempfile::tempdir().unwrap();
    let config = EngineConfig::rooted_at(tmp.path());
    put(
        &config.paths.committed_settings,
        "hostname.name = edge-01\nmotd.banner = \"Hello {hostname}\"\n",
    );

    let report = engine(&config).run_pipeline(&CommitRequest::bootstrap()).unwrap();
    assert!(report.success(), "{:?}", report.errors);
    assert_eq!(read(tmp.path(), "etc/hostname"), "edge-01\n");
    assert_eq!(read(tmp.path(), "etc/motd"), "Hello edge-01\n");
}

#[test]
fn defaults_apply_when_nothing_is_set() {
    let tmp = tempfile::tempdir().unwrap();
    let config = EngineConfig::rooted_at(tmp.path());
    put(&config.paths.committed_settings, "");

    let report = engine(&config).run_pipeline(&CommitRequest::bootstrap()).unwrap();
    assert!(report.success(), "{:?}", report.errors);
    assert_eq!(read(tmp.path(), "etc/hostname"), "appliance\n");
    assert_eq!(read(tmp.path(), "etc/motd"), "Welcome to appliance\n");
}

#[test]
fn hostname_change_rewrites_the_banner() {
    let tmp = tempfile::tempdir().unwrap();
    let config = EngineConfig::rooted_at(tmp.path());
    put(
        &config.paths.committed_settings,
        "hostname.name = edge-01\nmotd.banner = \"Hello {hostname}\"\n",
    );
    engine(&config).run_pipeline(&CommitRequest::bootstrap()).unwrap();

    let candidate = tmp.path().join("candidate.tune");
    put(&candidate, "hostname.name = edge-02\nmotd.banner = \"Hello {hostname}\"\n");
    let report = engine(&config)
        .run_pipeline(&CommitRequest::commit(&candidate))
        .unwrap();
    assert!(report.success(), "{:?}", report.errors);
    assert_eq!(report.modified, vec![hostname::NAME.to_string()]);
    assert_eq!(read(tmp.path(), "etc/hostname"), "edge-02\n");
    assert_eq!(read(tmp.path(), "etc/motd"), "Hello edge-02\n");
    assert_eq!(
        fs::read_to_string(&config.paths.committed_settings).unwrap(),
        read(tmp.path(), "candidate.tune")
    );
}

#[test]
fn invalid_hostname_fails_only_hostname() {
    let tmp = tempfile::tempdir().unwrap();
    let config = EngineConfig::rooted_at(tmp.path());
    let candidate = tmp.path().join("candidate.tune");
    put(&candidate, "hostname.name = edge_01\nmotd.banner = hi\n");

    let report = engine(&config)
        .run_pipeline(&CommitRequest::validate(&candidate))
        .unwrap();
    assert_eq!(report.failed_phase, Some(Phase::Validate));
    assert_eq!(report.failed_modules(), vec![hostname::NAME]);
}

#[test]
fn unknown_setting_is_rejected_by_its_owner() {
    let tmp = tempfile::tempdir().unwrap();
    let config = EngineConfig::rooted_at(tmp.path());
    let candidate = tmp.path().join("candidate.tune");
    put(&candidate, "motd.color = red\n");

    let report = engine(&config)
        .run_pipeline(&CommitRequest::validate(&candidate))
        .unwrap();
    assert_eq!(report.failed_modules(), vec![motd::NAME]);
}

#[test]
fn security_error_leaves_banner_alone() {
    let tmp = tempfile::tempdir().unwrap();
    let config = EngineConfig::rooted_at(tmp.path());
    put(&config.paths.committed_settings, "hostname.name = edge-01\n");
    put(&config.security_error_marker(), "");

    let report = engine(&config).run_pipeline(&CommitRequest::bootstrap()).unwrap();
    assert!(report.success(), "{:?}", report.errors);
    assert_eq!(read(tmp.path(), "etc/hostname"), "edge-01\n");
    assert!(!tmp.path().join("etc/motd").exists());
    assert!(report.skipped.contains(&motd::NAME.to_string()));
}
