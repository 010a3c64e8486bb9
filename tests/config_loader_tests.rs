use ehr_sync::config::ConfigLoader;
use ehr_sync::models::enums::ConflictStrategy;
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

const TEST_KEY: &str = "YWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWE=";

const MANAGED_VARS: &[&str] = &[
    "EHR_SYNC_PROFILE",
    "EHR_SYNC_API_BIND_ADDR",
    "EHR_SYNC_LOG_LEVEL",
    "EHR_SYNC_CRYPTO_KEY",
    "EHR_SYNC_OPERATOR_TOKEN",
    "EHR_SYNC_OPERATOR_TOKENS",
    "EHR_SYNC_CONFLICT_DEFAULT_STRATEGY",
    "EHR_SYNC_CONFLICT_RESOURCE_STRATEGIES",
    "EHR_SYNC_QUEUE_SYNC_JOBS_CONCURRENCY",
    "EHR_SYNC_PROVIDER_EPIC_BASE_URL",
];

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    for var in MANAGED_VARS {
        unsafe {
            env::remove_var(var);
        }
    }
}

fn set_required() {
    unsafe {
        env::set_var("EHR_SYNC_CRYPTO_KEY", TEST_KEY);
        env::set_var("EHR_SYNC_OPERATOR_TOKENS", "ops-token-1, ops-token-2");
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

#[test]
fn loads_defaults_when_only_required_settings_present() {
    let _guard = env_guard();
    clear_env();
    set_required();

    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(
        cfg.operator_tokens,
        vec!["ops-token-1".to_string(), "ops-token-2".to_string()]
    );
    assert_eq!(cfg.crypto_key.as_ref().map(Vec::len), Some(32));
    assert_eq!(cfg.queues.sync_jobs.concurrency, 5);
    assert_eq!(cfg.queues.webhooks.concurrency, 10);
    assert_eq!(cfg.queues.conflicts.concurrency, 3);
    assert_eq!(cfg.conflicts.default_strategy, ConflictStrategy::LastWriteWins);
    cfg.bind_addr().expect("default bind addr parses");
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "EHR_SYNC_API_BIND_ADDR=127.0.0.1:3000\n");
    write_env_file(
        &temp_dir,
        ".env.test",
        "EHR_SYNC_API_BIND_ADDR=192.168.0.10:5000\n",
    );
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "EHR_SYNC_API_BIND_ADDR=10.0.0.5:6000\n",
    );
    // Profile selection comes from .env.local, before profile files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        &format!(
            "EHR_SYNC_PROFILE=test\nEHR_SYNC_API_BIND_ADDR=127.0.0.1:4000\nEHR_SYNC_OPERATOR_TOKEN=layered-token\nEHR_SYNC_CRYPTO_KEY={TEST_KEY}\n"
        ),
    );

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "10.0.0.5:6000");
    assert_eq!(cfg.operator_tokens, vec!["layered-token".to_string()]);
    clear_env();
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();
    set_required();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "EHR_SYNC_API_BIND_ADDR=127.0.0.1:3000\nEHR_SYNC_QUEUE_SYNC_JOBS_CONCURRENCY=2\n",
    );
    unsafe {
        env::set_var("EHR_SYNC_API_BIND_ADDR", "0.0.0.0:9090");
    }

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with env override");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");
    assert_eq!(cfg.queues.sync_jobs.concurrency, 2);

    clear_env();
}

#[test]
fn conflict_and_provider_settings_are_parsed() {
    let _guard = env_guard();
    clear_env();
    set_required();
    unsafe {
        env::set_var("EHR_SYNC_CONFLICT_DEFAULT_STRATEGY", "source_priority");
        env::set_var(
            "EHR_SYNC_CONFLICT_RESOURCE_STRATEGIES",
            "Observation:FIELD_LEVEL_MERGE, Patient:MANUAL_REVIEW",
        );
        env::set_var("EHR_SYNC_PROVIDER_EPIC_BASE_URL", "https://fhir.epic.test/api/FHIR/R4");
    }

    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads");

    assert_eq!(cfg.conflicts.default_strategy, ConflictStrategy::SourcePriority);
    assert_eq!(
        cfg.conflicts.resource_strategies.get("Observation"),
        Some(&ConflictStrategy::FieldLevelMerge)
    );
    assert_eq!(
        cfg.conflicts.resource_strategies.get("Patient"),
        Some(&ConflictStrategy::ManualReview)
    );
    assert_eq!(
        cfg.providers.base_urls.get("epic").map(String::as_str),
        Some("https://fhir.epic.test/api/FHIR/R4")
    );
    clear_env();
}

#[test]
fn missing_operator_tokens_is_rejected() {
    let _guard = env_guard();
    clear_env();
    unsafe {
        env::set_var("EHR_SYNC_CRYPTO_KEY", TEST_KEY);
    }

    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    assert!(loader.load().is_err());
    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();
    set_required();
    unsafe {
        env::set_var("EHR_SYNC_API_BIND_ADDR", "not-an-addr");
    }

    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let err = loader.load().expect_err("invalid bind addr should fail");
    assert!(format!("{}", err).contains("invalid api bind address"));

    clear_env();
}
