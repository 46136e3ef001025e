use std::path::Path;

use prsync::config::loader::{find_repo_local_config, load_config, merge_tables};
use prsync::config::types::AppConfig;
use prsync::engine::EngineSettings;
use prsync::types::PrStateFilter;

fn write(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

#[test]
fn parse_minimal_config() {
    let toml = r#"
[github]
owner = "acme"
repo = "widgets"
"#;
    let config: AppConfig = toml::from_str(toml).unwrap();
    assert_eq!(config.github.owner.as_deref(), Some("acme"));
    assert_eq!(config.github.repo.as_deref(), Some("widgets"));
    assert_eq!(config.github.host, "github.com");
    assert_eq!(config.repo.remote, "origin");
}

#[test]
fn parse_unknown_keys_ignored() {
    let toml = r#"
unknown_top_level = "should be ignored"

[engine]
workers = 2
colour = "blue"
"#;
    let config: AppConfig = toml::from_str(toml).unwrap();
    assert_eq!(config.engine.workers, 2);
}

#[test]
fn default_config_has_sane_defaults() {
    let config = AppConfig::default();
    assert_eq!(config.engine.workers, 4);
    assert_eq!(config.engine.default_state, PrStateFilter::Open);
    assert_eq!(config.engine.content_cache_capacity, 2_000);
    assert!(config.github.token_env.is_none());
    assert!(config.repo.path.is_none());
}

#[test]
fn parse_engine_section() {
    let toml = r#"
[engine]
workers = 8
default_state = "all"
content_cache_capacity = 100

[repo]
path = "/src/widgets"
remote = "upstream"
"#;
    let config: AppConfig = toml::from_str(toml).unwrap();
    assert_eq!(config.engine.default_state, PrStateFilter::All);
    assert_eq!(config.repo.path.as_deref(), Some(Path::new("/src/widgets")));

    let settings = EngineSettings::from_config(&config);
    assert_eq!(settings.workers, 8);
    assert_eq!(settings.remote_name, "upstream");
    assert_eq!(settings.content_cache_capacity, 100);
}

#[test]
fn zero_workers_is_clamped() {
    let config: AppConfig = toml::from_str("[engine]\nworkers = 0\n").unwrap();
    assert_eq!(EngineSettings::from_config(&config).workers, 1);
}

#[test]
fn invalid_state_is_rejected() {
    let result: Result<AppConfig, _> = toml::from_str("[engine]\ndefault_state = \"draft\"\n");
    assert!(result.is_err());
}

// ---------------------------------------------------------------------------
// Loading from disk
// ---------------------------------------------------------------------------

#[test]
fn load_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(
        dir.path(),
        "config.toml",
        "[github]\nhost = \"ghe.example.com\"\ntoken_env = \"GHE_TOKEN\"\n",
    );
    let config = load_config(Some(&path), dir.path()).unwrap();
    assert_eq!(config.github.host, "ghe.example.com");
    assert_eq!(config.github.token_env.as_deref(), Some("GHE_TOKEN"));
}

#[test]
fn invalid_toml_produces_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "broken.toml", "[github\nhost = ");
    let err = load_config(Some(&path), dir.path()).unwrap_err();
    let err_msg = format!("{err:#}");
    assert!(
        err_msg.contains("broken.toml"),
        "error should mention file: {err_msg}"
    );
}

#[test]
fn missing_config_file_produces_error() {
    let missing = Path::new("tests/fixtures/nonexistent.toml");
    let result = load_config(Some(missing), Path::new("."));
    assert!(result.is_err());
}

#[test]
fn local_keys_override_global_keys_only() {
    let global: toml::Table = toml::from_str(
        r#"
[github]
host = "github.com"
token_env = "MY_TOKEN"

[engine]
workers = 2
"#,
    )
    .unwrap();
    let local: toml::Table = toml::from_str(
        r#"
[github]
owner = "acme"

[repo]
remote = "upstream"
"#,
    )
    .unwrap();

    let config: AppConfig = toml::Value::Table(merge_tables(global, local))
        .try_into()
        .unwrap();
    assert_eq!(config.github.owner.as_deref(), Some("acme"));
    assert_eq!(config.github.token_env.as_deref(), Some("MY_TOKEN"));
    assert_eq!(config.engine.workers, 2);
    assert_eq!(config.repo.remote, "upstream");
}

#[test]
fn repo_local_config_found_from_subdirectory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join(".git")).unwrap();
    let nested = dir.path().join("src/deep");
    std::fs::create_dir_all(&nested).unwrap();
    let expected = write(dir.path(), ".prsync.toml", "[repo]\nremote = \"origin\"\n");

    assert_eq!(find_repo_local_config(&nested), Some(expected));
}

#[test]
fn repo_local_search_stops_at_git_root() {
    let outer = tempfile::tempdir().unwrap();
    write(outer.path(), ".prsync.toml", "");
    let repo = outer.path().join("repo");
    std::fs::create_dir_all(repo.join(".git")).unwrap();

    assert_eq!(find_repo_local_config(&repo), None);
}

#[test]
fn load_reads_repo_local_config_of_start_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir(dir.path().join(".git")).unwrap();
    let nested = dir.path().join("src");
    std::fs::create_dir_all(&nested).unwrap();
    write(dir.path(), ".prsync.toml", "[engine]\nworkers = 7\n");

    let config = load_config(None, &nested).unwrap();
    assert_eq!(config.engine.workers, 7);
}

#[test]
fn load_ignores_local_config_outside_start_repo() {
    let outer = tempfile::tempdir().unwrap();
    write(outer.path(), ".prsync.toml", "[engine]\nworkers = 7\n");
    let repo = outer.path().join("repo");
    std::fs::create_dir_all(repo.join(".git")).unwrap();

    let config = load_config(None, &repo).unwrap();
    assert_ne!(config.engine.workers, 7);
}
