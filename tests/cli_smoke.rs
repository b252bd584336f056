use std::process::Command;

fn valuate() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_valuate"));
    cmd.env_remove("VALUATE_API_KEY")
        .env_remove("OPENAI_API_KEY")
        .env_remove("VALUATE_CONFIG")
        .env("RUST_LOG", "off");
    cmd
}

#[test]
fn help_lists_subcommands() {
    let out = valuate().arg("--help").output().unwrap();
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    for sub in ["analyze", "peers", "cache-export", "cache-prune"] {
        assert!(text.contains(sub), "missing {sub} in:\n{text}");
    }
}

#[test]
fn analyze_without_credentials_fails() {
    let out = valuate()
        .args(["analyze", "--company", "ACME"])
        .output()
        .unwrap();
    assert!(!out.status.success());
    assert!(out.stdout.is_empty());
    assert!(String::from_utf8_lossy(&out.stderr).contains("MissingCredential"));
}

#[test]
fn cache_prune_requires_a_limit() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("cache.sqlite");
    let out = valuate()
        .args(["cache-prune", "--db"])
        .arg(&db)
        .output()
        .unwrap();
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("--max-rows"));
}

#[test]
fn cache_export_of_empty_cache_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let out_path = dir.path().join("rows.jsonl");
    let out = valuate()
        .args(["cache-export", "--db"])
        .arg(dir.path().join("cache.sqlite"))
        .arg("--out")
        .arg(&out_path)
        .output()
        .unwrap();
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("exported 0 rows"));
    assert_eq!(std::fs::read_to_string(out_path).unwrap(), "");
}
