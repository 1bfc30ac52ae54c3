#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use sombra_kv::{Database, DbFlags, EnvOptions, Environment, WriteFlags};
use tempfile::TempDir;

fn setup_env(name: &str) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join(name);
    seed(&path).expect("seed environment");
    (dir, path)
}

fn seed(path: &Path) -> sombra_kv::Result<()> {
    let opts = EnvOptions {
        max_dbs: 2,
        ..EnvOptions::default()
    };
    let env = Environment::open(path, opts)?;
    let txn = env.begin_rw()?;
    txn.put(Database::MAIN, b"alpha", b"1", WriteFlags::empty())?;
    txn.put(Database::MAIN, b"beta", b"two\x00", WriteFlags::empty())?;
    let colors = txn.open_db(Some("colors"), DbFlags::CREATE)?;
    txn.put(colors, b"sky", b"blue", WriteFlags::empty())?;
    txn.commit()
}

fn stdout_of(assert: assert_cmd::assert::Assert) -> String {
    String::from_utf8(assert.get_output().stdout.clone()).expect("utf-8 stdout")
}

fn stderr_of(assert: assert_cmd::assert::Assert) -> String {
    String::from_utf8(assert.get_output().stderr.clone()).expect("utf-8 stderr")
}

fn json_of(args: &[&str], path: &Path) -> Value {
    let output = cargo_bin_cmd!("kvtool")
        .args(["--format", "json"])
        .args(args)
        .arg(path)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn stat_emits_json() {
    let (_dir, path) = setup_env("stat");
    let json = json_of(&["stat"], &path);
    assert_eq!(json["info"]["page_size"], 4096);
    assert_eq!(json["info"]["last_txnid"], 1);
    assert_eq!(json["stat"]["entries"], 3);
    assert!(json["db"].is_null());

    let json = json_of(&["stat", "--db", "colors"], &path);
    assert_eq!(json["db"], "colors");
    assert_eq!(json["stat"]["entries"], 1);
}

#[test]
fn dump_escapes_binary_values() {
    let (_dir, path) = setup_env("dump");
    let out = stdout_of(cargo_bin_cmd!("kvtool").arg("dump").arg(&path).assert().success());
    assert!(out.contains("alpha\t1\n"), "{out}");
    assert!(out.contains("beta\ttwo\\x00\n"), "{out}");

    let json = json_of(&["dump", "--db", "colors"], &path);
    assert_eq!(json[0]["key"], "sky");
    assert_eq!(json[0]["value"], "blue");
}

#[test]
fn put_get_and_del_round_trip() {
    let (_dir, path) = setup_env("crud");
    let out = stdout_of(
        cargo_bin_cmd!("kvtool")
            .arg("put")
            .arg(&path)
            .args(["gamma", "3"])
            .assert()
            .success(),
    );
    assert_eq!(out, "Stored 'gamma'\n");
    cargo_bin_cmd!("kvtool")
        .arg("get")
        .arg(&path)
        .arg("gamma")
        .assert()
        .success()
        .stdout("3\n");
    let err = stderr_of(
        cargo_bin_cmd!("kvtool")
            .args(["put", "--no-overwrite"])
            .arg(&path)
            .args(["gamma", "4"])
            .assert()
            .failure(),
    );
    assert!(err.contains("error:"), "{err}");
    let out = stdout_of(
        cargo_bin_cmd!("kvtool")
            .arg("del")
            .arg(&path)
            .arg("gamma")
            .assert()
            .success(),
    );
    assert_eq!(out, "Deleted 'gamma'\n");
    let err = stderr_of(
        cargo_bin_cmd!("kvtool")
            .arg("get")
            .arg(&path)
            .arg("gamma")
            .assert()
            .failure(),
    );
    assert!(err.contains("key 'gamma' not found"), "{err}");
}

#[test]
fn put_creates_named_databases() {
    let (_dir, path) = setup_env("named");
    cargo_bin_cmd!("kvtool")
        .args(["put", "--db", "sizes"])
        .arg(&path)
        .args(["small", "s"])
        .assert()
        .success();
    let output = cargo_bin_cmd!("kvtool")
        .args(["--format", "json", "get", "--db", "sizes"])
        .arg(&path)
        .arg("small")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["key"], "small");
    assert_eq!(json["value"], "s");

    let json = json_of(&["stat", "--db", "sizes"], &path);
    assert_eq!(json["stat"]["entries"], 1);
    let json = json_of(&["stat"], &path);
    assert_eq!(json["stat"]["entries"], 4);
}

#[test]
fn copy_writes_a_usable_backup() {
    let (dir, path) = setup_env("source");
    let dest = dir.path().join("backup");
    let output = cargo_bin_cmd!("kvtool")
        .args(["--format", "json", "copy", "--compact"])
        .arg(&path)
        .arg(&dest)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["compact"], true);
    assert!(dest.join("data.mdb").is_file());

    let json = json_of(&["stat", "--db", "colors"], &dest);
    assert_eq!(json["stat"]["entries"], 1);
}

#[test]
fn readers_and_reader_check_on_an_idle_environment() {
    let (_dir, path) = setup_env("readers");
    let json = json_of(&["readers"], &path);
    assert_eq!(json.as_array().map(Vec::len), Some(0));
    let json = json_of(&["reader-check"], &path);
    assert_eq!(json["cleared"], 0);
    cargo_bin_cmd!("kvtool")
        .arg("readers")
        .arg(&path)
        .assert()
        .success()
        .stdout("(no readers)\n");
}

#[test]
fn config_file_supplies_the_default_path() {
    let (dir, path) = setup_env("configured");
    let config = dir.path().join("kvtool.toml");
    fs::write(
        &config,
        format!(
            "default_path = {:?}\n\n[env]\nmax_dbs = 4\nmax_readers = 16\n",
            path.display().to_string()
        ),
    )
    .expect("write config");
    let output = cargo_bin_cmd!("kvtool")
        .args(["--format", "json", "--config"])
        .arg(&config)
        .arg("stat")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["stat"]["entries"], 3);

    let err = stderr_of(cargo_bin_cmd!("kvtool").arg("stat").assert().failure());
    assert!(err.contains("error:"), "{err}");
}

#[test]
fn unknown_config_keys_are_rejected() {
    let (dir, path) = setup_env("badconfig");
    let config = dir.path().join("bad.toml");
    fs::write(&config, "[env]\nmap_sise = 1\n").expect("write config");
    let assert = cargo_bin_cmd!("kvtool")
        .arg("--config")
        .arg(&config)
        .arg("stat")
        .arg(&path)
        .assert()
        .failure();
    assert!(stderr_of(assert).contains("failed to parse config file"));
}
