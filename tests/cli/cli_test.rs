//! CLI contract tests.

use assert_cmd::Command;

fn cellchat(config_dir: &tempfile::TempDir) -> Command {
    let mut cmd = match Command::cargo_bin("cellchat") {
        Ok(cmd) => cmd,
        Err(err) => panic!("cellchat binary should build: {err}"),
    };
    cmd.env("CELLCHAT_CONFIG_PATH", config_dir.path().join("config.toml"))
        .env_remove("CELLCHAT_COUNTRY")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn key_merges_spellings_of_one_number() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    cellchat(&tmp)
        .args(["key", "+1 555 0100,555-0100", "--country", "US"])
        .assert()
        .success()
        .stdout("+15550100\n");
}

#[test]
fn key_sorts_group_members() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    cellchat(&tmp)
        .args(["key", "(212) 555-0101, +1 212 555 0100", "--country", "US"])
        .assert()
        .success()
        .stdout("+12125550100,+12125550101\n");
}

#[test]
fn key_uses_the_configured_country() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    std::fs::write(
        tmp.path().join("config.toml"),
        "[account]\ncountry = \"GB\"\n",
    )
    .expect("write config");
    cellchat(&tmp)
        .args(["key", "07700 900123"])
        .assert()
        .success()
        .stdout("+447700900123\n");
}

#[test]
fn key_without_recipients_fails() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    cellchat(&tmp).args(["key", " , "]).assert().failure();
}

#[test]
fn chats_on_a_fresh_database() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    cellchat(&tmp)
        .env("CELLCHAT_DB_PATH", tmp.path().join("history.db"))
        .arg("chats")
        .assert()
        .success()
        .stdout("no chats\n");
}

#[test]
fn unknown_subcommand_is_rejected() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    cellchat(&tmp).arg("reset").assert().failure();
}
