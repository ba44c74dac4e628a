use std::error::Error;
use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn cli(workspace: &Path) -> Result<Command, Box<dyn Error>> {
    let mut cmd = Command::cargo_bin("gridvault")?;
    cmd.env_remove("GRIDVAULT_WORKSPACE")
        .args(["--workspace", workspace.to_str().unwrap()]);
    Ok(cmd)
}

/// Runs `create` and returns the identifier printed on success.
fn create(workspace: &Path, name: &str) -> Result<String, Box<dyn Error>> {
    let output = cli(workspace)?.args(["create", name]).output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout)?;
    let id = stdout
        .trim()
        .strip_prefix("Created project ")
        .ok_or("unexpected create output")?;
    Ok(id.to_string())
}

#[test]
fn create_export_import_delete_roundtrip() -> Result<(), Box<dyn Error>> {
    let workspace = tempdir()?;
    let id = create(workspace.path(), "Census")?;

    let project_dir = workspace.path().join(format!("{id}.project"));
    assert!(project_dir.join("metadata.json").is_file());
    fs::write(project_dir.join("rows.csv"), "a,b\n1,2\n")?;

    cli(workspace.path())?
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains(format!("{id}\tCensus")));

    let archive = workspace.path().join("out/census.tar.gz");
    cli(workspace.path())?
        .args(["export", &id, "--output", archive.to_str().unwrap()])
        .assert()
        .success();
    let bytes = fs::read(&archive)?;
    assert_eq!(&bytes[..2], &[0x1f, 0x8b]);

    cli(workspace.path())?
        .args(["import", archive.to_str().unwrap(), "--id", "12345"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Imported project 12345"));
    assert_eq!(
        fs::read_to_string(workspace.path().join("12345.project/rows.csv"))?,
        "a,b\n1,2\n"
    );

    cli(workspace.path())?
        .args(["delete", &id])
        .assert()
        .success();
    assert!(!project_dir.exists());

    cli(workspace.path())?
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("12345\tCensus"))
        .stdout(predicate::str::contains(format!("{id}\t")).not());
    Ok(())
}

#[test]
fn failed_import_leaves_nothing_behind() -> Result<(), Box<dyn Error>> {
    let workspace = tempdir()?;
    let bogus = workspace.path().join("bogus.tar");
    fs::write(&bogus, "not an archive")?;

    cli(workspace.path())?
        .args(["import", bogus.to_str().unwrap(), "--id", "42"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to import"));
    assert!(!workspace.path().join("42.project").exists());

    cli(workspace.path())?
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No projects registered"));
    Ok(())
}

#[test]
fn preferences_round_trip_through_the_index() -> Result<(), Box<dyn Error>> {
    let workspace = tempdir()?;

    cli(workspace.path())?
        .args(["prefs", "set", "scripting.starred", r#"{"count": 3}"#])
        .assert()
        .success();
    cli(workspace.path())?
        .args(["prefs", "get", "scripting.starred"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"count\": 3"));

    let index = fs::read_to_string(workspace.path().join("workspace.json"))?;
    assert!(index.contains("scripting.starred"));

    cli(workspace.path())?
        .args(["prefs", "unset", "scripting.starred"])
        .assert()
        .success();
    cli(workspace.path())?
        .args(["prefs", "get", "scripting.starred"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("is not set"));
    Ok(())
}

#[test]
fn invalid_preference_json_is_rejected() -> Result<(), Box<dyn Error>> {
    let workspace = tempdir()?;
    cli(workspace.path())?
        .args(["prefs", "set", "rows", "{ nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to set preference 'rows'"));
    Ok(())
}

#[test]
fn expressions_list_newest_first() -> Result<(), Box<dyn Error>> {
    let workspace = tempdir()?;
    for expression in ["value.trim()", "value.length()", "value.trim()"] {
        cli(workspace.path())?
            .args(["expressions", "add", expression])
            .assert()
            .success();
    }
    cli(workspace.path())?
        .args(["expressions", "list"])
        .assert()
        .success()
        .stdout("value.trim()\nvalue.length()\n");
    Ok(())
}

#[test]
fn workspace_can_come_from_the_environment() -> Result<(), Box<dyn Error>> {
    let workspace = tempdir()?;
    Command::cargo_bin("gridvault")?
        .env("GRIDVAULT_WORKSPACE", workspace.path())
        .args(["create", "From env"])
        .assert()
        .success();
    assert!(workspace.path().join("workspace.json").is_file());
    Ok(())
}

#[test]
fn deleting_an_unknown_project_fails() -> Result<(), Box<dyn Error>> {
    let workspace = tempdir()?;
    cli(workspace.path())?
        .args(["delete", "777"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("project 777 is not registered"));

    cli(workspace.path())?
        .args(["export", "777", "--output", "x.tar"])
        .current_dir(workspace.path())
        .assert()
        .failure();
    assert!(!workspace.path().join("x.tar").exists());
    Ok(())
}
