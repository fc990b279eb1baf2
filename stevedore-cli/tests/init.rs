use predicates::prelude::*;
use tempfile::TempDir;

mod common;

#[test]
fn test_init_writes_canonical_containerfile() {
    let ctx = common::TestContext::new();
    let project = TempDir::new().unwrap();

    ctx.new_cmd()
        .arg("init")
        .arg(project.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Containerfile"));

    let text = std::fs::read_to_string(project.path().join("Containerfile")).unwrap();
    assert!(text.starts_with("FROM python:3.11-slim\n"));
    assert!(text.contains("RUN pip install --no-cache-dir --default-timeout=900 -r requirements.txt\n"));
    assert!(text.ends_with(
        "CMD [\"gunicorn\", \"-k\", \"uvicorn.workers.UvicornWorker\", \"--bind\", \"0.0.0.0:8000\", \"app.main:app\"]\n"
    ));
    assert!(project.path().join("requirements.txt").is_file());
}

#[test]
fn test_init_refuses_to_overwrite() {
    let ctx = common::TestContext::new();
    let project = TempDir::new().unwrap();

    ctx.new_cmd().arg("init").arg(project.path()).assert().success();
    ctx.new_cmd()
        .arg("init")
        .arg(project.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
    ctx.new_cmd()
        .args(["init", "--force", "--program", "stevedore serve"])
        .arg(project.path())
        .assert()
        .success();

    let text = std::fs::read_to_string(project.path().join("Containerfile")).unwrap();
    assert!(text.contains("CMD [\"stevedore\", \"serve\", \"-k\""));
}

#[test]
fn test_init_then_check_is_clean() {
    let ctx = common::TestContext::new();
    let project = TempDir::new().unwrap();
    std::fs::write(project.path().join("requirements.txt"), "foo==1.0\n").unwrap();

    ctx.new_cmd().arg("init").arg(project.path()).assert().success();
    ctx.new_cmd()
        .args(["check", "--strict"])
        .arg(project.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("10 step(s) OK"))
        .stdout(predicate::str::contains("1 requirement(s), 0 unpinned"))
        .stdout(predicate::str::contains("warning").not());
}

#[test]
fn test_check_reports_lint_warnings() {
    let ctx = common::TestContext::new();
    let project = TempDir::new().unwrap();
    std::fs::write(
        project.path().join("Containerfile"),
        "FROM python:3.11-slim\nCOPY . .\nRUN pip install -r requirements.txt\n",
    )
    .unwrap();

    ctx.new_cmd()
        .arg("check")
        .arg(project.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("warning: step 3"));
    ctx.new_cmd()
        .args(["check", "--strict"])
        .arg(project.path())
        .assert()
        .failure();
}

#[test]
fn test_check_rejects_invalid_recipe() {
    let ctx = common::TestContext::new();
    let project = TempDir::new().unwrap();
    std::fs::write(project.path().join("Containerfile"), "RUN echo hi\n").unwrap();

    ctx.new_cmd()
        .arg("check")
        .arg(project.path())
        .assert()
        .code(1)
        .stderr(predicate::str::contains("FROM"));
}
