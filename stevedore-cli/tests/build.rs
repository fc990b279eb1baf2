use predicates::prelude::*;
use tempfile::TempDir;

mod common;

fn build(ctx: &common::TestContext, context: &TempDir, tag: &str) -> assert_cmd::assert::Assert {
    ctx.new_cmd()
        .args(["build", "--isolation", "host", "-t", tag])
        .arg(context.path())
        .assert()
}

#[test]
fn test_build_then_rebuild_is_cached() {
    let ctx = common::TestContext::new();
    let context = common::host_context();

    build(&ctx, &context, "demo:1")
        .success()
        .stdout(predicate::str::contains("Step 5/8 : RUN mkdir -p installed"))
        .stdout(predicate::str::contains("Successfully built"))
        .stdout(predicate::str::contains("(0 of 8 steps cached)"));

    build(&ctx, &context, "demo:1")
        .success()
        .stdout(predicate::str::contains("(8 of 8 steps cached)"));
}

#[test]
fn test_source_change_only_reruns_final_copy() {
    let ctx = common::TestContext::new();
    let context = common::host_context();
    build(&ctx, &context, "demo:1").success();

    common::write_file(context.path(), "app/main.py", "app = None\n");
    build(&ctx, &context, "demo:1")
        .success()
        .stdout(predicate::str::contains("RUN mkdir -p installed && cp requirements.txt installed/ (cached)"))
        .stdout(predicate::str::contains("Step 6/8 : COPY . .\n"))
        .stdout(predicate::str::contains("(5 of 8 steps cached)"));
}

#[test]
fn test_images_inspect_export_rmi() {
    let ctx = common::TestContext::new();
    let context = common::host_context();
    build(&ctx, &context, "demo:1").success();

    ctx.new_cmd()
        .arg("images")
        .assert()
        .success()
        .stdout(predicate::str::contains("TAG"))
        .stdout(predicate::str::contains("demo:1"))
        .stdout(predicate::str::contains("python:3.11-slim"));

    ctx.new_cmd()
        .args(["inspect", "demo:1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"name\": \"foo\""))
        .stdout(predicate::str::contains("\"constraint\": \"==1.0\""))
        .stdout(predicate::str::contains("\"workdir\": \"/app\""));

    let out = TempDir::new().unwrap();
    let dest = out.path().join("rootfs");
    ctx.new_cmd()
        .args(["export", "demo:1"])
        .arg(&dest)
        .assert()
        .success();
    assert!(dest.join("etc/os-release").is_file());
    assert_eq!(
        std::fs::read_to_string(dest.join("app/installed/requirements.txt")).unwrap(),
        "foo==1.0\n"
    );
    assert!(dest.join("app/app/main.py").is_file());

    ctx.new_cmd()
        .args(["rmi", "demo:1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Untagged: demo:1"));
    ctx.new_cmd().args(["inspect", "demo:1"]).assert().failure();
}

#[test]
fn test_failing_step_exits_nonzero_without_image() {
    let ctx = common::TestContext::new();
    let context = common::host_context();
    common::write_file(
        context.path(),
        "Containerfile",
        "FROM python:3.11-slim\nWORKDIR /app\nRUN exit 7\n",
    );

    build(&ctx, &context, "broken:1")
        .code(1)
        .stderr(predicate::str::contains("step 3"));

    ctx.new_cmd()
        .args(["images", "-q"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_missing_base_image_fails() {
    let ctx = common::TestContext::new();
    let context = common::host_context();
    common::write_file(context.path(), "Containerfile", "FROM python:2.7-slim\nWORKDIR /app\n");

    build(&ctx, &context, "old:1")
        .code(1)
        .stderr(predicate::str::contains("python:2.7-slim unavailable"));
}

#[test]
fn test_build_requires_tag() {
    let ctx = common::TestContext::new();
    ctx.new_cmd().args(["build", "."]).assert().code(2);
}
