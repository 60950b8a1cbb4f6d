use std::fs;
use std::path::Path;
use std::process::{Command, Output};

fn anvil() -> Command {
    Command::new(env!("CARGO_BIN_EXE_anvil"))
}

fn run(cmd: &mut Command) -> Output {
    cmd.output().expect("failed to run anvil")
}

fn write_file(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

#[test]
fn version() {
    let out = run(anvil().arg("--version"));
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).starts_with("anvil "));
}

#[test]
fn empty_project_update() {
    let tmp = tempfile::tempdir().unwrap();
    let proj = tmp.path().join("proj");
    write_file(&proj.join("build/bootstrap.build"), "project_name = proj\n");
    write_file(&proj.join("buildfile"), "./: file{data}\n");
    write_file(&proj.join("data"), "static content\n");

    let out = run(anvil().arg(format!("perform(update({}/))", proj.display())));
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
}

#[test]
fn structured_result() {
    let tmp = tempfile::tempdir().unwrap();
    let proj = tmp.path().join("hello");
    write_file(&proj.join("build/bootstrap.build"), "project_name = hello\n");
    write_file(&proj.join("buildfile"), "./: file{data}\n");
    write_file(&proj.join("data"), "x\n");

    let out = run(anvil()
        .arg("--structured-result")
        .arg(format!("perform(update({}/))", proj.display())));
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );

    let stdout = String::from_utf8_lossy(&out.stdout);
    let line = stdout.lines().next().expect("expected a result line");
    assert!(
        line.starts_with("unchanged perform update "),
        "line: {}",
        line
    );
    assert!(line.contains("dir{hello/}"), "line: {}", line);

    // No diagnostics for successful targets.
    assert!(out.stderr.is_empty());
}

#[test]
fn failure_exit_code() {
    let tmp = tempfile::tempdir().unwrap();
    let proj = tmp.path().join("broken");
    write_file(&proj.join("build/bootstrap.build"), "project_name = broken\n");
    write_file(&proj.join("buildfile"), "./: file{missing}\n");

    let out = run(anvil().arg(format!("perform(update({}/))", proj.display())));
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("no rule to update"), "stderr: {}", stderr);
}

#[test]
fn configure_disfigure_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    let out_dir = tmp.path().join("out");
    write_file(&src.join("build/bootstrap.build"), "project_name = rt\n");
    write_file(&src.join("buildfile"), "./: file{data}\n");
    write_file(&src.join("data"), "d\n");

    // configure: creates config.build and, out != src, src-root.build.
    let out = run(anvil().arg(format!(
        "configure({}/@{}/)",
        src.display(),
        out_dir.display()
    )));
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert!(out_dir.join("build/config.build").is_file());
    let sr = fs::read_to_string(out_dir.join("build/bootstrap/src-root.build")).unwrap();
    assert!(sr.contains("src_root ="), "content: {}", sr);

    // disfigure: removes both, plus build/bootstrap/, build/, and the
    // out directory itself once empty.
    let out = run(anvil().arg(format!("disfigure({}/)", out_dir.display())));
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert!(!out_dir.exists());
}

#[test]
fn configured_value_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    let out_dir = tmp.path().join("out");
    write_file(&src.join("build/bootstrap.build"), "project_name = cfg\n");
    write_file(
        &src.join("buildfile"),
        "print $config.test.value\n",
    );

    // Set a config.* override on the command line and configure.
    let out = run(anvil()
        .arg("config.test.value=hello")
        .arg(format!("configure({}/@{}/)", src.display(), out_dir.display())));
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    let cfg = fs::read_to_string(out_dir.join("build/config.build")).unwrap();
    assert!(cfg.contains("config.test.value = hello"), "content: {}", cfg);

    // A later update sees the persisted value without the override.
    let out = run(anvil().arg(format!("perform(update({}/))", out_dir.display())));
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    assert!(String::from_utf8_lossy(&out.stdout).contains("hello"));
}
