use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

fn conscript(args: &[&str], cwd: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_conscript"))
        .args(args)
        .current_dir(cwd)
        .env_remove("CONSCRIPT_LOG")
        .output()
        .expect("failed to execute conscript")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

fn assert_success(output: &Output) -> String {
    assert!(output.status.success(), "command should succeed, stderr:\n{}", stderr(output));
    stdout(output)
}

#[test]
fn test_run_inline_code() {
    let dir = tempfile::tempdir().unwrap();
    let output = conscript(&["run", "-c", "echo(1 + 2 SPC \"ok\");"], dir.path());
    assert_eq!(assert_success(&output), "3 ok\n");
}

#[test]
fn test_run_writes_dso_and_reuses_it() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("main.cs"), "echo(\"from main\");\n").unwrap();

    let output = conscript(&["run", "main.cs"], dir.path());
    assert_eq!(assert_success(&output), "from main\n");
    assert!(dir.path().join("main.cs.dso").exists());

    // The cache keeps working without its source.
    std::fs::remove_file(dir.path().join("main.cs")).unwrap();
    let output = conscript(&["run", "main.cs"], dir.path());
    assert_eq!(assert_success(&output), "from main\n");
}

#[test]
fn test_run_without_dso() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("main.cs"), "echo(\"plain\");\n").unwrap();
    let output = conscript(&["run", "main.cs", "--no-dso"], dir.path());
    assert_eq!(assert_success(&output), "plain\n");
    assert!(!dir.path().join("main.cs.dso").exists());
}

#[test]
fn test_syntax_error_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("bad.cs"), "%a = 1;\n%b = ;\n").unwrap();
    let output = conscript(&["run", "bad.cs"], dir.path());
    assert!(!output.status.success());
    assert!(stderr(&output).contains("bad.cs:2: syntax error"), "stderr: {}", stderr(&output));
    assert!(!dir.path().join("bad.cs.dso").exists());
}

#[test]
fn test_compile_then_disasm() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("lib.cs"), "function twice(%x) { return %x * 2; }\n").unwrap();

    let output = conscript(&["compile", "lib.cs"], dir.path());
    assert!(assert_success(&output).starts_with("lib.cs.dso ("));
    let output = conscript(&["compile", "lib.cs"], dir.path());
    assert_eq!(assert_success(&output), "lib.cs.dso is up to date\n");
    let output = conscript(&["compile", "lib.cs", "--force", "-o", "out.dso"], dir.path());
    assert!(assert_success(&output).starts_with("out.dso ("));

    let output = conscript(&["disasm", "lib.cs.dso"], dir.path());
    let listing = assert_success(&output);
    assert!(listing.contains("FUNC_DECL twice("), "listing:\n{}", listing);
    assert!(listing.contains("RETURN_VOID"));
}

#[test]
fn test_disasm_json() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.cs"), "$x = \"hi\";\n").unwrap();
    let output = conscript(&["disasm", "a.cs", "--json"], dir.path());
    let json: serde_json::Value = serde_json::from_str(&assert_success(&output)).unwrap();
    assert_eq!(json["name"], "a.cs");
    let strings = json["global_strings"].as_array().unwrap();
    assert!(strings.iter().any(|s| s["text"] == "hi"));
    assert_eq!(json["break_list"], serde_json::json!([0, 1]));
}

#[test]
fn test_config_file_changes_extension() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("console.toml"), "dso_extension = \"cso\"\n").unwrap();
    std::fs::write(dir.path().join("m.cs"), "echo(7);\n").unwrap();
    let output = conscript(&["--config", "console.toml", "run", "m.cs"], dir.path());
    assert_eq!(assert_success(&output), "7\n");
    assert!(dir.path().join("m.cs.cso").exists());
}

#[test]
fn test_bad_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("console.toml"), "max_call_depth = \"deep\"\n").unwrap();
    let output = conscript(&["--config", "console.toml", "run", "-c", "echo(1);"], dir.path());
    assert!(!output.status.success());
    assert!(stderr(&output).contains("failed to parse"));
}

#[test]
fn test_console_reads_stdin() {
    let dir = tempfile::tempdir().unwrap();
    let mut child = Command::new(env!("CARGO_BIN_EXE_conscript"))
        .arg("console")
        .current_dir(dir.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("failed to execute conscript");
    {
        let mut stdin = child.stdin.take().unwrap();
        stdin
            .write_all(b"function sq(%v) { return %v * %v; }\nreturn sq(9);\necho(\"hey\");\n")
            .unwrap();
    }
    let output = child.wait_with_output().unwrap();
    assert_eq!(assert_success(&output), "81\nhey\n");
}
