use std::fs;
use std::path::Path;
use std::process::Command;

/// Run a .cs file with the conscript CLI and return (stdout, stderr, exit_code)
fn run_script_file(path: &Path, working_dir: Option<&Path>) -> (String, String, i32) {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_conscript"));
    cmd.arg("run");
    cmd.arg(path);
    // Snapshot sources stay free of compiled caches.
    cmd.arg("--no-dso");
    cmd.env_remove("CONSCRIPT_LOG");

    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }

    let output = cmd.output().expect("failed to execute conscript");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let exit_code = output.status.code().unwrap_or(-1);

    (stdout, stderr, exit_code)
}

/// Run a single snapshot test (file-based or directory-based)
fn run_snapshot_test(test_path: &Path) {
    let (script_path, working_dir, base_path) = if test_path.is_dir() {
        // Directory-based test: main.cs runs with the directory as cwd so
        // `exec` can reach its neighbours.
        let main_script = test_path.join("main.cs");
        assert!(main_script.exists(), "Directory test {:?} must contain main.cs", test_path);
        (main_script, Some(test_path), test_path.to_path_buf())
    } else {
        (test_path.to_path_buf(), None, test_path.with_extension(""))
    };

    let (actual_stdout, actual_stderr, actual_exitcode) = run_script_file(&script_path, working_dir);

    // Check stdout (exact match)
    let stdout_path = base_path.with_extension("stdout");
    if stdout_path.exists() {
        let expected_stdout = fs::read_to_string(&stdout_path)
            .unwrap_or_else(|e| panic!("Failed to read {:?}: {}", stdout_path, e));
        assert_eq!(
            actual_stdout, expected_stdout,
            "stdout mismatch for {:?}\n--- expected ---\n{}\n--- actual ---\n{}",
            script_path, expected_stdout, actual_stdout
        );
    }

    // Check stderr (partial match - expected must be contained in actual)
    let stderr_path = base_path.with_extension("stderr");
    if stderr_path.exists() {
        let expected_stderr = fs::read_to_string(&stderr_path)
            .unwrap_or_else(|e| panic!("Failed to read {:?}: {}", stderr_path, e));
        assert!(
            actual_stderr.contains(&expected_stderr),
            "stderr mismatch for {:?}\n--- expected (substring) ---\n{}\n--- actual ---\n{}",
            script_path,
            expected_stderr,
            actual_stderr
        );
    }

    // Check exit code (default: 0)
    let exitcode_path = base_path.with_extension("exitcode");
    let expected_exitcode = if exitcode_path.exists() {
        fs::read_to_string(&exitcode_path)
            .unwrap_or_else(|e| panic!("Failed to read {:?}: {}", exitcode_path, e))
            .trim()
            .parse::<i32>()
            .unwrap_or_else(|e| panic!("Invalid exitcode in {:?}: {}", exitcode_path, e))
    } else {
        0
    };

    assert_eq!(
        actual_exitcode, expected_exitcode,
        "exit code mismatch for {:?}: expected {}, got {}\nstderr:\n{}",
        test_path, expected_exitcode, actual_exitcode, actual_stderr
    );
}

/// Discover and run all tests in a directory: `.cs` files, and
/// subdirectories holding a `main.cs`.
fn run_snapshot_dir(dir: &str) {
    let dir_path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("snapshots").join(dir);

    let mut entries: Vec<_> = fs::read_dir(&dir_path)
        .unwrap_or_else(|e| panic!("Failed to read {:?}: {}", dir_path, e))
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|path| {
            path.extension().is_some_and(|ext| ext == "cs") || (path.is_dir() && path.join("main.cs").exists())
        })
        .collect();
    entries.sort();
    assert!(!entries.is_empty(), "no snapshot tests in {:?}", dir_path);

    for path in entries {
        run_snapshot_test(&path);
    }
}

#[test]
fn snapshot_basic() {
    run_snapshot_dir("basic");
}

#[test]
fn snapshot_errors() {
    run_snapshot_dir("errors");
}

#[test]
fn snapshot_modules() {
    run_snapshot_dir("modules");
}
