//! DSO files on disk: compile, reload, execute.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use conscript::compiler;
use conscript::{ConsoleError, DsoError, RuntimeConfig, VM};

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Capture {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

fn captured_vm() -> (VM, Capture) {
    let capture = Capture::default();
    let config = RuntimeConfig {
        write_dso: false,
        ..RuntimeConfig::default()
    };
    (VM::with_config(config, Box::new(capture.clone())), capture)
}

fn snapshot_scripts() -> Vec<PathBuf> {
    let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("snapshots").join("basic");
    let mut scripts: Vec<PathBuf> = fs::read_dir(&dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "cs"))
        .collect();
    scripts.sort();
    scripts
}

#[test]
fn test_dso_output_matches_direct_execution() {
    let out_dir = tempfile::tempdir().unwrap();
    for script in snapshot_scripts() {
        let source = fs::read_to_string(&script).unwrap();
        let name = script.file_name().unwrap().to_string_lossy().into_owned();

        let (mut direct, direct_out) = captured_vm();
        direct.compile_exec(&name, &source).unwrap();

        let dso = out_dir.path().join(format!("{name}.dso"));
        compiler::compile_file(&script, &dso).unwrap();
        let (mut loaded, loaded_out) = captured_vm();
        let block = loaded.load_dso(&dso, &name).unwrap();
        loaded.run_block(block).unwrap();

        assert_eq!(loaded_out.text(), direct_out.text(), "output differs for {}", name);
        let expected = fs::read_to_string(script.with_extension("stdout")).unwrap();
        assert_eq!(loaded_out.text(), expected, "unexpected output for {}", name);
    }
}

#[test]
fn test_dso_survives_a_fresh_symbol_table() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("lib.cs");
    fs::write(&script, "function Tool::use(%n) { return \"used \" @ %n; }\n$ready = 1;\n").unwrap();
    let dso = compiler::dso_path(&script, "dso");
    compiler::compile_file(&script, &dso).unwrap();

    // A VM that already interned unrelated names gets different symbol ids.
    let (mut vm, out) = captured_vm();
    vm.eval("%unrelated = 1; $other = 2;").unwrap();
    let block = vm.load_dso(&dso, "lib.cs").unwrap();
    vm.run_block(block).unwrap();
    vm.eval("echo(Tool::use(3) SPC $ready);").unwrap();
    assert_eq!(out.text(), "used 3 1\n");
}

#[test]
fn test_exec_builtin_prefers_fresh_dso() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("mod.cs");
    fs::write(&script, "echo(\"source\");\n").unwrap();

    // A DSO compiled from different source, newer than the script.
    let other = dir.path().join("other.cs");
    fs::write(&other, "echo(\"cached\");\n").unwrap();
    compiler::compile_file(&other, &compiler::dso_path(&script, "dso")).unwrap();

    let (mut vm, out) = captured_vm();
    let path = script.to_string_lossy().replace('\\', "/");
    vm.eval(&format!("exec(\"{path}\");")).unwrap();
    assert_eq!(out.text(), "cached\n");
}

#[test]
fn test_truncated_dso_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("t.cs");
    fs::write(&script, "%a = 1;\n%b = %a + 2;\n").unwrap();
    let dso = dir.path().join("t.cs.dso");
    compiler::compile_file(&script, &dso).unwrap();

    let bytes = fs::read(&dso).unwrap();
    fs::write(&dso, &bytes[..bytes.len() / 2]).unwrap();
    let (mut vm, _) = captured_vm();
    let err = vm.load_dso(&dso, "t.cs").unwrap_err();
    assert!(matches!(err, ConsoleError::Dso(DsoError::UnexpectedEof)), "got {err}");
    assert!(vm.blocks().find("t.cs").is_none());
}

#[test]
fn test_corrupt_dso_falls_back_to_source() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("c.cs");
    fs::write(&script, "echo(\"from source\");\n").unwrap();

    // Version 1 header claiming an enormous code section.
    let mut bytes = 1u32.to_le_bytes().to_vec();
    for count in [0, 0, 0, 0, u32::MAX, 0u32] {
        bytes.extend_from_slice(&count.to_le_bytes());
    }
    let dso = dir.path().join("c.cs.dso");
    fs::write(&dso, &bytes).unwrap();

    let (mut vm, out) = captured_vm();
    let err = vm.load_dso_bytes(&bytes, "c.cs").unwrap_err();
    assert!(matches!(err, ConsoleError::Dso(DsoError::UnexpectedEof)), "got {err}");

    vm.exec_file(&script).unwrap();
    assert_eq!(out.text(), "from source\n");
}

#[test]
fn test_unknown_version_is_rejected() {
    let (mut vm, _) = captured_vm();
    let err = vm.load_dso_bytes(&[9, 0, 0, 0], "v.cs").unwrap_err();
    assert!(matches!(err, ConsoleError::Dso(DsoError::UnsupportedVersion(9))));
}

#[test]
fn test_missing_dso_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let (mut vm, _) = captured_vm();
    let err = vm.load_dso(&dir.path().join("absent.cs.dso"), "absent.cs").unwrap_err();
    assert!(matches!(err, ConsoleError::Io { .. }));
}
