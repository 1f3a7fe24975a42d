use std::fs;
use std::path::Path;
use std::process::Command;

/// Run a .bas file with the cyberbasic CLI and return (stdout, stderr, exit_code)
fn run_cyberbasic_file(path: &Path, extra_args: &[String]) -> (String, String, i32) {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_cyberbasic"));
    cmd.arg("run");
    cmd.arg(path);
    for arg in extra_args {
        cmd.arg(arg);
    }

    let output = cmd.output().expect("failed to execute cyberbasic");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let exit_code = output.status.code().unwrap_or(-1);

    (stdout, stderr, exit_code)
}

/// Run a single snapshot test against its sibling .stdout/.stderr/.exitcode files
fn run_snapshot_test(test_path: &Path) {
    let base_path = test_path.with_extension("");

    // Check for .args file with extra CLI arguments
    let mut extra_args = Vec::new();
    let args_path = base_path.with_extension("args");
    if args_path.exists() {
        let args_content = fs::read_to_string(&args_path)
            .unwrap_or_else(|e| panic!("Failed to read {:?}: {}", args_path, e));
        for arg in args_content.lines() {
            let arg = arg.trim();
            if !arg.is_empty() && !arg.starts_with('#') {
                extra_args.push(arg.to_string());
            }
        }
    }

    let (actual_stdout, actual_stderr, actual_exitcode) =
        run_cyberbasic_file(test_path, &extra_args);

    // Check stdout (exact match)
    let stdout_path = base_path.with_extension("stdout");
    if stdout_path.exists() {
        let expected_stdout = fs::read_to_string(&stdout_path)
            .unwrap_or_else(|e| panic!("Failed to read {:?}: {}", stdout_path, e));
        assert_eq!(
            actual_stdout, expected_stdout,
            "stdout mismatch for {:?}\n--- expected ---\n{}\n--- actual ---\n{}",
            test_path, expected_stdout, actual_stdout
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
            test_path, expected_stderr, actual_stderr
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

/// Discover and run all .bas tests in a directory
fn run_snapshot_dir(dir: &str) {
    let dir_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("snapshots")
        .join(dir);

    if !dir_path.exists() {
        return;
    }

    let mut entries: Vec<_> = fs::read_dir(&dir_path)
        .unwrap_or_else(|e| panic!("Failed to read {:?}: {}", dir_path, e))
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "bas"))
        .collect();
    entries.sort();

    for path in entries {
        run_snapshot_test(&path);
    }
}

#[test]
fn snapshot_basic() {
    run_snapshot_dir("basic");
}

#[test]
fn snapshot_coroutines() {
    run_snapshot_dir("coroutines");
}

#[test]
fn snapshot_errors() {
    run_snapshot_dir("errors");
}
