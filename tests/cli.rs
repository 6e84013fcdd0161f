use std::io::Write;
use std::process::Command;

const PROGRAM: &str = r#"
[compiler]
yieldpoints = true

[[class]]
name = "demo/Main"
initialized = true

[[class.method]]
name = "add"
descriptor = "(II)I"
static = true
max_locals = 2
code = [{ iload = 0 }, { iload = 1 }, "iadd", "ireturn"]

[[class.method]]
name = "big"
descriptor = "(J)J"
static = true
max_locals = 2
code = [{ lload = 0 }, { lconst = 1 }, "ladd", "lreturn"]

[[class.method]]
name = "crash"
descriptor = "()I"
static = true
code = [{ iconst = 1 }, { iconst = 0 }, "idiv", "ireturn"]
"#;

fn program_file(source: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(source.as_bytes()).unwrap();
    file
}

fn bcx86(args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_bcx86"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to execute bcx86");
    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

#[test]
fn test_compile_listing() {
    let file = program_file(PROGRAM);
    let path = file.path().to_str().unwrap();
    let (stdout, stderr, success) = bcx86(&["compile", path, "--method", "demo/Main.add(II)I"]);
    assert!(success, "stderr:\n{}", stderr);
    assert!(stdout.starts_with("; demo/Main.add(II)I\n"), "{}", stdout);
    assert!(stdout.contains("push ebp"), "{}", stdout);
    assert!(!stdout.contains("demo/Main.big"));
}

#[test]
fn test_compile_hex_and_map() {
    let file = program_file(PROGRAM);
    let path = file.path().to_str().unwrap();

    let (stdout, _, success) = bcx86(&["compile", path, "--format", "hex"]);
    assert!(success);
    assert_eq!(stdout.lines().count(), 3);
    let add = stdout
        .lines()
        .find(|l| l.starts_with("demo/Main.add(II)I: "))
        .unwrap();
    // push ebp; mov ebp, esp
    assert!(add.contains("55 89 e5"), "{}", add);

    let (stdout, _, success) = bcx86(&["compile", path, "--format", "map", "--method", "demo/Main.add(II)I"]);
    assert!(success);
    let json: serde_json::Value = serde_json::from_str(stdout.trim()).unwrap();
    assert_eq!(json["method"], "demo/Main.add(II)I");
    assert_eq!(json["arg_slots"], 2);
    let map = json["address_map"].as_array().unwrap();
    assert_eq!(map.len(), 4);
    assert_eq!(map[0]["bytecode"], 0);
}

#[test]
fn test_run_prints_result() {
    let file = program_file(PROGRAM);
    let path = file.path().to_str().unwrap();
    let (stdout, stderr, success) = bcx86(&["run", path, "--entry", "demo/Main.add(II)I", "40", "-2"]);
    assert!(success, "stderr:\n{}", stderr);
    assert_eq!(stdout, "38\n");

    let (stdout, _, success) = bcx86(&["run", path, "--entry", "demo/Main.big(J)J", "4294967295"]);
    assert!(success);
    assert_eq!(stdout, "4294967296\n");
}

#[test]
fn test_run_reports_fault() {
    let file = program_file(PROGRAM);
    let path = file.path().to_str().unwrap();
    let (_, stderr, success) = bcx86(&["run", path, "--entry", "demo/Main.crash()I"]);
    assert!(!success);
    assert!(stderr.contains("division by zero"), "{}", stderr);
}

#[test]
fn test_errors_exit_nonzero() {
    let (_, stderr, success) = bcx86(&["compile", "/nonexistent/program.toml"]);
    assert!(!success);
    assert!(stderr.contains("failed to read"), "{}", stderr);

    let file = program_file(PROGRAM);
    let path = file.path().to_str().unwrap();
    let (_, stderr, success) = bcx86(&["run", path, "--entry", "demo/Main.add(II)I", "x", "1"]);
    assert!(!success);
    assert!(stderr.contains("bad argument"), "{}", stderr);

    let (_, stderr, success) = bcx86(&["compile", path, "--method", "demo/Main.nope()V"]);
    assert!(!success);
    assert!(stderr.contains("no method"), "{}", stderr);
}
