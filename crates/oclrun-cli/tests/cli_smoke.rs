use assert_cmd::Command;
use predicates::prelude::*;

fn oclrun() -> Command {
    Command::cargo_bin("oclrun").unwrap()
}

#[test]
fn help_works() {
    oclrun().arg("--help").assert().success();
}

#[test]
fn version_works() {
    oclrun().arg("--version").assert().success();
}

#[test]
fn help_mentions_core_flags() {
    let out = oclrun().arg("--help").assert().success().get_output().stdout.clone();
    let s = String::from_utf8(out).unwrap();
    for needle in ["--local-size", "--entry", "--kernel", "--platform", "--device-class"] {
        assert!(s.contains(needle), "help missing `{needle}`");
    }
}

#[test]
fn default_run_passes() {
    oclrun()
        .arg("--no-color")
        .assert()
        .success()
        .stdout(predicate::str::contains("PASSED"))
        .stderr(predicate::str::contains("create context"));
}

#[test]
fn status_lines_cover_release_phase() {
    let out = oclrun().arg("--no-color").assert().success().get_output().stderr.clone();
    let s = String::from_utf8(out).unwrap();
    for needle in ["release kernel", "release program", "release queue", "release context"] {
        assert!(s.contains(needle), "status output missing `{needle}`:\n{s}");
    }
}

#[test]
fn indivisible_local_size_fails() {
    oclrun()
        .args(["--no-color", "--local-size", "7"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("FAILED"))
        .stdout(predicate::str::contains("dispatch"));
}

#[test]
fn zero_elements_fail_with_allocation_error() {
    oclrun()
        .args(["--no-color", "-n", "0"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("allocation"));
}

#[test]
fn json_report_is_well_formed() {
    let out = oclrun()
        .args(["--format", "json", "--no-color", "-n", "128", "--local-size", "32"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(value["passed"], true);
    assert_eq!(value["element_count"], 128);
    assert_eq!(value["report"]["final_stage"], "Released");
    assert!(value["report"]["steps"].as_array().unwrap().len() > 10);
}

#[test]
fn kernel_file_with_other_entry_runs() {
    use std::io::Write;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let source = "\n__kernel void vector_sub(\n    __global const int* a,\n    __global const int* b,\n    __global int*       out)\n{\n    const uint gid = get_global_id(0);\n    out[gid] = a[gid] - b[gid];\n}\n";
    file.write_all(source.as_bytes()).unwrap();

    // A[i] == B[i], so vector_sub yields all zeros and verifies clean.
    oclrun()
        .args(["--no-color", "--entry", "vector_sub"])
        .arg("--kernel")
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("PASSED"));
}

#[test]
fn missing_entry_point_reports_symbol_failure() {
    use std::io::Write;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"__kernel void vector_sub(__global const int* a, __global const int* b, __global int* out) { out[get_global_id(0)] = a[get_global_id(0)] - b[get_global_id(0)]; }")
        .unwrap();

    oclrun()
        .args(["--no-color", "--entry", "vector_add"])
        .arg("--kernel")
        .arg(file.path())
        .assert()
        .failure()
        .stdout(predicate::str::contains("entry point 'vector_add' not found"));
}

#[test]
fn missing_kernel_file_is_an_error() {
    oclrun()
        .args(["--kernel", "/no/such/file.cl"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read kernel source"));
}

#[cfg(not(feature = "opencl"))]
#[test]
fn opencl_backend_unavailable_without_feature() {
    oclrun()
        .args(["--backend", "opencl"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("opencl"));
}

#[test]
fn continue_on_error_still_fails_exit_code() {
    oclrun()
        .args(["--no-color", "--local-size", "7", "--continue-on-error"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("FAILED"));
}
