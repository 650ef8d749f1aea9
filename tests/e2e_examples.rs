mod common;

use common::{CommandOutput, TestContext};

#[test]
#[cfg(feature = "e2e")]
fn e2e_copy_install_of_a_real_release() {
    let ctx = TestContext::new();
    let destination = ctx.path("cmus-src");

    // Example: cmus-installer install v2.10.0 <dir> --method copy
    let output: CommandOutput = ctx
        .cmd()
        .env("CMUS_INSTALLER_STAGING_DIR", ctx.path("staging"))
        .args(["install", "v2.10.0", "--method", "copy"])
        .arg(&destination)
        .output()
        .expect("Failed to run cmus-installer")
        .into();

    output
        .assert_success()
        .assert_stderr_contains("installed to");
    assert!(destination.join("configure").is_file());
    assert!(cmus_installer::platform::is_executable(
        &destination.join("configure")
    ));
}

#[test]
#[cfg(feature = "e2e")]
fn e2e_missing_release_is_not_found() {
    let ctx = TestContext::new();
    let destination = ctx.path("cmus");

    // Example: cmus-installer install 9.9.9 <dir> --json
    let output: CommandOutput = ctx
        .cmd()
        .args(["install", "9.9.9", "--json"])
        .arg(&destination)
        .output()
        .expect("Failed to run cmus-installer")
        .into();

    output
        .assert_failure()
        .assert_stdout_contains("\"error_kind\":\"not_found\"");
    assert!(!destination.exists());
}

#[test]
#[cfg(all(feature = "e2e", unix))]
fn e2e_build_install_of_a_real_release() {
    let ctx = TestContext::new();
    let prefix = ctx.path("prefix");

    // Needs a C toolchain and cmus's build dependencies on the host.
    let output: CommandOutput = ctx
        .cmd()
        .args(["-v", "install", "2.10.0", "--method", "build"])
        .arg(&prefix)
        .output()
        .expect("Failed to run cmus-installer")
        .into();

    output.assert_success();
    assert!(prefix.join("bin/cmus").is_file());
}
