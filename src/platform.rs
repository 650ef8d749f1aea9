use std::io;
use std::path::Path;

/// GNU make is installed as `gmake` on the BSDs; cmus' Makefile needs it.
pub fn default_make_program() -> &'static str {
    match std::env::consts::OS {
        "freebsd" | "openbsd" | "netbsd" | "dragonfly" => "gmake",
        _ => "make",
    }
}

/// Mark a file rwxr-xr-x. A no-op where the platform has no exec bit.
#[cfg(unix)]
pub fn set_executable(path: &Path) -> io::Result<()> {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o755);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
pub fn set_executable(path: &Path) -> io::Result<()> {
    std::fs::metadata(path).map(|_| ())
}

#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> bool {
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    path.is_file() && matches!(ext.to_lowercase().as_str(), "exe" | "cmd" | "bat")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_make_program() {
        let make = default_make_program();
        assert!(make == "make" || make == "gmake");
    }

    #[cfg(unix)]
    #[test]
    fn test_set_executable() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("configure");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();
        assert!(!is_executable(&script));

        set_executable(&script).unwrap();
        assert!(is_executable(&script));
    }
}
