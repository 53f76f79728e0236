//! Ensures all workspace crates use `version.workspace = true` and that
//! the workspace version matches what Cargo compiled this crate with.

use std::path::{Path, PathBuf};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .and_then(Path::parent)
        .expect("crate lives two levels below the workspace root")
        .to_path_buf()
}

fn manifest(dir: &Path) -> toml::Value {
    let text = std::fs::read_to_string(dir.join("Cargo.toml")).unwrap();
    text.parse().unwrap()
}

fn workspace_version() -> String {
    manifest(&workspace_root())["workspace"]["package"]["version"]
        .as_str()
        .unwrap()
        .to_string()
}

/// `"workspace"` when the crate inherits its version, else the literal.
fn crate_version(manifest_dir: &Path) -> String {
    let doc = manifest(manifest_dir);
    let version = doc
        .get("package")
        .and_then(|pkg| pkg.get("version"))
        .unwrap_or_else(|| panic!("no package.version in {}", manifest_dir.display()));

    if let Some(table) = version.as_table() {
        if table.get("workspace").and_then(|v| v.as_bool()) == Some(true) {
            return "workspace".to_string();
        }
    }
    version
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| panic!("unreadable version in {}", manifest_dir.display()))
}

#[test]
fn all_crates_use_workspace_version() {
    let root = workspace_root();
    let members = manifest(&root)["workspace"]["members"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m.as_str().unwrap().to_string())
        .collect::<Vec<_>>();

    for krate in ["crates/triage-core", "crates/triage-cli", "crates/cluster-probe"] {
        assert!(members.iter().any(|m| m == krate), "{krate} not a member");
        let version = crate_version(&root.join(krate));
        assert_eq!(
            version, "workspace",
            "{krate} should use version.workspace = true, got version = {version:?}"
        );
    }
}

#[test]
fn workspace_version_matches_cargo_pkg() {
    assert_eq!(workspace_version(), env!("CARGO_PKG_VERSION"));
    assert_eq!(triage_core::VERSION, env!("CARGO_PKG_VERSION"));
}
