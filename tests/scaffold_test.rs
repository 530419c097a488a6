// Integration tests for the project scaffold.

/// Verify that defaults/server.toml is valid TOML with the expected
/// sections.
#[test]
fn default_server_toml_is_valid() {
    let content = std::fs::read_to_string("defaults/server.toml")
        .expect("defaults/server.toml should exist");
    let parsed: toml::Value =
        toml::from_str(&content).expect("defaults/server.toml should be valid TOML");
    assert!(parsed.get("server").is_some());
    assert!(parsed.get("database").is_some());
    assert!(parsed.get("bidding").is_some());
}

/// Verify that all expected directories exist.
#[test]
fn directory_structure_exists() {
    let expected_dirs = ["src", "src/auction", "defaults", "tests"];
    for dir in expected_dirs {
        assert!(
            std::path::Path::new(dir).is_dir(),
            "expected directory missing: {dir}"
        );
    }
}
