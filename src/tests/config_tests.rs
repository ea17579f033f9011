use super::*;

use tempfile::tempdir;

#[test]
fn empty_document_takes_defaults() {
    let config = ProjectConfig::from_toml_str("").expect("empty config should parse");
    assert_eq!(config, ProjectConfig::default());
    assert_eq!(config.project.name, "untitled");
    assert!(config.storage.keep_backups);
    assert!(!config.graph.strict_references);
    assert_eq!(config.identity.allocator, AllocatorKind::Random);
}

#[test]
fn partial_sections_merge_with_defaults() {
    let config = ProjectConfig::from_toml_str(
        r#"
        [project]
        name = "forest"

        [identity]
        allocator = "sequential"

        [graph]
        strict_references = true
        "#,
    )
    .expect("config should parse");
    assert_eq!(config.project.name, "forest");
    assert!(config.graph.strict_references);
    assert!(config.storage.keep_backups);
    assert!(matches!(
        config.identity.allocator(),
        IdAllocator::Sequential { next: 1 }
    ));
}

#[test]
fn invalid_values_are_parse_errors() {
    let err = ProjectConfig::from_toml_str("[identity]\nallocator = \"dice\"\n")
        .expect_err("unknown allocator should fail");
    assert!(matches!(err, ConfigError::ParseError(_)));
}

#[test]
fn save_and_load_roundtrip() {
    let dir = tempdir().expect("tempdir");
    let mut config = ProjectConfig::new("roundtrip");
    config.project.description = Some("test project".to_string());
    config.storage.keep_backups = false;

    config
        .save(&dir.path().join(CONFIG_FILE_NAME))
        .expect("config save should succeed");
    let loaded = ProjectConfig::load_or_default(dir.path()).expect("config load should succeed");
    assert_eq!(loaded, config);
}

#[test]
fn missing_file_falls_back_to_defaults() {
    let dir = tempdir().expect("tempdir");
    let loaded = ProjectConfig::load_or_default(dir.path()).expect("defaults should load");
    assert_eq!(loaded, ProjectConfig::default());
    assert!(matches!(
        ProjectConfig::load(&dir.path().join("absent.toml")),
        Err(ConfigError::NotFound(_))
    ));
}

#[test]
fn schema_names_every_section() {
    let schema = serde_json::to_value(ProjectConfig::json_schema()).expect("schema should serialize");
    let properties = schema["properties"]
        .as_object()
        .expect("schema should list properties");
    for section in ["project", "identity", "graph", "storage"] {
        assert!(properties.contains_key(section), "missing section {section}");
    }
}
