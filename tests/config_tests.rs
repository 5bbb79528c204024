//! Configuration loading tests

use std::fs;

use cil_analysis::{AnalyzerConfig, UnknownPolicy};

#[test]
fn load_config_from_file() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("analyzer.toml");
    fs::write(
        &path,
        r#"
            [lifter]
            unknown_opcodes = "Error"
            use_source_local_names = false

            [engine]
            devirtualize = true
            analyze_constructors = false
        "#,
    )?;

    let config = AnalyzerConfig::load_from_file(&path)?;
    assert_eq!(config.lifter.unknown_opcodes, UnknownPolicy::Error);
    assert!(!config.lifter.use_source_local_names);
    assert!(config.engine.devirtualize);
    assert!(!config.engine.analyze_constructors);
    Ok(())
}

#[test]
fn missing_config_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");
    assert!(AnalyzerConfig::load_from_file(&path).is_err());
}
