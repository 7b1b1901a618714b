use std::io::Write;
use std::time::Duration;

use sjtagent_core::config::{AppConfig, BatchErrorPolicy};
use sjtagent_core::error::SjtError;

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(content.as_bytes()).expect("write toml");
    tmp
}

#[test]
fn test_load_full_config_from_file() {
    let tmp = write_config(
        r#"
[model]
provider = "deepseek"
model_id = "deepseek-chat"
api_key = "sk-test-key"
max_tokens = 2048
temperature = 0.2

[engine]
max_steps = 6
per_step_timeout_secs = 45
retry_ceiling = 4
on_batch_error = "fail-fast"

[engine.step_limits]
revise = 2

[generation]
max_revisions = 3
population_profile = "nursing staff"
language = "zh"

[evaluation]
batch_size = 25
max_concurrent = 8

[[evaluation.dimensions]]
name = "Realism"
description = "Which item is more realistic for {trait}"

[evaluation.cost]
input_token_rate = 1.0
output_token_rate = 4.0
"#,
    );

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.model.provider, "deepseek");
    assert_eq!(config.model.model_id, "deepseek-chat");
    assert_eq!(config.model.api_key, Some("sk-test-key".to_string()));
    assert_eq!(config.model.max_tokens, 2048);

    let run = config.engine.run_config();
    assert_eq!(run.max_steps, 6);
    assert_eq!(run.per_step_timeout, Duration::from_secs(45));
    assert_eq!(run.retry_ceiling, 4);
    assert_eq!(run.on_batch_error, BatchErrorPolicy::FailFast);
    assert_eq!(config.engine.step_limits.get("revise"), Some(&2));

    assert_eq!(config.generation.max_revisions, 3);
    assert_eq!(config.generation.language, "zh");

    assert_eq!(config.evaluation.batch_size, 25);
    assert_eq!(config.evaluation.max_concurrent, 8);
    assert_eq!(config.evaluation.dimensions.len(), 1);
    assert_eq!(config.evaluation.dimensions[0].name, "Realism");
    assert_eq!(config.evaluation.cost.output_token_rate, 4.0);
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("SJTAGENT_TEST_API_KEY", "expanded-key-value");

    let tmp = write_config(
        r#"
[model]
model_id = "test-model"
api_key = "${SJTAGENT_TEST_API_KEY}"
"#,
    );

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.model.api_key, Some("expanded-key-value".to_string()));

    std::env::remove_var("SJTAGENT_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let tmp = write_config(
        r#"
[model]
model_id = "gpt-4o-mini"
"#,
    );

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.model.provider, "openai");
    assert_eq!(config.engine.max_steps, 10);
    assert_eq!(config.engine.per_step_timeout_secs, 120);
    assert_eq!(config.engine.retry_ceiling, 3);
    assert_eq!(config.engine.on_batch_error, BatchErrorPolicy::SkipAndContinue);
    assert!(config.engine.step_limits.is_empty());
    assert_eq!(config.generation.max_revisions, 2);
    assert_eq!(config.evaluation.batch_size, 10);
    assert!(config.evaluation.dimensions.is_empty());
}

#[test]
fn test_missing_file_reports_path() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("absent.toml");

    let err = AppConfig::load(&path).unwrap_err();
    assert!(matches!(err, SjtError::ConfigNotFound(ref p) if p.ends_with("absent.toml")));
}

#[test]
fn test_zero_retry_ceiling_rejected() {
    let tmp = write_config(
        r#"
[model]
model_id = "gpt-4o-mini"

[engine]
retry_ceiling = 0
"#,
    );

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, SjtError::Config(ref m) if m.contains("retry_ceiling")));
}

#[test]
fn test_missing_model_section_rejected() {
    let tmp = write_config("[engine]\nmax_steps = 4\n");
    assert!(matches!(AppConfig::load(tmp.path()), Err(SjtError::Config(_))));
}
