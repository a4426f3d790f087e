use super::types::*;
use crate::config::{env_var_pattern, expand_env_vars, expand_tilde};
use crate::source::op::Namespace;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml_string = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    let mut config = parse_config(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })?;

    expand_paths(&mut config);
    validate_config(&config)?;

    Ok(config)
}

/// Parse a YAML document after `$env{VAR}` expansion. Does not validate.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml_string = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml_string)?;

    // An empty file is the all-defaults config.
    if yaml_string.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(serde_yaml::from_str(&yaml_string)?)
}

/// Checks for unexpanded environment variables and returns a helpful error
fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let mut unexpanded_vars: Vec<String> = env_var_pattern()
        .captures_iter(yaml_string)
        .map(|cap| cap[1].to_string())
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort();
    unexpanded_vars.dedup();

    let error_msg = if unexpanded_vars.len() == 1 {
        format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with an actual value",
            unexpanded_vars[0]
        )
    } else {
        format!(
            "Environment variables are not set: {}\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variables\n\
             2. Replace the variables in the config file with actual values",
            unexpanded_vars.join(", ")
        )
    };

    Err(ConfigError::Validation(error_msg))
}

fn expand_paths(config: &mut Config) {
    config.store.path = expand_tilde(&config.store.path);
    config.checkpoint.path = expand_tilde(&config.checkpoint.path);
}

/// Check everything a session needs before it spawns any task. All problems
/// are reported together.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.workers == 0 {
        errors.push("workers must be at least 1".to_string());
    }
    if config.channel_size == 0 {
        errors.push("channel_size must be at least 1".to_string());
    }
    if config.buffer.size == 0 {
        errors.push("buffer.size must be at least 1".to_string());
    }
    if config.buffer.max_latency.is_zero() {
        errors.push("buffer.max_latency must be greater than zero".to_string());
    }

    for (list, patterns) in [
        ("filter.include", &config.filter.include),
        ("filter.exclude", &config.filter.exclude),
    ] {
        for pattern in patterns {
            if let Err(e) = Regex::new(pattern) {
                errors.push(format!("{}: invalid pattern '{}': {}", list, pattern, e));
            }
        }
    }

    let direct = &config.direct_read;
    if !direct.namespaces.is_empty() {
        if direct.readers_per_collection == 0 {
            errors.push("direct_read.readers_per_collection must be at least 1".to_string());
        }
        if direct.batch_size == 0 {
            errors.push("direct_read.batch_size must be at least 1".to_string());
        }
    }
    let mut seen = HashSet::new();
    for ns in &direct.namespaces {
        match ns.parse::<Namespace>() {
            Ok(parsed) => {
                if !seen.insert(parsed) {
                    errors.push(format!(
                        "direct_read.namespaces: '{}' is listed more than once",
                        ns
                    ));
                }
            }
            Err(e) => errors.push(format!("direct_read.namespaces: {}", e)),
        }
    }

    if config.checkpoint.enabled && config.checkpoint.interval.is_zero() {
        errors.push("checkpoint.interval must be greater than zero".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}
