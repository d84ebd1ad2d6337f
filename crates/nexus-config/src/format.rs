//! Parsing and rendering of configuration payloads

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;

use crate::error::{ConfigError, ConfigResult};
use crate::types::ConfigFormat;

/// Parse a configuration payload into a typed value
pub fn parse_config<T: DeserializeOwned>(content: &str, format: ConfigFormat) -> ConfigResult<T> {
    match format {
        ConfigFormat::Yaml => Ok(serde_yaml::from_str(content)?),
        ConfigFormat::Json => Ok(serde_json::from_str(content)?),
        ConfigFormat::Toml => {
            toml::from_str(content).map_err(|e| ConfigError::Format(e.to_string()))
        }
        ConfigFormat::Properties => parse_properties(content),
    }
}

/// Render a value into a configuration payload
pub fn format_config<T: Serialize>(value: &T, format: ConfigFormat) -> ConfigResult<String> {
    match format {
        ConfigFormat::Yaml => Ok(serde_yaml::to_string(value)?),
        ConfigFormat::Json => Ok(serde_json::to_string_pretty(value)?),
        ConfigFormat::Toml => {
            toml::to_string(value).map_err(|e| ConfigError::Format(e.to_string()))
        }
        ConfigFormat::Properties => format_properties(value),
    }
}

/// Parse `key=value` lines; blank lines and `#` comments are skipped
fn parse_properties<T: DeserializeOwned>(content: &str) -> ConfigResult<T> {
    let mut props: HashMap<String, String> = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        props.insert(key.trim().to_string(), value.trim().to_string());
    }

    let json = serde_json::to_value(props)?;
    Ok(serde_json::from_value(json)?)
}

fn format_properties<T: Serialize>(value: &T) -> ConfigResult<String> {
    let props: HashMap<String, serde_json::Value> =
        serde_json::from_value(serde_json::to_value(value)?)?;

    let mut lines: Vec<String> = props
        .into_iter()
        .map(|(key, value)| match value {
            serde_json::Value::String(s) => format!("{}={}", key, s),
            other => format!("{}={}", key, other),
        })
        .collect();
    lines.sort();
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Deserialize, Serialize)]
    struct Sample {
        host: String,
        port: String,
    }

    #[test]
    fn parses_yaml_and_json() {
        let from_yaml: Sample =
            parse_config("host: localhost\nport: \"8080\"\n", ConfigFormat::Yaml).unwrap();
        let from_json: Sample = parse_config(
            r#"{"host":"localhost","port":"8080"}"#,
            ConfigFormat::Json,
        )
        .unwrap();
        assert_eq!(from_yaml, from_json);
    }

    #[test]
    fn parses_properties_with_comments() {
        let content = "# listen address\nhost = localhost\n\nport=8080\nbroken line\n";
        let parsed: Sample = parse_config(content, ConfigFormat::Properties).unwrap();
        assert_eq!(parsed.host, "localhost");
        assert_eq!(parsed.port, "8080");
    }

    #[test]
    fn formats_properties() {
        let sample = Sample {
            host: "localhost".to_string(),
            port: "8080".to_string(),
        };
        let rendered = format_config(&sample, ConfigFormat::Properties).unwrap();
        assert_eq!(rendered, "host=localhost\nport=8080");
    }
}
