use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat};
use eyre::{Context, Result};
use serde::de::DeserializeOwned;

use crate::config::models::{ApiDefinition, GatewayConfig};

/// Environment variable prefix for gateway configuration overrides,
/// e.g. `GATEHOUSE_LISTEN_ADDR` or `GATEHOUSE_LOGGING__LEVEL`.
pub const ENV_PREFIX: &str = "GATEHOUSE";

/// Determine file format based on extension
fn file_format(path: &Path) -> Option<FileFormat> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => Some(FileFormat::Yaml),
        Some("json") => Some(FileFormat::Json),
        Some("toml") => Some(FileFormat::Toml),
        _ => None,
    }
}

fn load_file<T: DeserializeOwned>(path: &Path, with_env: bool) -> Result<T> {
    let format = file_format(path).unwrap_or(FileFormat::Yaml);
    let path_str = path
        .to_str()
        .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", path.display()))?;

    let mut builder = Config::builder().add_source(File::new(path_str, format));
    if with_env {
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        );
    }

    let settings = builder
        .build()
        .with_context(|| format!("Failed to build config from {}", path.display()))?;

    settings
        .try_deserialize()
        .with_context(|| format!("Failed to deserialize config from {}", path.display()))
}

/// Load the gateway configuration, applying `GATEHOUSE_` environment overrides
pub fn load_gateway_config(path: impl AsRef<Path>) -> Result<GatewayConfig> {
    load_file(path.as_ref(), true)
}

/// Load a single API definition file
pub fn load_api_definition(path: impl AsRef<Path>) -> Result<ApiDefinition> {
    load_file(path.as_ref(), false)
}

/// Load every API definition found at `path`.
///
/// `path` is either a single definition file or a directory whose `.yaml`, `.yml`,
/// `.json` and `.toml` files each hold one definition. Results are sorted by file name
/// so deployment order is stable.
pub fn load_api_definitions(path: impl AsRef<Path>) -> Result<Vec<ApiDefinition>> {
    let path = path.as_ref();
    if path.is_file() {
        return Ok(vec![load_api_definition(path)?]);
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(path)
        .with_context(|| format!("Failed to read API directory {}", path.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && file_format(p).is_some())
        .collect();
    files.sort();

    files.iter().map(load_api_definition).collect()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::{NamedTempFile, tempdir};

    use super::*;

    const API_YAML: &str = r#"
id: orders
listeners:
  - path: /orders
flows:
  - name: add-header
    request:
      - policy: transform-headers
        configuration:
          add_headers:
            - name: X-Gateway
              value: gatehouse
endpoint_groups:
  - name: default-group
    type: http-proxy
    endpoints:
      - name: default
        configuration:
          target: http://localhost:9000
"#;

    #[test]
    fn test_load_yaml_api_definition() {
        let mut temp_file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(temp_file, "{}", API_YAML).unwrap();

        let api = load_api_definition(temp_file.path()).unwrap();
        assert_eq!(api.id, "orders");
        assert_eq!(api.flows.len(), 1);
        assert_eq!(api.flows[0].request[0].policy, "transform-headers");
    }

    #[test]
    fn test_load_json_gateway_config() {
        let json_content = r#"
{
  "listen_addr": "127.0.0.1:3000",
  "tenant": "acme",
  "request_timeout_secs": 30,
  "health_check": {
    "enabled": true,
    "interval_secs": 30
  }
}
"#;

        let mut temp_file = NamedTempFile::with_suffix(".json").unwrap();
        write!(temp_file, "{}", json_content).unwrap();

        let config = load_gateway_config(temp_file.path()).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:3000");
        assert_eq!(config.tenant.as_deref(), Some("acme"));
        assert_eq!(config.request_timeout_secs, Some(30));
        assert!(config.health_check.enabled);
        assert_eq!(config.health_check.timeout_secs, 5);
    }

    #[test]
    fn test_load_directory_skips_unknown_extensions() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("orders.yaml"), API_YAML).unwrap();
        std::fs::write(dir.path().join("README.txt"), "not a definition").unwrap();

        let apis = load_api_definitions(dir.path()).unwrap();
        assert_eq!(apis.len(), 1);
        assert_eq!(apis[0].id, "orders");
    }
}
