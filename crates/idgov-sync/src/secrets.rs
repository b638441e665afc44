//! Named secret lookup. Source credentials and per-brand base URLs come from here.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde_json::Value as JsonValue;
use thiserror::Error;

pub const ENV_PREFIX: &str = "IDGOV_SECRET_";

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret `{0}` is not configured")]
    Missing(String),
    #[error("reading settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("settings file {path} is not a flat JSON object: {reason}")]
    Parse { path: PathBuf, reason: String },
}

pub trait SecretProvider: Send + Sync {
    fn get_secret(&self, name: &str) -> Result<String, SecretError>;
}

/// `helpdesk-it-api-key` is read from `IDGOV_SECRET_HELPDESK_IT_API_KEY`.
pub fn env_name(name: &str) -> String {
    let mut key = String::from(ENV_PREFIX);
    key.extend(name.chars().map(|c| match c {
        'a'..='z' => c.to_ascii_uppercase(),
        'A'..='Z' | '0'..='9' => c,
        _ => '_',
    }));
    key
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecrets;

impl SecretProvider for EnvSecrets {
    fn get_secret(&self, name: &str) -> Result<String, SecretError> {
        std::env::var(env_name(name)).map_err(|_| SecretError::Missing(name.to_string()))
    }
}

/// Secrets from a flat `{"name": "value"}` JSON document.
#[derive(Clone, Default)]
pub struct JsonFileSecrets {
    values: BTreeMap<String, String>,
}

impl fmt::Debug for JsonFileSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonFileSecrets")
            .field("names", &self.values.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl JsonFileSecrets {
    pub fn load(path: &Path) -> Result<Self, SecretError> {
        let text = std::fs::read_to_string(path).map_err(|source| SecretError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let parse_error = |reason: String| SecretError::Parse {
            path: path.to_path_buf(),
            reason,
        };
        let document: JsonValue = serde_json::from_str(&text).map_err(|e| parse_error(e.to_string()))?;
        let JsonValue::Object(map) = document else {
            return Err(parse_error("top level is not an object".into()));
        };

        let mut values = BTreeMap::new();
        for (name, value) in map {
            let value = match value {
                JsonValue::String(s) => s,
                JsonValue::Number(n) => n.to_string(),
                JsonValue::Bool(b) => b.to_string(),
                other => return Err(parse_error(format!("`{name}` holds {other}"))),
            };
            values.insert(name, value);
        }
        Ok(Self { values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl SecretProvider for JsonFileSecrets {
    fn get_secret(&self, name: &str) -> Result<String, SecretError> {
        self.values
            .get(name)
            .cloned()
            .ok_or_else(|| SecretError::Missing(name.to_string()))
    }
}

/// Asks each provider in order; the first one holding the name wins.
#[derive(Default)]
pub struct LayeredSecrets {
    layers: Vec<Box<dyn SecretProvider>>,
}

impl fmt::Debug for LayeredSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayeredSecrets")
            .field("layers", &self.layers.len())
            .finish()
    }
}

impl LayeredSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_layer(mut self, provider: impl SecretProvider + 'static) -> Self {
        self.layers.push(Box::new(provider));
        self
    }

    /// Settings file first when one is configured, then the environment.
    pub fn from_settings(settings_file: Option<&Path>) -> Result<Self, SecretError> {
        let mut secrets = Self::new();
        if let Some(path) = settings_file {
            secrets = secrets.with_layer(JsonFileSecrets::load(path)?);
        }
        Ok(secrets.with_layer(EnvSecrets))
    }
}

impl SecretProvider for LayeredSecrets {
    fn get_secret(&self, name: &str) -> Result<String, SecretError> {
        for layer in &self.layers {
            match layer.get_secret(name) {
                Err(SecretError::Missing(_)) => continue,
                found => return found,
            }
        }
        Err(SecretError::Missing(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    struct Fixed(&'static str, &'static str);

    impl SecretProvider for Fixed {
        fn get_secret(&self, name: &str) -> Result<String, SecretError> {
            if name == self.0 {
                Ok(self.1.to_string())
            } else {
                Err(SecretError::Missing(name.to_string()))
            }
        }
    }

    fn settings_file(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(body.as_bytes()).expect("write settings");
        file
    }

    #[test]
    fn env_names_are_upper_snake() {
        assert_eq!(env_name("helpdesk-it-api-key"), "IDGOV_SECRET_HELPDESK_IT_API_KEY");
        assert_eq!(env_name("erp.token id"), "IDGOV_SECRET_ERP_TOKEN_ID");
    }

    #[test]
    fn settings_file_values_are_read_as_text() {
        let file = settings_file(r#"{"erp-account-id": "1234567_SB1", "retries": 3}"#);
        let secrets = JsonFileSecrets::load(file.path()).expect("load");
        assert_eq!(secrets.len(), 2);
        assert_eq!(secrets.get_secret("erp-account-id").expect("secret"), "1234567_SB1");
        assert_eq!(secrets.get_secret("retries").expect("secret"), "3");
        assert!(matches!(secrets.get_secret("nope"), Err(SecretError::Missing(_))));
    }

    #[test]
    fn nested_or_missing_settings_are_rejected() {
        let file = settings_file(r#"{"directory": {"client-id": "x"}}"#);
        assert!(matches!(
            JsonFileSecrets::load(file.path()),
            Err(SecretError::Parse { .. })
        ));
        let file = settings_file("[1, 2]");
        assert!(matches!(
            JsonFileSecrets::load(file.path()),
            Err(SecretError::Parse { .. })
        ));
        assert!(matches!(
            JsonFileSecrets::load(Path::new("/definitely/not/here.json")),
            Err(SecretError::Read { .. })
        ));
    }

    #[test]
    fn first_layer_holding_the_name_wins() {
        let file = settings_file(r#"{"training-api-key": "from-file"}"#);
        let secrets = LayeredSecrets::new()
            .with_layer(JsonFileSecrets::load(file.path()).expect("load"))
            .with_layer(Fixed("training-api-key", "from-env"))
            .with_layer(Fixed("helpdesk-it-api-key", "key-2"));

        assert_eq!(secrets.get_secret("training-api-key").expect("secret"), "from-file");
        assert_eq!(secrets.get_secret("helpdesk-it-api-key").expect("secret"), "key-2");
        assert!(matches!(
            secrets.get_secret("erp-token-id"),
            Err(SecretError::Missing(name)) if name == "erp-token-id"
        ));
    }
}
