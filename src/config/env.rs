use std::collections::BTreeMap;
use std::path::Path;

use zeroize::Zeroizing;

use super::ConfigError;

/// Where the secrets named in the config are read from.
///
/// Entries from a dotenv file shadow the process environment. A name declared
/// blank in the dotenv file is an error, never a fall-through.
#[derive(Default)]
pub struct SecretEnv {
    dotenv: BTreeMap<String, Zeroizing<String>>,
    process: bool,
}

impl std::fmt::Debug for SecretEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.dotenv.keys().map(String::as_str).collect();
        f.debug_struct("SecretEnv")
            .field("dotenv_names", &names)
            .field("process", &self.process)
            .finish()
    }
}

impl SecretEnv {
    /// Only the process environment.
    pub fn process() -> Self {
        Self {
            dotenv: BTreeMap::new(),
            process: true,
        }
    }

    /// Dotenv entries only; the process environment is never consulted.
    pub fn from_dotenv_str(contents: &str) -> Result<Self, ConfigError> {
        let mut dotenv = BTreeMap::new();
        for (idx, raw_line) in contents.lines().enumerate() {
            if let Some((name, value)) = parse_line(raw_line, idx + 1)? {
                dotenv.insert(name, value);
            }
        }
        Ok(Self {
            dotenv,
            process: false,
        })
    }

    /// Dotenv file overlaid on the process environment.
    pub fn load_dotenv(path: &Path) -> Result<Self, ConfigError> {
        let contents = Zeroizing::new(std::fs::read_to_string(path).map_err(|source| {
            ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }
        })?);
        let mut env = Self::from_dotenv_str(&contents)?;
        env.process = true;
        Ok(env)
    }

    /// Resolves a named secret, trimmed.
    pub fn secret(&self, name: &str) -> Result<Zeroizing<String>, ConfigError> {
        if let Some(value) = self.dotenv.get(name) {
            if value.trim().is_empty() {
                return Err(ConfigError::BlankEnv(name.to_string()));
            }
            return Ok(Zeroizing::new(value.trim().to_string()));
        }
        if self.process {
            if let Ok(value) = std::env::var(name) {
                let value = Zeroizing::new(value);
                if !value.trim().is_empty() {
                    return Ok(Zeroizing::new(value.trim().to_string()));
                }
            }
        }
        Err(ConfigError::MissingEnv(name.to_string()))
    }
}

fn parse_line(
    raw_line: &str,
    line: usize,
) -> Result<Option<(String, Zeroizing<String>)>, ConfigError> {
    let trimmed = raw_line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    let Some((name, value)) = trimmed.split_once('=') else {
        return Err(ConfigError::Dotenv {
            line,
            reason: "expected NAME=value".to_string(),
        });
    };
    let name = name.trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ConfigError::Dotenv {
            line,
            reason: format!("invalid variable name `{name}`"),
        });
    }

    let value = value.trim();
    let unquoted = match value.as_bytes() {
        [b'"', .., b'"'] | [b'\'', .., b'\''] => &value[1..value.len() - 1],
        _ => value,
    };
    Ok(Some((name.to_string(), Zeroizing::new(unquoted.to_string()))))
}
