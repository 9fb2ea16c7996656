//! Worker token resolution.
//!
//! Tokens can come from three places, checked in order:
//!
//! 1. **Direct value** in the config file (`token`)
//! 2. **File reference**, e.g. a mounted secret (`token_file: /run/secrets/ocr-token`)
//! 3. **Env var reference** (`token_env: ARKFLOW_OCR_TOKEN`)

use secrecy::SecretString;

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("No secret source provided (need one of: direct value, file path, or env var name)")]
    NoSourceProvided,

    #[error("Failed to read secret from file '{path}': {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Environment variable '{name}' not set")]
    EnvVarNotSet { name: String },

    #[error("Environment variable '{name}' contains invalid UTF-8")]
    EnvVarNotUnicode { name: String },

    #[error("Secret from {origin} is empty")]
    Empty { origin: String },
}

/// Resolves a secret from the first non-empty source. File and env
/// values are trimmed.
pub fn resolve_secret(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<SecretString, SecretError> {
    if let Some(value) = direct.filter(|v| !v.is_empty()) {
        return Ok(SecretString::from(value.to_string()));
    }

    if let Some(path) = file_path.filter(|p| !p.is_empty()) {
        let expanded = expand_home(path);
        let content = std::fs::read_to_string(&expanded).map_err(|e| SecretError::FileRead {
            path: expanded.clone(),
            source: e,
        })?;
        return non_empty(content.trim(), || format!("file '{}'", expanded));
    }

    if let Some(name) = env_var.filter(|n| !n.is_empty()) {
        return match std::env::var(name) {
            Ok(value) => non_empty(value.trim(), || format!("env var '{}'", name)),
            Err(std::env::VarError::NotPresent) => Err(SecretError::EnvVarNotSet {
                name: name.to_string(),
            }),
            Err(std::env::VarError::NotUnicode(_)) => Err(SecretError::EnvVarNotUnicode {
                name: name.to_string(),
            }),
        };
    }

    Err(SecretError::NoSourceProvided)
}

/// Like `resolve_secret`, but no configured source means `None`.
pub fn resolve_secret_optional(
    direct: Option<&str>,
    file_path: Option<&str>,
    env_var: Option<&str>,
) -> Result<Option<SecretString>, SecretError> {
    match resolve_secret(direct, file_path, env_var) {
        Ok(secret) => Ok(Some(secret)),
        Err(SecretError::NoSourceProvided) => Ok(None),
        Err(e) => Err(e),
    }
}

fn non_empty(value: &str, origin: impl FnOnce() -> String) -> Result<SecretString, SecretError> {
    if value.is_empty() {
        Err(SecretError::Empty { origin: origin() })
    } else {
        Ok(SecretString::from(value.to_string()))
    }
}

/// Expands a leading `~` or `~/` to the home directory.
fn expand_home(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.to_string_lossy(), 1);
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    #[serial]
    fn test_direct_token_wins() {
        std::env::set_var("ARKFLOW_TEST_TOKEN_1", "from-env");
        let token = resolve_secret(Some("inline"), None, Some("ARKFLOW_TEST_TOKEN_1")).unwrap();
        assert_eq!(token.expose_secret(), "inline");
        std::env::remove_var("ARKFLOW_TEST_TOKEN_1");
    }

    #[test]
    #[serial]
    fn test_token_file_before_env() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "  from-file  ").unwrap();
        std::env::set_var("ARKFLOW_TEST_TOKEN_2", "from-env");

        let token = resolve_secret(
            Some(""),
            Some(file.path().to_str().unwrap()),
            Some("ARKFLOW_TEST_TOKEN_2"),
        )
        .unwrap();
        assert_eq!(token.expose_secret(), "from-file");
        std::env::remove_var("ARKFLOW_TEST_TOKEN_2");
    }

    #[test]
    #[serial]
    fn test_env_fallback_and_empty_env() {
        std::env::set_var("ARKFLOW_TEST_TOKEN_3", "from-env\n");
        let token = resolve_secret(None, None, Some("ARKFLOW_TEST_TOKEN_3")).unwrap();
        assert_eq!(token.expose_secret(), "from-env");

        std::env::set_var("ARKFLOW_TEST_TOKEN_3", "   ");
        assert!(matches!(
            resolve_secret(None, None, Some("ARKFLOW_TEST_TOKEN_3")),
            Err(SecretError::Empty { .. })
        ));
        std::env::remove_var("ARKFLOW_TEST_TOKEN_3");
    }

    #[test]
    fn test_missing_sources() {
        assert!(matches!(
            resolve_secret(None, None, None),
            Err(SecretError::NoSourceProvided)
        ));
        assert!(resolve_secret_optional(None, Some(""), None).unwrap().is_none());
        assert!(matches!(
            resolve_secret(None, Some("/nonexistent/arkflow/token"), None),
            Err(SecretError::FileRead { .. })
        ));
        assert!(matches!(
            resolve_secret_optional(None, None, Some("ARKFLOW_DEFINITELY_UNSET_9876")),
            Err(SecretError::EnvVarNotSet { .. })
        ));
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/run/secrets/token"), "/run/secrets/token");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                expand_home("~/token"),
                format!("{}/token", home.to_string_lossy())
            );
        }
    }
}
