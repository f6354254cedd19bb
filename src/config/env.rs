use crate::utils::error::{OrchError, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;

/// 一次解析產生的組態快照，之後唯讀
///
/// 來源優先序：程序環境 > env 檔。內部用 BTreeMap 讓迭代順序
/// （日誌、報告）可重現。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    values: BTreeMap<String, String>,
}

impl ResolvedConfig {
    /// 合併 env 檔與程序環境並驗證必要鍵
    ///
    /// env 檔為可選；同鍵以程序環境為準。任何 `required_keys`
    /// 在合併結果中缺席即為終止性錯誤。不寫入程序環境。
    pub fn resolve(
        env_file: Option<&Path>,
        process_env: &HashMap<String, String>,
        required_keys: &[String],
    ) -> Result<Self> {
        let mut values = BTreeMap::new();

        if let Some(path) = env_file {
            let content = std::fs::read_to_string(path).map_err(OrchError::IoError)?;
            for (key, value) in parse_env_file(&content)? {
                values.insert(key, value);
            }
        }

        for (key, value) in process_env {
            values.insert(key.clone(), value.clone());
        }

        for key in required_keys {
            if !values.contains_key(key) {
                return Err(OrchError::MissingConfigError { key: key.clone() });
            }
        }

        Ok(Self { values })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key).ok_or_else(|| OrchError::MissingConfigError {
            key: key.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// 將字串中的 `${KEY}` 以快照值替換；未知鍵保留原樣，
    /// 讓錯誤在驗證時浮現而不是變成空字串
    pub fn render(&self, template: &str) -> String {
        let re = Regex::new(r"\$\{([^}]+)\}").unwrap();
        re.replace_all(template, |caps: &regex::Captures| {
            let key = &caps[1];
            self.values
                .get(key)
                .cloned()
                .unwrap_or_else(|| format!("${{{}}}", key))
        })
        .to_string()
    }

    /// 渲染一個服務的 env 映射，啟動時注入
    pub fn render_env(&self, env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        env.iter()
            .map(|(k, v)| (k.clone(), self.render(v)))
            .collect()
    }
}

/// 解析 env 檔：每行 `KEY=VALUE`，`#` 開頭與空白行忽略，不處理引號
fn parse_env_file(content: &str) -> Result<Vec<(String, String)>> {
    let mut pairs = Vec::new();

    for (lineno, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match line.split_once('=') {
            Some((key, value)) => {
                let key = key.trim();
                if key.is_empty() {
                    return Err(OrchError::ConfigValidationError {
                        field: "env_file".to_string(),
                        message: format!("Line {}: empty key", lineno + 1),
                    });
                }
                pairs.push((key.to_string(), value.trim().to_string()));
            }
            None => {
                return Err(OrchError::ConfigValidationError {
                    field: "env_file".to_string(),
                    message: format!("Line {}: expected KEY=VALUE, got '{}'", lineno + 1, line),
                });
            }
        }
    }

    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env_of(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_process_env_overrides_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "# database settings").unwrap();
        writeln!(file, "POSTGRES_HOST=db").unwrap();
        writeln!(file, "POSTGRES_PORT=5432").unwrap();
        writeln!(file).unwrap();

        let process_env = env_of(&[("POSTGRES_HOST", "localhost")]);
        let config = ResolvedConfig::resolve(
            Some(file.path()),
            &process_env,
            &["POSTGRES_HOST".to_string()],
        )
        .unwrap();

        assert_eq!(config.get("POSTGRES_HOST"), Some("localhost"));
        assert_eq!(config.get("POSTGRES_PORT"), Some("5432"));
    }

    #[test]
    fn test_missing_required_key_is_terminal() {
        let process_env = env_of(&[("POSTGRES_HOST", "db")]);
        let err = ResolvedConfig::resolve(
            None,
            &process_env,
            &["POSTGRES_HOST".to_string(), "POSTGRES_PASSWORD".to_string()],
        )
        .unwrap_err();

        match err {
            OrchError::MissingConfigError { key } => assert_eq!(key, "POSTGRES_PASSWORD"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "A=1").unwrap();
        writeln!(file, "B=2").unwrap();

        let process_env = env_of(&[("B", "3")]);
        let first =
            ResolvedConfig::resolve(Some(file.path()), &process_env, &[]).unwrap();
        let second =
            ResolvedConfig::resolve(Some(file.path()), &process_env, &[]).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_malformed_line_is_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "JUST_A_WORD").unwrap();

        let err = ResolvedConfig::resolve(Some(file.path()), &HashMap::new(), &[]).unwrap_err();
        assert!(matches!(err, OrchError::ConfigValidationError { .. }));
    }

    #[test]
    fn test_render_substitutes_known_keys_only() {
        let process_env = env_of(&[("POSTGRES_HOST", "localhost"), ("POSTGRES_PORT", "5432")]);
        let config = ResolvedConfig::resolve(None, &process_env, &[]).unwrap();

        assert_eq!(
            config.render("postgres://${POSTGRES_HOST}:${POSTGRES_PORT}/app"),
            "postgres://localhost:5432/app"
        );
        assert_eq!(config.render("${UNKNOWN_KEY}"), "${UNKNOWN_KEY}");
    }

    #[test]
    fn test_render_env_map() {
        let process_env = env_of(&[("POSTGRES_HOST", "db")]);
        let config = ResolvedConfig::resolve(None, &process_env, &[]).unwrap();

        let mut service_env = BTreeMap::new();
        service_env.insert("DB_HOST".to_string(), "${POSTGRES_HOST}".to_string());
        service_env.insert("DB_NAME".to_string(), "app".to_string());

        let rendered = config.render_env(&service_env);
        assert_eq!(rendered.get("DB_HOST").unwrap(), "db");
        assert_eq!(rendered.get("DB_NAME").unwrap(), "app");
    }
}
