//! Credential resolution
//!
//! Storage credentials can be given inline, as a path to a YAML document, or
//! as an already-open file. Documents may embed `<%= ENV['NAME'] %>` style
//! expressions, which are expanded before parsing. A document keyed by
//! environment name (`production:`, `staging:`, ...) is scoped to the
//! requested environment.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use fb_core::{ConfigError, ConfigResult};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{Map, Value};
use tracing::debug;

static EMBEDDED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<%(=?)(.*?)-?%>").unwrap());
static ENV_INDEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^ENV\[\s*['"]([^'"]+)['"]\s*\]$"#).unwrap());
static ENV_FETCH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^ENV\.fetch\(\s*['"]([^'"]+)['"]\s*(?:,\s*['"]([^'"]*)['"]\s*)?\)$"#).unwrap()
});

/// A flat, environment-scoped credential set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Credentials {
    values: BTreeMap<String, Value>,
}

impl Credentials {
    /// Build from a map. Ruby-style symbol keys (`:provider`) lose their colon.
    pub fn from_map(map: Map<String, Value>) -> Self {
        let values = map
            .into_iter()
            .map(|(key, value)| (key.trim_start_matches(':').to_string(), value))
            .collect();
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    /// Boolean flag; accepts `true`, `"true"` and `"1"`
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key)? {
            Value::Bool(flag) => Some(*flag),
            Value::String(s) => Some(s == "true" || s == "1"),
            _ => None,
        }
    }

    /// Provider name (`AWS`, `Local`, ...)
    pub fn provider(&self) -> Option<&str> {
        self.get_str("provider")
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Where credentials come from
#[derive(Debug)]
pub enum CredentialSource {
    Inline(Map<String, Value>),
    Path(PathBuf),
    File(File),
}

impl CredentialSource {
    /// Interpret a configuration value: objects are inline credentials,
    /// strings are paths. Anything else is rejected.
    pub fn from_value(value: Value) -> ConfigResult<Self> {
        match value {
            Value::Object(map) => Ok(CredentialSource::Inline(map)),
            Value::String(path) => Ok(CredentialSource::Path(PathBuf::from(path))),
            other => Err(ConfigError::invalid(format!(
                "credentials must be a map, a file path or an open file, got {}",
                value_kind(&other)
            ))),
        }
    }

    pub fn path(path: impl AsRef<Path>) -> Self {
        CredentialSource::Path(path.as_ref().to_path_buf())
    }

    /// Duplicate the source; an open file shares its handle and cursor
    pub fn try_clone(&self) -> ConfigResult<Self> {
        Ok(match self {
            CredentialSource::Inline(map) => CredentialSource::Inline(map.clone()),
            CredentialSource::Path(path) => CredentialSource::Path(path.clone()),
            CredentialSource::File(file) => CredentialSource::File(file.try_clone()?),
        })
    }

    /// Resolve using the process environment for template expansion
    pub fn resolve(self, environment: &str) -> ConfigResult<Credentials> {
        self.resolve_with(environment, |name| std::env::var(name).ok())
    }

    /// Resolve with an explicit variable lookup
    pub fn resolve_with<F>(self, environment: &str, lookup: F) -> ConfigResult<Credentials>
    where
        F: Fn(&str) -> Option<String>,
    {
        let map = match self {
            CredentialSource::Inline(map) => map,
            CredentialSource::Path(path) => {
                debug!(path = %path.display(), "Reading credentials file");
                let contents = std::fs::read_to_string(&path)?;
                parse_document(&contents, &lookup)?
            }
            CredentialSource::File(mut file) => {
                let mut contents = String::new();
                file.read_to_string(&mut contents)?;
                parse_document(&contents, &lookup)?
            }
        };

        Ok(Credentials::from_map(scope_to_environment(map, environment)))
    }
}

fn parse_document<F>(contents: &str, lookup: &F) -> ConfigResult<Map<String, Value>>
where
    F: Fn(&str) -> Option<String>,
{
    let expanded = expand_template(contents, lookup)?;
    match serde_yaml::from_str::<Value>(&expanded)? {
        Value::Object(map) => Ok(map),
        other => Err(ConfigError::invalid(format!(
            "credentials document must contain a map, got {}",
            value_kind(&other)
        ))),
    }
}

fn scope_to_environment(mut map: Map<String, Value>, environment: &str) -> Map<String, Value> {
    if matches!(map.get(environment), Some(Value::Object(_))) {
        if let Some(Value::Object(scoped)) = map.remove(environment) {
            return scoped;
        }
    }
    map
}

/// Expand `<%= ... %>` expressions.
///
/// Supported expressions are `ENV['NAME']` (missing variables expand to an
/// empty string), `ENV.fetch('NAME')` (missing variables are an error) and
/// `ENV.fetch('NAME', 'default')`.
pub fn expand_template<F>(source: &str, lookup: F) -> ConfigResult<String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut output = String::with_capacity(source.len());
    let mut last = 0;

    for caps in EMBEDDED.captures_iter(source) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        output.push_str(&source[last..whole.start()]);
        output.push_str(&evaluate(&caps, &lookup)?);
        last = whole.end();
    }
    output.push_str(&source[last..]);

    Ok(output)
}

fn evaluate<F>(caps: &Captures<'_>, lookup: &F) -> ConfigResult<String>
where
    F: Fn(&str) -> Option<String>,
{
    let expression = caps[2].trim();
    if &caps[1] != "=" {
        return Err(ConfigError::Template(format!(
            "unsupported template statement: {expression}"
        )));
    }

    if let Some(env) = ENV_INDEX.captures(expression) {
        return Ok(lookup(&env[1]).unwrap_or_default());
    }

    if let Some(env) = ENV_FETCH.captures(expression) {
        let name = &env[1];
        return match (lookup(name), env.get(2)) {
            (Some(value), _) => Ok(value),
            (None, Some(default)) => Ok(default.as_str().to_string()),
            (None, None) => Err(ConfigError::Template(format!(
                "environment variable {name} is not set"
            ))),
        };
    }

    Err(ConfigError::Template(format!(
        "unsupported template expression: {expression}"
    )))
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a map",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::{Seek, SeekFrom, Write};

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env(name: &str) -> Option<String> {
        match name {
            "AWS_KEY" => Some("AKIAEXAMPLE".to_string()),
            "AWS_SECRET" => Some("s3cr3t".to_string()),
            _ => None,
        }
    }

    #[test]
    fn test_inline_map_without_environment_key_is_unchanged() {
        let value = json!({
            "provider": "AWS",
            "aws_access_key_id": "AKIA",
            "aws_secret_access_key": "secret",
        });
        let source = CredentialSource::from_value(value).unwrap();

        let creds = source.resolve_with("production", no_env).unwrap();
        assert_eq!(creds.len(), 3);
        assert_eq!(creds.provider(), Some("AWS"));
        assert_eq!(creds.get_str("aws_access_key_id"), Some("AKIA"));
        assert_eq!(creds.get_str("aws_secret_access_key"), Some("secret"));
    }

    #[test]
    fn test_inline_map_scoped_to_environment() {
        let value = json!({
            "development": { "provider": "Local", "local_root": "/tmp" },
            "production": { "provider": "AWS", "region": "eu-west-1" },
        });

        let creds = CredentialSource::from_value(value)
            .unwrap()
            .resolve_with("production", no_env)
            .unwrap();
        assert_eq!(creds.provider(), Some("AWS"));
        assert_eq!(creds.get_str("region"), Some("eu-west-1"));
        assert!(creds.get("development").is_none());
    }

    #[test]
    fn test_environment_key_with_scalar_value_is_not_scoped() {
        let value = json!({ "provider": "AWS", "production": "yes" });

        let creds = CredentialSource::from_value(value)
            .unwrap()
            .resolve_with("production", no_env)
            .unwrap();
        assert_eq!(creds.get_str("production"), Some("yes"));
    }

    #[test]
    fn test_rejects_non_map_values() {
        for value in [json!(42), json!([1, 2]), json!(null), json!(true)] {
            let result = CredentialSource::from_value(value);
            assert!(matches!(result, Err(ConfigError::InvalidConfiguration(_))));
        }
    }

    #[test]
    fn test_symbol_keys_are_normalized() {
        let creds = CredentialSource::from_value(json!({ ":provider": "Local" }))
            .unwrap()
            .resolve_with("test", no_env)
            .unwrap();
        assert_eq!(creds.provider(), Some("Local"));
    }

    #[test]
    fn test_resolve_from_path_with_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s3.yml");
        std::fs::write(
            &path,
            "production:\n  provider: AWS\n  aws_access_key_id: <%= ENV['AWS_KEY'] %>\n  aws_secret_access_key: \"<%= ENV.fetch('AWS_SECRET') %>\"\n  region: <%= ENV.fetch('AWS_REGION', 'us-east-1') %>\n",
        )
        .unwrap();

        let creds = CredentialSource::path(&path)
            .resolve_with("production", env)
            .unwrap();
        assert_eq!(creds.get_str("aws_access_key_id"), Some("AKIAEXAMPLE"));
        assert_eq!(creds.get_str("aws_secret_access_key"), Some("s3cr3t"));
        assert_eq!(creds.get_str("region"), Some("us-east-1"));
    }

    #[test]
    fn test_resolve_from_open_file() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"provider: Local\nlocal_root: /var/fogbox\n").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let creds = CredentialSource::File(file)
            .resolve_with("development", no_env)
            .unwrap();
        assert_eq!(creds.provider(), Some("Local"));
        assert_eq!(creds.get_str("local_root"), Some("/var/fogbox"));
    }

    #[test]
    fn test_document_must_be_a_map() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"- provider\n- AWS\n").unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();

        let result = CredentialSource::File(file).resolve_with("development", no_env);
        assert!(matches!(result, Err(ConfigError::InvalidConfiguration(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = CredentialSource::path("/nonexistent/credentials.yml")
            .resolve_with("development", no_env);
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_expand_template_missing_index_is_empty() {
        let expanded = expand_template("key: '<%= ENV[\"NOPE\"] %>'", no_env).unwrap();
        assert_eq!(expanded, "key: ''");
    }

    #[test]
    fn test_expand_template_fetch_without_default_fails() {
        let result = expand_template("key: <%= ENV.fetch('NOPE') %>", no_env);
        assert!(matches!(result, Err(ConfigError::Template(_))));
    }

    #[test]
    fn test_expand_template_rejects_arbitrary_code() {
        assert!(expand_template("<%= File.read('/etc/passwd') %>", no_env).is_err());
        assert!(expand_template("<% if true %>x<% end %>", no_env).is_err());
    }

    #[test]
    fn test_expand_template_passthrough() {
        let source = "provider: AWS\nregion: eu-central-1\n";
        assert_eq!(expand_template(source, no_env).unwrap(), source);
    }

    #[test]
    fn test_get_bool() {
        let creds = Credentials::from_map(
            json!({ "path_style": true, "allow_http": "1", "region": "x" })
                .as_object()
                .unwrap()
                .clone(),
        );
        assert_eq!(creds.get_bool("path_style"), Some(true));
        assert_eq!(creds.get_bool("allow_http"), Some(true));
        assert_eq!(creds.get_bool("missing"), None);
    }
}
