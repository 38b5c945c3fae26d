//! Rule-file loading: TOML configuration for one FILTER instance.
//!
//! Mirrors the enumerated keys a rule file may carry (§3); unknown keys are
//! a hard parse error via `deny_unknown_fields`.

use crate::error::RuleError;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;

const IPV4_PLACEHOLDER: &str = "{{.Ipv4}}";
const IPV4_PATTERN: &str = r"(?P<ipv4>\d{1,3}(?:\.\d{1,3}){3})";

/// Accepts either a bare string or a list of strings for `syslog_identifier`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl From<OneOrMany> for Vec<String> {
    fn from(v: OneOrMany) -> Self {
        match v {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
    enabled: bool,
    #[serde(default)]
    action: String,
    syslog_identifier: OneOrMany,
    #[serde(default)]
    rbl_use: bool,
    #[serde(default)]
    rbl_must: bool,
    #[serde(default)]
    re: Vec<String>,
    #[serde(default)]
    ignore: Vec<String>,
    #[serde(default)]
    testdata: Vec<String>,
}

/// A parsed, compiled rule file: one FILTER's configuration.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub enabled: bool,
    pub action: String,
    pub tags: Vec<String>,
    pub rbl_use: bool,
    pub rbl_must: bool,
    pub re: Vec<Regex>,
    pub ignore: Vec<Regex>,
    pub testdata: Vec<String>,
}

impl Rule {
    /// Load and compile a rule file. `name` is the file stem, matching the
    /// source's convention of naming a rule after its toml file.
    pub fn load(path: &Path) -> Result<Rule, RuleError> {
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            return Err(RuleError::NotTomlFile(path.display().to_string()));
        }
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let text = std::fs::read_to_string(path).map_err(|source| RuleError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let raw: RawRule = toml::from_str(&text).map_err(|source| RuleError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        let re = raw
            .re
            .iter()
            .map(|pattern| compile_template(&name, pattern))
            .collect::<Result<Vec<_>, _>>()?;
        let ignore = raw
            .ignore
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| RuleError::InvalidPattern {
                    name: name.clone(),
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Rule {
            name,
            enabled: raw.enabled,
            action: raw.action,
            tags: raw.syslog_identifier.into(),
            rbl_use: raw.rbl_use,
            rbl_must: raw.rbl_must,
            re,
            ignore,
            testdata: raw.testdata,
        })
    }
}

/// Substitute the `{{.Ipv4}}` placeholder with the named-capture pattern and
/// compile the result. The placeholder must be present.
fn compile_template(name: &str, pattern: &str) -> Result<Regex, RuleError> {
    if !pattern.contains(IPV4_PLACEHOLDER) {
        return Err(RuleError::MissingIpv4Placeholder {
            name: name.to_string(),
            pattern: pattern.to_string(),
        });
    }
    let expanded = pattern.replace(IPV4_PLACEHOLDER, IPV4_PATTERN);
    Regex::new(&expanded).map_err(|source| RuleError::InvalidPattern {
        name: name.to_string(),
        pattern: pattern.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_toml(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_and_compiles_single_tag() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(
            &dir,
            "sshd.toml",
            r#"
            enabled = true
            action = "sshd-ban"
            syslog_identifier = "sshd"
            re = ["Invalid user .* from {{.Ipv4}}"]
            "#,
        );
        let rule = Rule::load(&path).unwrap();
        assert_eq!(rule.name, "sshd");
        assert_eq!(rule.tags, vec!["sshd"]);
        let caps = rule.re[0]
            .captures("Invalid user root from 203.0.113.9")
            .unwrap();
        assert_eq!(&caps["ipv4"], "203.0.113.9");
    }

    #[test]
    fn syslog_identifier_accepts_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(
            &dir,
            "multi.toml",
            r#"
            enabled = false
            syslog_identifier = ["sshd", "sudo"]
            "#,
        );
        let rule = Rule::load(&path).unwrap();
        assert_eq!(rule.tags, vec!["sshd", "sudo"]);
        assert!(!rule.enabled);
    }

    #[test]
    fn rejects_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(
            &dir,
            "bad.toml",
            r#"
            enabled = true
            syslog_identifier = "sshd"
            bogus = 1
            "#,
        );
        assert!(Rule::load(&path).is_err());
    }

    #[test]
    fn rejects_missing_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(
            &dir,
            "noph.toml",
            r#"
            enabled = true
            syslog_identifier = "sshd"
            re = ["no placeholder here"]
            "#,
        );
        assert!(Rule::load(&path).is_err());
    }

    #[test]
    fn rejects_non_toml_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_toml(&dir, "sshd.conf", "enabled = true");
        assert!(matches!(
            Rule::load(&path),
            Err(RuleError::NotTomlFile(_))
        ));
    }
}
