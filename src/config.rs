//! Per-organization directory configuration.
//!
//! The configuration is a JSON object keyed by realm:
//!
//! ```json
//! {
//!     "example.org": {
//!         "base_dn": "dc=example,dc=org",
//!         "display": "Example University",
//!         "servers": ["ldap1.example.org", "ldap2.example.org:10636"],
//!         "bind_user": { "dn": "cn=reader,dc=example,dc=org", "password": "..." },
//!         "exclude": "(objectClass=excludedPerson)",
//!         "peoplesearch": { "employees": "all", "others": "sameOrg" }
//!     }
//! }
//! ```

use crate::backend::{Credentials, Server};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to read configuration")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {}", format_problems(.0))]
    Invalid(Vec<Problem>),
}

fn format_problems(problems: &[Problem]) -> String {
    problems
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// One thing wrong with one realm's configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Problem {
    pub realm: String,
    pub reason: String,
}

impl std::fmt::Display for Problem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.realm, self.reason)
    }
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct BindUser {
    pub dn: String,
    pub password: String,
}

impl std::fmt::Debug for BindUser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindUser")
            .field("dn", &self.dn)
            .finish_non_exhaustive()
    }
}

impl From<&BindUser> for Credentials {
    fn from(bind: &BindUser) -> Self {
        Credentials {
            dn: bind.dn.clone(),
            password: bind.password.clone(),
        }
    }
}

/// Who may find a person through people search.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Access {
    #[default]
    None,
    SameOrg,
    All,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PeopleSearch {
    #[serde(default)]
    pub employees: Access,
    #[serde(default)]
    pub others: Access,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct OrgConfig {
    pub base_dn: String,
    pub display: String,
    pub servers: Vec<String>,
    #[serde(default)]
    pub bind_user: Option<BindUser>,
    #[serde(default)]
    pub exclude: Option<String>,
    #[serde(default)]
    pub peoplesearch: PeopleSearch,
}

impl OrgConfig {
    /// Parses every configured server, attaching the bind user.
    pub fn parsed_servers(&self) -> Result<Vec<Server>, String> {
        let bind = self.bind_user.as_ref().map(Credentials::from);
        self.servers
            .iter()
            .map(|address| Server::parse(address, bind.clone()))
            .collect()
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = vec![];
        if self.base_dn.trim().is_empty() {
            problems.push("base_dn must not be empty".to_string());
        }
        if self.display.trim().is_empty() {
            problems.push("display must not be empty".to_string());
        }
        if self.servers.is_empty() {
            problems.push("at least one server is required".to_string());
        }
        for address in &self.servers {
            if let Err(err) = Server::parse(address, None) {
                problems.push(err);
            }
        }
        if let Some(bind) = &self.bind_user {
            if bind.dn.trim().is_empty() {
                problems.push("bind_user.dn must not be empty".to_string());
            }
        }
        if let Some(exclude) = &self.exclude {
            let exclude = exclude.trim();
            if !(exclude.starts_with('(') && exclude.ends_with(')')) {
                problems.push(format!("exclude filter {exclude:?} must be parenthesized"));
            }
        }
        problems
    }
}

/// Directory configuration for every known realm.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Config {
    orgs: BTreeMap<String, OrgConfig>,
}

impl Config {
    pub fn new(orgs: BTreeMap<String, OrgConfig>) -> Self {
        Self { orgs }
    }

    /// Reads, parses and sanity checks a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a configuration file without sanity checking it.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    pub fn from_json(contents: &str) -> Result<Self, Error> {
        let config: Config = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Everything wrong with the configuration, across all realms.
    pub fn problems(&self) -> Vec<Problem> {
        self.orgs
            .iter()
            .flat_map(|(realm, org)| {
                org.problems().into_iter().map(move |reason| Problem {
                    realm: realm.clone(),
                    reason,
                })
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), Error> {
        let problems = self.problems();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Invalid(problems))
        }
    }

    pub fn get(&self, realm: &str) -> Option<&OrgConfig> {
        self.orgs.get(realm)
    }

    pub fn orgs(&self) -> impl Iterator<Item = (&str, &OrgConfig)> {
        self.orgs.iter().map(|(realm, org)| (realm.as_str(), org))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CONFIG: &str = r#"{
        "example.org": {
            "base_dn": "dc=example,dc=org",
            "display": "Example University",
            "servers": ["ldap1.example.org", "ldap2.example.org:10636"],
            "bind_user": { "dn": "cn=reader,dc=example,dc=org", "password": "secret" },
            "exclude": "(objectClass=excludedPerson)",
            "peoplesearch": { "employees": "all", "others": "sameOrg" }
        },
        "example.com": {
            "base_dn": "dc=example,dc=com",
            "display": "Example Corp",
            "servers": ["ldap.example.com"]
        }
    }"#;

    #[test]
    fn parses_full_configuration() {
        let config = Config::from_json(CONFIG).unwrap();
        let org = config.get("example.org").unwrap();
        assert_eq!(org.base_dn, "dc=example,dc=org");
        assert_eq!(org.peoplesearch.employees, Access::All);
        assert_eq!(org.peoplesearch.others, Access::SameOrg);
        assert_eq!(
            org.exclude.as_deref(),
            Some("(objectClass=excludedPerson)")
        );

        let servers = org.parsed_servers().unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].port, 10636);
        assert_eq!(
            servers[0].bind.as_ref().map(|b| b.dn.as_str()),
            Some("cn=reader,dc=example,dc=org")
        );

        let minimal = config.get("example.com").unwrap();
        assert_eq!(minimal.bind_user, None);
        assert_eq!(minimal.peoplesearch, PeopleSearch::default());
        assert_eq!(config.orgs().count(), 2);
    }

    #[test]
    fn missing_required_key_fails() {
        let err = Config::from_json(r#"{ "example.org": { "display": "x", "servers": [] } }"#)
            .unwrap_err();
        assert!(matches!(err, Error::Parse(_)), "Unexpected error: {err:?}");
        assert!(err.to_string().contains("base_dn"));
    }

    #[test]
    fn wrong_type_fails() {
        let err = Config::from_json(
            r#"{ "example.org": { "base_dn": "dc=x", "display": "x", "servers": "ldap" } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Parse(_)), "Unexpected error: {err:?}");
    }

    #[test]
    fn unknown_access_level_fails() {
        let err = Config::from_json(
            r#"{ "example.org": { "base_dn": "dc=x", "display": "x", "servers": ["ldap"],
                 "peoplesearch": { "employees": "everyone" } } }"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Parse(_)), "Unexpected error: {err:?}");
    }

    #[test]
    fn sanity_check_reports_every_problem() {
        let err = Config::from_json(
            r#"{ "example.org": { "base_dn": "", "display": "x", "servers": ["ldap:http"],
                 "exclude": "objectClass=x" } }"#,
        )
        .unwrap_err();
        let Error::Invalid(problems) = &err else {
            panic!("Unexpected error: {err:?}");
        };
        assert_eq!(problems.len(), 3);
        assert!(problems.iter().all(|p| p.realm == "example.org"));
        assert!(err.to_string().contains("base_dn must not be empty"));
    }

    #[test]
    fn empty_server_list_is_invalid() {
        let err = Config::from_json(
            r#"{ "example.org": { "base_dn": "dc=x", "display": "x", "servers": [] } }"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("at least one server"));
    }
}
