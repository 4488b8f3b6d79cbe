//! One-off diagnostics for an organization's directory servers.
//!
//! Unlike the pools, these open a fresh connection per call so that the
//! report reflects the server's current reachability, TLS and bind state.
//! Nothing here returns an error: every failure is captured in the report.

use crate::backend::{self, Connector, Query, Record, Scope, Server};
use crate::config::Config;
use crate::query::validate_query;

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{event, Level};

/// Attributes every person entry must carry.
pub const PERSON_ATTRIBUTES: [&str; 5] = [
    "cn",
    "displayName",
    "eduPersonAffiliation",
    "eduPersonOrgDN",
    "eduPersonPrincipalName",
];

/// Attributes the organization entry named by `eduPersonOrgDN` must carry.
pub const ORG_ATTRIBUTES: [&str; 2] = ["eduOrgLegalName", "norEduOrgNIN"];

/// Attributes every entry named by `eduPersonOrgUnitDN` must carry.
pub const ORG_UNIT_ATTRIBUTES: [&str; 1] = ["ou"];

const SUCCESS: &str = "success";
const DATA_ERROR: &str = "data error";
const COMMUNICATION_ERROR: &str = "Communications Error";
const BIND_ERROR: &str = "bind_error";
const OTHER_ERROR: &str = "other error";

/// The outcome of probing one server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServerStatus {
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
}

impl ServerStatus {
    fn success() -> Self {
        Self {
            result: SUCCESS.to_string(),
            class: None,
            message: None,
            details: None,
        }
    }

    fn data_error(message: impl Into<String>, details: Option<Vec<String>>) -> Self {
        Self {
            result: DATA_ERROR.to_string(),
            class: None,
            message: Some(message.into()),
            details,
        }
    }

    fn other_error(class: &str, message: impl Into<String>) -> Self {
        Self {
            result: OTHER_ERROR.to_string(),
            class: Some(class.to_string()),
            message: Some(message.into()),
            details: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.result == SUCCESS
    }
}

impl From<backend::Error> for ServerStatus {
    fn from(err: backend::Error) -> Self {
        let result = if err.is_communication() {
            COMMUNICATION_ERROR
        } else if matches!(err, backend::Error::Bind(_)) {
            BIND_ERROR
        } else {
            OTHER_ERROR
        };
        Self {
            result: result.to_string(),
            class: Some(err.class().to_string()),
            message: Some(err.to_string()),
            details: None,
        }
    }
}

/// The report for one realm: either a single error, or one status per server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RealmStatus {
    Error(ServerStatus),
    Servers(BTreeMap<String, ServerStatus>),
}

/// The attributes in `required` which `record` lacks, or has no values for.
pub fn check_attributes(record: &Record, required: &[&str]) -> Vec<String> {
    required
        .iter()
        .filter(|name| !record.get(**name).is_some_and(|values| !values.is_empty()))
        .map(|name| name.to_string())
        .collect()
}

async fn check_referenced<C: Connector + ?Sized>(
    connector: &C,
    conn: &mut C::Connection,
    kind: &str,
    dn: &str,
    required: &[&str],
) -> Result<Vec<String>, backend::Error> {
    let query = Query::new(dn, "(objectClass=*)", Scope::Base).attributes(required);
    let entries = connector.search(conn, &query).await?;
    let Some(entry) = entries.first() else {
        return Ok(vec![format!("{kind} {dn} not found")]);
    };
    Ok(check_attributes(entry, required)
        .into_iter()
        .map(|name| format!("{kind} {dn} lacks {name}"))
        .collect())
}

/// Checks a person entry, and the organization and units it refers to.
///
/// Returns a description of every data quality problem found.
pub async fn check_object<C: Connector + ?Sized>(
    connector: &C,
    conn: &mut C::Connection,
    person: &Record,
) -> Result<Vec<String>, backend::Error> {
    let mut problems: Vec<String> = check_attributes(person, &PERSON_ATTRIBUTES)
        .into_iter()
        .map(|name| format!("person lacks {name}"))
        .collect();

    let references = [
        ("eduPersonOrgDN", "organization", &ORG_ATTRIBUTES[..]),
        ("eduPersonOrgUnitDN", "unit", &ORG_UNIT_ATTRIBUTES[..]),
    ];
    for (attribute, kind, required) in references {
        for dn in person.get(attribute).into_iter().flatten() {
            problems.extend(check_referenced(connector, conn, kind, dn, required).await?);
        }
    }
    Ok(problems)
}

/// Classifies a search response expected to hold exactly one person.
pub async fn get_search_status<C: Connector + ?Sized>(
    connector: &C,
    conn: &mut C::Connection,
    entries: &[Record],
) -> Result<ServerStatus, backend::Error> {
    let [person] = entries else {
        return Ok(ServerStatus::data_error(
            format!("Expected exactly one entry, found {}", entries.len()),
            None,
        ));
    };
    let problems = check_object(connector, conn, person).await?;
    if problems.is_empty() {
        Ok(ServerStatus::success())
    } else {
        Ok(ServerStatus::data_error(
            "Missing mandatory attributes",
            Some(problems),
        ))
    }
}

async fn probe<C: Connector + ?Sized>(
    connector: &C,
    server: &Server,
    base_dn: &str,
    filter: &str,
) -> Result<ServerStatus, backend::Error> {
    let mut conn = connector.connect(server).await?;
    let query = Query::new(base_dn, filter, Scope::Subtree).attributes(&PERSON_ATTRIBUTES);
    let entries = connector.search(&mut conn, &query).await?;
    get_search_status(connector, &mut conn, &entries).await
}

/// Connects to `server`, runs one search, and checks what comes back.
pub async fn server_status<C: Connector + ?Sized>(
    connector: &C,
    server: &Server,
    base_dn: &str,
    filter: &str,
) -> ServerStatus {
    match probe(connector, server, base_dn, filter).await {
        Ok(status) => status,
        Err(err) => {
            event!(Level::INFO, server = %server, err = %err, "Status probe failed");
            err.into()
        }
    }
}

/// Probes every server configured for `realm`, looking up `feideid` on each.
pub async fn ldap_status<C: Connector + ?Sized>(
    connector: &C,
    realm: &str,
    feideid: &str,
    config: &Config,
) -> RealmStatus {
    let Some(org) = config.get(realm) else {
        return RealmStatus::Error(ServerStatus::other_error(
            "UnknownRealm",
            format!("No directory configured for {realm}"),
        ));
    };
    if let Err(err) = validate_query(feideid) {
        return RealmStatus::Error(ServerStatus::other_error("ValidationError", err.to_string()));
    }
    let servers = match org.parsed_servers() {
        Ok(servers) => servers,
        Err(reason) => return RealmStatus::Error(ServerStatus::other_error("ConfigError", reason)),
    };

    let filter = format!("(eduPersonPrincipalName={feideid})");
    let statuses = futures::future::join_all(
        servers
            .iter()
            .map(|server| server_status(connector, server, &org.base_dn, &filter)),
    )
    .await;
    RealmStatus::Servers(
        servers
            .iter()
            .map(ToString::to_string)
            .zip(statuses)
            .collect(),
    )
}

/// Sanity checks every realm, listing each with its problems (if any).
pub fn verify_config(config: &Config) -> BTreeMap<String, Vec<String>> {
    let mut report: BTreeMap<String, Vec<String>> = config
        .orgs()
        .map(|(realm, _)| (realm.to_string(), vec![]))
        .collect();
    for problem in config.problems() {
        report.entry(problem.realm).or_default().push(problem.reason);
    }
    report
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::test_utils::{record, setup_tracing_subscriber, ScriptedConnector};

    const CONFIG: &str = r#"{
        "example.org": {
            "base_dn": "dc=example,dc=org",
            "display": "Example University",
            "servers": ["ldap1.example.org", "ldap2.example.org:10636"]
        }
    }"#;

    const ADA_FILTER: &str = "(eduPersonPrincipalName=ada@example.org)";
    const ORG_DN: &str = "o=example,dc=example,dc=org";
    const UNIT_DN: &str = "ou=maths,o=example,dc=example,dc=org";

    fn ada() -> Record {
        record(&[
            ("cn", &["Ada Lovelace"]),
            ("displayName", &["Ada Lovelace"]),
            ("eduPersonAffiliation", &["employee", "member"]),
            ("eduPersonOrgDN", &[ORG_DN]),
            ("eduPersonOrgUnitDN", &[UNIT_DN]),
            ("eduPersonPrincipalName", &["ada@example.org"]),
        ])
    }

    fn healthy_directory() -> ScriptedConnector {
        let connector = ScriptedConnector::new();
        connector.set_records(ADA_FILTER, vec![ada()]);
        connector.set_records(
            ORG_DN,
            vec![record(&[
                ("eduOrgLegalName", &["Example University"]),
                ("norEduOrgNIN", &["NO123456789"]),
            ])],
        );
        connector.set_records(UNIT_DN, vec![record(&[("ou", &["Mathematics"])])]);
        connector
    }

    fn server(host: &str) -> Server {
        Server::parse(host, None).unwrap()
    }

    #[test]
    fn test_check_attributes() {
        let mut person = ada();
        person.insert("cn".to_string(), vec![]);
        person.remove("displayName");
        assert_eq!(
            check_attributes(&person, &PERSON_ATTRIBUTES),
            vec!["cn", "displayName"]
        );
        assert!(check_attributes(&ada(), &PERSON_ATTRIBUTES).is_empty());
    }

    #[tokio::test]
    async fn test_server_status_success() {
        setup_tracing_subscriber();
        let connector = healthy_directory();
        let status = server_status(
            &connector,
            &server("ldap1.example.org"),
            "dc=example,dc=org",
            ADA_FILTER,
        )
        .await;
        assert_eq!(status, ServerStatus::success());
    }

    #[tokio::test]
    async fn test_missing_org_attributes_are_data_errors() {
        let connector = healthy_directory();
        connector.set_records(
            ORG_DN,
            vec![record(&[("eduOrgLegalName", &["Example University"])])],
        );
        connector.set_records(UNIT_DN, vec![]);

        let status = server_status(
            &connector,
            &server("ldap1.example.org"),
            "dc=example,dc=org",
            ADA_FILTER,
        )
        .await;
        assert_eq!(status.result, "data error");
        assert_eq!(
            status.details,
            Some(vec![
                format!("organization {ORG_DN} lacks norEduOrgNIN"),
                format!("unit {UNIT_DN} not found"),
            ])
        );
    }

    #[tokio::test]
    async fn test_wrong_entry_count_is_data_error() {
        let connector = healthy_directory();
        connector.set_records(ADA_FILTER, vec![ada(), ada()]);
        let status = server_status(
            &connector,
            &server("ldap1.example.org"),
            "dc=example,dc=org",
            ADA_FILTER,
        )
        .await;
        assert_eq!(status.result, "data error");
        assert_eq!(status.details, None);

        let status = server_status(
            &connector,
            &server("ldap1.example.org"),
            "dc=example,dc=org",
            "(eduPersonPrincipalName=nobody@example.org)",
        )
        .await;
        assert_eq!(status.result, "data error");
    }

    #[tokio::test]
    async fn test_failures_are_classified() {
        let connector = healthy_directory();
        connector.break_host("ldap1.example.org");
        connector.refuse_bind("ldap2.example.org");

        let down = server_status(&connector, &server("ldap1.example.org"), "dc=x", ADA_FILTER).await;
        assert_eq!(down.result, "Communications Error");
        assert_eq!(down.class.as_deref(), Some("CommunicationError"));
        assert!(down.message.is_some());

        let refused =
            server_status(&connector, &server("ldap2.example.org"), "dc=x", ADA_FILTER).await;
        assert_eq!(refused.result, "bind_error");
    }

    #[tokio::test]
    async fn test_ldap_status_reports_every_server() {
        let connector = healthy_directory();
        connector.break_host("ldap2.example.org");
        let config = Config::from_json(CONFIG).unwrap();

        let status = ldap_status(&connector, "example.org", "ada@example.org", &config).await;
        let RealmStatus::Servers(servers) = &status else {
            panic!("Unexpected status: {status:?}");
        };
        assert_eq!(servers.len(), 2);
        assert!(servers["ldap1.example.org:636"].is_success());
        assert_eq!(
            servers["ldap2.example.org:10636"].result,
            "Communications Error"
        );

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["ldap1.example.org:636"]["result"], "success");
        assert!(json["ldap1.example.org:636"].get("class").is_none());
    }

    #[tokio::test]
    async fn test_ldap_status_unknown_realm() {
        let connector = healthy_directory();
        let config = Config::from_json(CONFIG).unwrap();
        let status = ldap_status(&connector, "example.net", "ada@example.net", &config).await;
        let RealmStatus::Error(error) = status else {
            panic!("Unexpected status: {status:?}");
        };
        assert_eq!(error.result, "other error");
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_ldap_status_rejects_injection() {
        let connector = healthy_directory();
        let config = Config::from_json(CONFIG).unwrap();
        let status = ldap_status(&connector, "example.org", "*)(uid=*", &config).await;
        assert!(matches!(status, RealmStatus::Error(_)));
        assert_eq!(connector.connect_count(), 0);
    }

    #[test]
    fn test_verify_config() {
        let config: Config = serde_json::from_str(
            r#"{
                "example.org": { "base_dn": "dc=example,dc=org", "display": "x",
                                 "servers": ["ldap.example.org"] },
                "example.com": { "base_dn": "dc=example,dc=com", "display": "",
                                 "servers": [] }
            }"#,
        )
        .unwrap();
        let report = verify_config(&config);
        assert_eq!(report["example.org"], Vec::<String>::new());
        assert_eq!(report["example.com"].len(), 2);
    }
}
