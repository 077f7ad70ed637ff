// Configuration file loaders

use crate::{ConfigError, CoordinationConfiguration, Result, ServerEntry, Validate};
use quick_xml::Reader;
use quick_xml::events::Event;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Name of the root element of a coordination client configuration file.
pub const ROOT_ELEMENT: &str = "coordinationClient";

/// Default namespace under which all coordination nodes are created.
pub const DEFAULT_ROOT_PATH: &str = "/synod";

/// Default `send_receive` wait budget and broadcast message lifetime.
pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
struct RawConfiguration {
    #[serde(rename = "@enabled")]
    enabled: Option<String>,
    #[serde(rename = "sessionTimeout")]
    session_timeout: Option<String>,
    #[serde(rename = "rootPath")]
    root_path: Option<String>,
    #[serde(rename = "messageTimeout")]
    message_timeout: Option<String>,
    servers: Option<RawServers>,
}

#[derive(Debug, Deserialize)]
struct RawServers {
    #[serde(rename = "server", default)]
    entries: Vec<RawServer>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    #[serde(rename = "@host")]
    host: Option<String>,
    #[serde(rename = "@port")]
    port: Option<String>,
}

/// XML configuration file loader
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigLoader;

impl ConfigLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load configuration from file
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<CoordinationConfiguration> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ConfigError::LoadError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        self.parse(&content)
    }

    /// Parse configuration from an XML document
    pub fn parse(&self, content: &str) -> Result<CoordinationConfiguration> {
        let content = content.trim();
        let root = root_element(content)?;
        if root != ROOT_ELEMENT {
            return Err(ConfigError::UnexpectedRoot {
                expected: ROOT_ELEMENT.to_string(),
                found: root,
            });
        }

        let raw: RawConfiguration = quick_xml::de::from_str(content)
            .map_err(|e| ConfigError::ParseError(format!("XML parse error: {}", e)))?;

        let config = raw.into_configuration()?;
        config.validate()?;
        Ok(config)
    }
}

impl RawConfiguration {
    fn into_configuration(self) -> Result<CoordinationConfiguration> {
        let enabled = match self.enabled {
            Some(value) => parse_bool("enabled", &value)?,
            None => true,
        };

        let session_timeout = self
            .session_timeout
            .ok_or_else(|| ConfigError::MissingElement("sessionTimeout".to_string()))
            .and_then(|value| parse_millis("sessionTimeout", &value))?;

        let message_timeout = match self.message_timeout {
            Some(value) => parse_millis("messageTimeout", &value)?,
            None => DEFAULT_MESSAGE_TIMEOUT,
        };

        let root_path = self
            .root_path
            .map(|path| path.trim().to_string())
            .unwrap_or_else(|| DEFAULT_ROOT_PATH.to_string());

        let servers = self
            .servers
            .ok_or_else(|| ConfigError::MissingElement("servers".to_string()))?
            .entries
            .into_iter()
            .map(RawServer::into_entry)
            .collect::<Result<Vec<_>>>()?;

        if servers.is_empty() {
            return Err(ConfigError::NoServers);
        }

        Ok(CoordinationConfiguration {
            enabled,
            session_timeout,
            servers,
            root_path,
            message_timeout,
        })
    }
}

impl RawServer {
    fn into_entry(self) -> Result<ServerEntry> {
        let host = self
            .host
            .map(|host| host.trim().to_string())
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ConfigError::MissingElement("server/@host".to_string()))?;

        let port = match self.port {
            Some(value) => Some(parse_port("server/@port", &value)?),
            None => None,
        };

        Ok(ServerEntry { host, port })
    }
}

/// Find the name of the first element in the document
fn root_element(content: &str) -> Result<String> {
    let mut reader = Reader::from_str(content);

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return Ok(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
            }
            Ok(Event::Eof) => return Err(ConfigError::MissingElement(ROOT_ELEMENT.to_string())),
            Ok(_) => continue,
            Err(e) => return Err(ConfigError::ParseError(format!("XML parse error: {}", e))),
        }
    }
}

pub(crate) fn parse_bool(field: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::invalid(field, value)),
    }
}

pub(crate) fn parse_millis(field: &str, value: &str) -> Result<Duration> {
    match value.trim().parse::<u64>() {
        Ok(millis) if millis > 0 => Ok(Duration::from_millis(millis)),
        _ => Err(ConfigError::invalid(field, value)),
    }
}

pub(crate) fn parse_port(field: &str, value: &str) -> Result<u16> {
    match value.trim().parse::<i64>() {
        Ok(port) if port > 0 && port <= i64::from(u16::MAX) => Ok(port as u16),
        _ => Err(ConfigError::invalid(field, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
        <?xml version="1.0" encoding="UTF-8"?>
        <!-- coordination client -->
        <coordinationClient enabled="true">
            <sessionTimeout>5000</sessionTimeout>
            <servers>
                <server host="zk1.local" port="2181"/>
                <server host="zk2.local"/>
            </servers>
        </coordinationClient>
    "#;

    #[test]
    fn test_parse_valid() {
        let config = ConfigLoader::new().parse(VALID).unwrap();

        assert!(config.enabled);
        assert_eq!(config.session_timeout, Duration::from_millis(5000));
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].port, Some(2181));
        assert_eq!(config.servers[1].port, None);
        assert_eq!(config.root_path, DEFAULT_ROOT_PATH);
        assert_eq!(config.message_timeout, DEFAULT_MESSAGE_TIMEOUT);
    }

    #[test]
    fn test_enabled_defaults_to_true() {
        let xml = r#"<coordinationClient>
            <sessionTimeout>100</sessionTimeout>
            <servers><server host="a"/></servers>
        </coordinationClient>"#;

        assert!(ConfigLoader::new().parse(xml).unwrap().enabled);
    }

    #[test]
    fn test_disabled() {
        let xml = r#"<coordinationClient enabled="false">
            <sessionTimeout>100</sessionTimeout>
            <servers><server host="a"/></servers>
        </coordinationClient>"#;

        assert!(!ConfigLoader::new().parse(xml).unwrap().enabled);
    }

    #[test]
    fn test_optional_elements() {
        let xml = r#"<coordinationClient>
            <sessionTimeout>100</sessionTimeout>
            <rootPath>/apps/billing</rootPath>
            <messageTimeout>3000</messageTimeout>
            <servers><server host="a"/></servers>
        </coordinationClient>"#;

        let config = ConfigLoader::new().parse(xml).unwrap();
        assert_eq!(config.root_path, "/apps/billing");
        assert_eq!(config.message_timeout, Duration::from_millis(3000));
    }

    #[test]
    fn test_empty_document() {
        let result = ConfigLoader::new().parse("");
        assert!(matches!(result, Err(ConfigError::MissingElement(_))));
    }

    #[test]
    fn test_wrong_root() {
        let result = ConfigLoader::new().parse("<settings/>");
        assert!(matches!(result, Err(ConfigError::UnexpectedRoot { .. })));
    }

    #[test]
    fn test_missing_servers() {
        let xml = r#"<coordinationClient>
            <sessionTimeout>100</sessionTimeout>
        </coordinationClient>"#;

        let result = ConfigLoader::new().parse(xml);
        assert!(matches!(result, Err(ConfigError::MissingElement(ref e)) if e == "servers"));
    }

    #[test]
    fn test_zero_servers() {
        let xml = r#"<coordinationClient>
            <sessionTimeout>100</sessionTimeout>
            <servers></servers>
        </coordinationClient>"#;

        let result = ConfigLoader::new().parse(xml);
        assert!(matches!(result, Err(ConfigError::NoServers)));
    }

    #[test]
    fn test_invalid_ports() {
        for port in ["abc", "0", "-1", "70000"] {
            let xml = format!(
                r#"<coordinationClient>
                    <sessionTimeout>100</sessionTimeout>
                    <servers><server host="a" port="{}"/></servers>
                </coordinationClient>"#,
                port
            );

            let result = ConfigLoader::new().parse(&xml);
            assert!(
                matches!(result, Err(ConfigError::InvalidValue { .. })),
                "port {} should be rejected",
                port
            );
        }
    }

    #[test]
    fn test_invalid_session_timeout() {
        let xml = r#"<coordinationClient>
            <sessionTimeout>soon</sessionTimeout>
            <servers><server host="a"/></servers>
        </coordinationClient>"#;

        let result = ConfigLoader::new().parse(xml);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_missing_host() {
        let xml = r#"<coordinationClient>
            <sessionTimeout>100</sessionTimeout>
            <servers><server port="2181"/></servers>
        </coordinationClient>"#;

        let result = ConfigLoader::new().parse(xml);
        assert!(matches!(result, Err(ConfigError::MissingElement(_))));
    }

    #[test]
    fn test_parse_helpers() {
        assert!(parse_bool("f", "TRUE").unwrap());
        assert!(!parse_bool("f", "false").unwrap());
        assert!(parse_bool("f", "maybe").is_err());
        assert_eq!(parse_port("p", " 2181 ").unwrap(), 2181);
        assert!(parse_millis("t", "0").is_err());
    }
}
