//! Ingress hostnames
//!
//! A hostname is written either as `host` or `host+secret`, where `secret`
//! names a TLS secret in the gateway namespace that replaces the generated
//! Certificate.

use skiperator_common::naming::ingress_name;
use skiperator_common::{Error, OperatorConfig, Result};

/// A parsed ingress hostname
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hostname {
    /// Fully qualified host
    pub host: String,
    /// User supplied TLS secret, if any
    pub custom_secret: Option<String>,
    /// Served by the internal ingress gateway
    pub internal: bool,
}

impl Hostname {
    /// Parse one `host[+secret]` entry
    pub fn parse(raw: &str, config: &OperatorConfig) -> Result<Self> {
        let (host, secret) = match raw.split_once('+') {
            Some((host, secret)) => (host.trim(), Some(secret.trim())),
            None => (raw.trim(), None),
        };
        if host.is_empty() {
            return Err(Error::derivation(format!("invalid hostname {raw:?}")));
        }
        if secret.is_some_and(str::is_empty) {
            return Err(Error::derivation(format!(
                "hostname {raw:?} has an empty custom secret"
            )));
        }
        Ok(Self {
            host: host.to_string(),
            custom_secret: secret.map(String::from),
            internal: config.is_internal_host(host),
        })
    }

    /// Name of the per-host Gateway and VirtualService for a parent
    pub fn object_name(&self, parent: &str) -> String {
        ingress_name(parent, &self.host)
    }

    /// TLS secret name used by the HTTPS server
    pub fn credential_name(&self, parent: &str, namespace: &str) -> String {
        match &self.custom_secret {
            Some(secret) => secret.clone(),
            None => generated_secret_name(parent, namespace, &self.host),
        }
    }
}

/// Name of the generated Certificate and its secret
pub fn generated_secret_name(parent: &str, namespace: &str, host: &str) -> String {
    format!("{namespace}-{}", ingress_name(parent, host))
}

/// Parse a list of hostnames, keeping the first entry for each host
pub fn parse_hostnames(raw: &[String], config: &OperatorConfig) -> Result<Vec<Hostname>> {
    let mut hosts: Vec<Hostname> = Vec::with_capacity(raw.len());
    for entry in raw {
        let parsed = Hostname::parse(entry, config)?;
        if !hosts.iter().any(|h| h.host == parsed.host) {
            hosts.push(parsed);
        }
    }
    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OperatorConfig {
        OperatorConfig::default()
    }

    #[test]
    fn parses_custom_secret() {
        let h = Hostname::parse("app.kartverket.no+my-cert", &config()).unwrap();
        assert_eq!(h.host, "app.kartverket.no");
        assert_eq!(h.custom_secret.as_deref(), Some("my-cert"));
        assert_eq!(h.credential_name("app", "team-a"), "my-cert");
    }

    #[test]
    fn generated_secret_is_namespaced() {
        let h = Hostname::parse("app.kartverket.no", &config()).unwrap();
        assert_eq!(
            h.credential_name("app", "team-a"),
            format!("team-a-{}", ingress_name("app", "app.kartverket.no"))
        );
    }

    #[test]
    fn classifies_internal_hosts_by_suffix() {
        assert!(Hostname::parse("app.dev.skip.internal", &config()).unwrap().internal);
        assert!(!Hostname::parse("app.kartverket.no", &config()).unwrap().internal);
    }

    #[test]
    fn rejects_empty_parts() {
        assert!(Hostname::parse("", &config()).is_err());
        assert!(Hostname::parse("+secret", &config()).is_err());
        assert!(Hostname::parse("host+", &config()).is_err());
    }

    #[test]
    fn duplicate_hosts_collapse_to_first() {
        let raw = vec![
            "a.kartverket.no+first".to_string(),
            "a.kartverket.no".to_string(),
            "b.kartverket.no".to_string(),
        ];
        let hosts = parse_hostnames(&raw, &config()).unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].custom_secret.as_deref(), Some("first"));
    }
}
