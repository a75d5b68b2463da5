//! Identity providers
//!
//! ID-porten, Maskinporten and Entra ID registrations are requested by writing
//! a client object that a separate controller fulfils. The fulfilled
//! credentials land in the Secret named by the client's `secretName`, which
//! the workload receives as environment. The operator never reads it.

use skiperator_common::crd::{
    ApplicationSpec, EntraIdSettings, IdPortenSettings, MaskinportenSettings,
};
use skiperator_common::kube_utils::object_meta;
use skiperator_common::resources::identity::{
    AzureAdApplication, AzureAdApplicationSpec, AzureAdClaims, AzureAdGroup, ConsumedScope,
    IdPortenClient, IdPortenClientSpec, MaskinportenClient, MaskinportenClientSpec,
    MaskinportenScopes, ReplyUrl,
};
use skiperator_common::resources::istio::JwtRule;
use skiperator_common::{Error, Result};
use skiperator_network::Hostname;

const DEFAULT_REDIRECT_PATH: &str = "/oauth2/callback";
const DEFAULT_LOGOUT_PATH: &str = "/oauth2/logout";

/// An enabled identity provider of an Application
#[derive(Clone, Copy, Debug)]
pub enum IdentityProvider<'a> {
    /// ID-porten login for citizens
    IdPorten(&'a IdPortenSettings),
    /// Maskinporten machine to machine tokens
    Maskinporten(&'a MaskinportenSettings),
    /// Entra ID login for employees
    EntraId(&'a EntraIdSettings),
}

/// Client object requested from an identity provider controller
#[derive(Clone, Debug)]
pub enum ClientSpec {
    /// `IDPortenClient`
    IdPorten(IdPortenClient),
    /// `MaskinportenClient`
    Maskinporten(MaskinportenClient),
    /// `AzureAdApplication`
    EntraId(AzureAdApplication),
}

impl<'a> IdentityProvider<'a> {
    /// Providers enabled on an Application, in a fixed order
    pub fn enabled(spec: &'a ApplicationSpec) -> Vec<Self> {
        let mut providers = Vec::new();
        if let Some(s) = spec.idporten.as_ref().filter(|s| s.enabled) {
            providers.push(Self::IdPorten(s));
        }
        if let Some(s) = spec.maskinporten.as_ref().filter(|s| s.enabled) {
            providers.push(Self::Maskinporten(s));
        }
        if let Some(s) = spec.entra_id.as_ref().filter(|s| s.enabled) {
            providers.push(Self::EntraId(s));
        }
        providers
    }

    /// Short provider name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::IdPorten(_) => "idporten",
            Self::Maskinporten(_) => "maskinporten",
            Self::EntraId(_) => "entraid",
        }
    }

    /// Secret the provider controller writes credentials to
    pub fn secret_name(&self, app: &str) -> String {
        format!("{app}-{}", self.kind())
    }

    /// Environment variables the workload receives from the credentials Secret
    pub fn secret_key_names(&self) -> &'static [&'static str] {
        match self {
            Self::IdPorten(_) => &[
                "IDPORTEN_CLIENT_ID",
                "IDPORTEN_CLIENT_JWK",
                "IDPORTEN_WELL_KNOWN_URL",
                "IDPORTEN_ISSUER",
                "IDPORTEN_JWKS_URI",
                "IDPORTEN_TOKEN_ENDPOINT",
                "IDPORTEN_REDIRECT_URI",
            ],
            Self::Maskinporten(_) => &[
                "MASKINPORTEN_CLIENT_ID",
                "MASKINPORTEN_CLIENT_JWK",
                "MASKINPORTEN_SCOPES",
                "MASKINPORTEN_WELL_KNOWN_URL",
                "MASKINPORTEN_ISSUER",
                "MASKINPORTEN_TOKEN_ENDPOINT",
            ],
            Self::EntraId(_) => &[
                "AZURE_APP_CLIENT_ID",
                "AZURE_APP_CLIENT_SECRET",
                "AZURE_APP_JWK",
                "AZURE_APP_TENANT_ID",
                "AZURE_APP_WELL_KNOWN_URL",
                "AZURE_OPENID_CONFIG_ISSUER",
                "AZURE_OPENID_CONFIG_JWKS_URI",
                "AZURE_OPENID_CONFIG_TOKEN_ENDPOINT",
            ],
        }
    }

    /// JWT validation rule for tokens issued by this provider, if it has a
    /// fixed issuer
    pub fn jwt_rule(&self) -> Option<JwtRule> {
        let (issuer, jwks_uri) = match self {
            Self::IdPorten(_) => ("https://idporten.no", "https://idporten.no/jwks.json"),
            Self::Maskinporten(_) => ("https://maskinporten.no/", "https://maskinporten.no/jwk"),
            Self::EntraId(_) => return None,
        };
        Some(JwtRule {
            issuer: issuer.to_string(),
            jwks_uri: jwks_uri.to_string(),
            forward_original_token: true,
            ..Default::default()
        })
    }

    /// The client object to request for an Application.
    ///
    /// Browser based providers need at least one ingress hostname for their
    /// redirect URIs.
    pub fn desired_client_spec(
        &self,
        app: &str,
        namespace: &str,
        hostnames: &[Hostname],
    ) -> Result<ClientSpec> {
        let metadata = object_meta(app, namespace);
        let secret_name = self.secret_name(app);

        match self {
            Self::IdPorten(settings) => {
                let first = first_host(app, self.kind(), hostnames)?;
                let redirect_path = settings.redirect_path.as_deref().unwrap_or(DEFAULT_REDIRECT_PATH);
                let logout_path = settings
                    .frontchannel_logout_path
                    .as_deref()
                    .unwrap_or(DEFAULT_LOGOUT_PATH);
                Ok(ClientSpec::IdPorten(IdPortenClient {
                    metadata,
                    spec: IdPortenClientSpec {
                        secret_name,
                        client_name: settings.client_name.clone().unwrap_or_else(|| app.to_string()),
                        client_uri: https(first, ""),
                        redirect_uris: hostnames.iter().map(|h| https(&h.host, redirect_path)).collect(),
                        frontchannel_logout_uri: Some(https(first, logout_path)),
                        post_logout_redirect_uris: hostnames.iter().map(|h| https(&h.host, "")).collect(),
                        access_token_lifetime: settings.access_token_lifetime,
                        session_lifetime: settings.session_lifetime,
                    },
                }))
            }
            Self::Maskinporten(settings) => Ok(ClientSpec::Maskinporten(MaskinportenClient {
                metadata,
                spec: MaskinportenClientSpec {
                    secret_name,
                    client_name: settings.client_name.clone(),
                    scopes: MaskinportenScopes {
                        consumes: settings
                            .scopes
                            .iter()
                            .map(|name| ConsumedScope { name: name.clone() })
                            .collect(),
                    },
                },
            })),
            Self::EntraId(settings) => {
                first_host(app, self.kind(), hostnames)?;
                let paths: Vec<&str> = if settings.reply_paths.is_empty() {
                    vec![DEFAULT_REDIRECT_PATH]
                } else {
                    settings.reply_paths.iter().map(String::as_str).collect()
                };
                let reply_urls = hostnames
                    .iter()
                    .flat_map(|h| paths.iter().map(move |p| ReplyUrl { url: https(&h.host, p) }))
                    .collect();
                let claims = (!settings.groups.is_empty()).then(|| AzureAdClaims {
                    groups: settings
                        .groups
                        .iter()
                        .map(|id| AzureAdGroup { id: id.clone() })
                        .collect(),
                });
                Ok(ClientSpec::EntraId(AzureAdApplication {
                    metadata,
                    spec: AzureAdApplicationSpec {
                        secret_name,
                        reply_urls,
                        allow_all_users: settings.allow_all_users,
                        claims,
                    },
                }))
            }
        }
    }
}

fn first_host<'h>(app: &str, provider: &str, hostnames: &'h [Hostname]) -> Result<&'h str> {
    hostnames.first().map(|h| h.host.as_str()).ok_or_else(|| {
        Error::derivation_for(app, format!("{provider} requires at least one ingress hostname"))
    })
}

fn https(host: &str, path: &str) -> String {
    format!("https://{host}{path}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiperator_common::OperatorConfig;

    fn hosts(raw: &[&str]) -> Vec<Hostname> {
        let config = OperatorConfig::default();
        raw.iter().map(|h| Hostname::parse(h, &config).unwrap()).collect()
    }

    fn spec() -> ApplicationSpec {
        ApplicationSpec {
            idporten: Some(IdPortenSettings {
                enabled: true,
                ..Default::default()
            }),
            maskinporten: Some(MaskinportenSettings {
                enabled: false,
                ..Default::default()
            }),
            entra_id: Some(EntraIdSettings {
                enabled: true,
                groups: vec!["group-1".to_string()],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn only_enabled_providers_are_listed() {
        let spec = spec();
        let kinds: Vec<&str> = IdentityProvider::enabled(&spec).iter().map(|p| p.kind()).collect();
        assert_eq!(kinds, vec!["idporten", "entraid"]);
    }

    /// Story: enabling ID-porten requests a client whose redirect URIs follow the ingresses
    #[test]
    fn story_idporten_client_follows_ingresses() {
        let spec = spec();
        let provider = IdentityProvider::enabled(&spec)[0];

        let ClientSpec::IdPorten(client) = provider
            .desired_client_spec("my-app", "team-a", &hosts(&["a.kartverket.no", "b.kartverket.no"]))
            .unwrap()
        else {
            panic!("expected an IDPortenClient");
        };

        assert_eq!(client.spec.secret_name, "my-app-idporten");
        assert_eq!(client.spec.client_uri, "https://a.kartverket.no");
        assert_eq!(
            client.spec.redirect_uris,
            vec![
                "https://a.kartverket.no/oauth2/callback",
                "https://b.kartverket.no/oauth2/callback"
            ]
        );
        assert_eq!(
            client.spec.frontchannel_logout_uri.as_deref(),
            Some("https://a.kartverket.no/oauth2/logout")
        );
    }

    #[test]
    fn browser_providers_need_a_hostname() {
        let spec = spec();
        for provider in IdentityProvider::enabled(&spec) {
            assert!(provider.desired_client_spec("my-app", "team-a", &[]).is_err());
        }
    }

    #[test]
    fn maskinporten_needs_no_hostname() {
        let settings = MaskinportenSettings {
            enabled: true,
            scopes: vec!["skatteetaten:test".to_string()],
            ..Default::default()
        };
        let provider = IdentityProvider::Maskinporten(&settings);

        let ClientSpec::Maskinporten(client) = provider.desired_client_spec("a", "ns", &[]).unwrap() else {
            panic!("expected a MaskinportenClient");
        };
        assert_eq!(client.spec.scopes.consumes[0].name, "skatteetaten:test");
        assert!(provider.secret_key_names().contains(&"MASKINPORTEN_CLIENT_ID"));
        assert!(provider.jwt_rule().is_some());
    }

    #[test]
    fn entra_id_carries_groups() {
        let spec = spec();
        let provider = IdentityProvider::enabled(&spec)[1];

        let ClientSpec::EntraId(app) = provider
            .desired_client_spec("a", "ns", &hosts(&["a.intern"]))
            .unwrap()
        else {
            panic!("expected an AzureAdApplication");
        };
        assert_eq!(app.spec.reply_urls[0].url, "https://a.intern/oauth2/callback");
        assert_eq!(app.spec.claims.unwrap().groups[0].id, "group-1");
        assert!(provider.jwt_rule().is_none());
    }
}
