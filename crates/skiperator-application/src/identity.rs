//! Identity provider client registrations of an Application

use std::sync::Arc;

use async_trait::async_trait;
use skiperator_common::crd::Application;
use skiperator_common::resources::identity::{AzureAdApplication, IdPortenClient, MaskinportenClient};
use skiperator_common::{OperatorConfig, Result, SkiperatorStatus};
use skiperator_network::parse_hostnames;
use skiperator_reconcile::ownership::tag;
use skiperator_reconcile::{ReconcileStep, StepOutcome};
use skiperator_workload::steps::with_parent;
use skiperator_workload::{ClientSpec, IdentityProvider, ParentIdentity, StepContext};
use tracing::debug;

/// Desired client objects for every enabled provider
pub fn desired_clients(app: &Application, config: &OperatorConfig) -> Result<Vec<ClientSpec>> {
    let id = ParentIdentity::of(app)?;
    let providers = IdentityProvider::enabled(&app.spec);
    if providers.is_empty() {
        return Ok(Vec::new());
    }
    let hostnames =
        parse_hostnames(&app.spec.ingresses, config).map_err(|e| with_parent(e, &id.name))?;
    providers
        .iter()
        .map(|p| p.desired_client_spec(&id.name, &id.namespace, &hostnames))
        .collect()
}

/// Writes one client per enabled provider and removes the clients of
/// providers that were switched off
pub struct IdentityProviderClientsStep {
    ctx: Arc<StepContext>,
}

impl IdentityProviderClientsStep {
    /// Create the step
    pub fn new(ctx: Arc<StepContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl ReconcileStep<Application> for IdentityProviderClientsStep {
    fn name(&self) -> &'static str {
        "IdentityProviderClients"
    }

    async fn reconcile(&self, app: &Application, _status: &mut SkiperatorStatus) -> Result<StepOutcome> {
        let id = ParentIdentity::of(app)?;
        let (mut idporten, mut maskinporten, mut entra_id) = (false, false, false);

        for client in desired_clients(app, &self.ctx.config)? {
            match client {
                ClientSpec::IdPorten(mut c) => {
                    idporten = true;
                    tag(app, &mut c)?;
                    self.ctx.sync.sync(c).await?;
                }
                ClientSpec::Maskinporten(mut c) => {
                    maskinporten = true;
                    tag(app, &mut c)?;
                    self.ctx.sync.sync(c).await?;
                }
                ClientSpec::EntraId(mut c) => {
                    entra_id = true;
                    tag(app, &mut c)?;
                    self.ctx.sync.sync(c).await?;
                }
            }
        }

        let sync = &self.ctx.sync;
        if !idporten {
            sync.delete_owned::<IdPortenClient>(&id.namespace, &id.name, &id.uid).await?;
        }
        if !maskinporten {
            sync.delete_owned::<MaskinportenClient>(&id.namespace, &id.name, &id.uid).await?;
        }
        if !entra_id {
            sync.delete_owned::<AzureAdApplication>(&id.namespace, &id.name, &id.uid).await?;
        }
        debug!(idporten, maskinporten, entra_id, "identity provider clients synced");
        Ok(StepOutcome::Synced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiperator_common::crd::{ApplicationSpec, IdPortenSettings, MaskinportenSettings};

    fn app(spec: ApplicationSpec) -> Application {
        let mut app = Application::new("my-app", spec);
        app.metadata.namespace = Some("team-a".to_string());
        app.metadata.uid = Some("uid-1".to_string());
        app
    }

    #[test]
    fn no_providers_means_no_clients() {
        let clients = desired_clients(&app(ApplicationSpec::default()), &OperatorConfig::default()).unwrap();
        assert!(clients.is_empty());
    }

    /// Story: enabling ID-porten without an ingress is reported against the Application
    #[test]
    fn story_idporten_without_ingress_fails_derivation() {
        let spec = ApplicationSpec {
            idporten: Some(IdPortenSettings {
                enabled: true,
                ..Default::default()
            }),
            maskinporten: Some(MaskinportenSettings {
                enabled: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = desired_clients(&app(spec), &OperatorConfig::default()).unwrap_err();
        assert!(err.to_string().contains("my-app"));
        assert!(err.to_string().contains("idporten"));
    }

    #[test]
    fn clients_are_named_after_the_application() {
        let spec = ApplicationSpec {
            ingresses: vec!["my-app.kartverket.no".to_string()],
            maskinporten: Some(MaskinportenSettings {
                enabled: true,
                scopes: vec!["kartverket:read".to_string()],
                ..Default::default()
            }),
            ..Default::default()
        };
        let clients = desired_clients(&app(spec), &OperatorConfig::default()).unwrap();
        let [ClientSpec::Maskinporten(client)] = clients.as_slice() else {
            panic!("expected one MaskinportenClient");
        };
        assert_eq!(client.metadata.name.as_deref(), Some("my-app"));
        assert_eq!(client.spec.secret_name, "my-app-maskinporten");
    }
}
