//! Compute objects of an Application: Deployment, Service,
//! HorizontalPodAutoscaler and PodDisruptionBudget

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
    MetricSpec, MetricTarget, ResourceMetricSource,
};
use k8s_openapi::api::core::v1::{ContainerPort, Service, ServicePort, ServiceSpec};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use skiperator_common::crd::{Application, ApplicationSpec, Strategy};
use skiperator_common::mesh::MERGE_METRICS_ANNOTATION;
use skiperator_common::{OperatorConfig, Result, APP_LABEL};
use skiperator_workload::{
    Desired, IdentityProvider, ParentIdentity, PodTemplateCompiler, WorkloadView,
};

/// Name of the main container and Service port
pub const MAIN_PORT_NAME: &str = "http";

/// Name of the metrics port when it differs from every other port
pub const METRICS_PORT_NAME: &str = "metrics";

const REVISION_HISTORY_LIMIT: i32 = 2;

/// `app=<name>` plus the Application's own labels
pub fn app_labels(name: &str, spec: &ApplicationSpec) -> BTreeMap<String, String> {
    let mut labels = spec.labels.clone();
    labels.insert(APP_LABEL.to_string(), name.to_string());
    labels
}

/// Selector matching the Application's pods
pub fn pod_selector(name: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([(APP_LABEL.to_string(), name.to_string())])),
        ..Default::default()
    }
}

fn metadata(id: &ParentIdentity, spec: &ApplicationSpec) -> ObjectMeta {
    ObjectMeta {
        name: Some(id.name.clone()),
        namespace: Some(id.namespace.clone()),
        labels: Some(app_labels(&id.name, spec)),
        ..Default::default()
    }
}

/// Metrics port, when it is not already exposed as another port
fn extra_metrics_port(spec: &ApplicationSpec) -> Option<i32> {
    let port = spec.prometheus.as_ref()?.port;
    let taken = port == spec.port || spec.additional_ports.iter().any(|p| p.port == port);
    (!taken).then_some(port)
}

fn container_ports(spec: &ApplicationSpec) -> Vec<ContainerPort> {
    let mut ports = vec![ContainerPort {
        name: Some(MAIN_PORT_NAME.to_string()),
        container_port: spec.port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }];
    ports.extend(spec.additional_ports.iter().map(|p| ContainerPort {
        name: Some(p.name.clone()),
        container_port: p.port,
        protocol: Some(p.protocol.clone()),
        ..Default::default()
    }));
    if let Some(port) = extra_metrics_port(spec) {
        ports.push(ContainerPort {
            name: Some(METRICS_PORT_NAME.to_string()),
            container_port: port,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
    }
    ports
}

// =============================================================================
// Deployment
// =============================================================================

/// Desired Deployment.
///
/// With autoscaling the replica count is left to the HorizontalPodAutoscaler;
/// see [`keep_autoscaled_replicas`].
pub fn desired_deployment(app: &Application, config: &OperatorConfig) -> Result<Desired<Deployment>> {
    let id = ParentIdentity::of(app)?;
    let spec = &app.spec;

    let view = WorkloadView {
        name: &id.name,
        image: &spec.image,
        command: &spec.command,
        ports: container_ports(spec),
        env: &spec.env,
        env_from: &spec.env_from,
        managed_secrets: IdentityProvider::enabled(spec)
            .iter()
            .map(|p| p.secret_name(&id.name))
            .collect(),
        files_from: &spec.files_from,
        resources: spec.resources.as_ref(),
        liveness: spec.liveness.as_ref(),
        readiness: spec.readiness.as_ref(),
        startup: spec.startup.as_ref(),
        gcp: spec.gcp.as_ref(),
        pod_settings: spec.pod_settings.as_ref(),
        priority: spec.priority.unwrap_or_default(),
        labels: Some(&spec.labels),
        restart_policy: None,
        spread: true,
    };
    let mut template = PodTemplateCompiler::new(config).compile(&view)?;
    if spec.prometheus.is_some() {
        // Scraped through the ServiceMonitor, not the sidecar
        if let Some(meta) = template.metadata.as_mut() {
            meta.annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(MERGE_METRICS_ANNOTATION.to_string(), "false".to_string());
        }
    }

    let replicas = spec.replicas();
    Ok(Desired::Apply(Deployment {
        metadata: metadata(&id, spec),
        spec: Some(DeploymentSpec {
            replicas: (!replicas.autoscales()).then_some(replicas.min),
            selector: pod_selector(&id.name),
            template,
            strategy: Some(deployment_strategy(spec.strategy.unwrap_or_default())),
            revision_history_limit: Some(REVISION_HISTORY_LIMIT),
            ..Default::default()
        }),
        ..Default::default()
    }))
}

fn deployment_strategy(strategy: Strategy) -> DeploymentStrategy {
    match strategy {
        Strategy::RollingUpdate => DeploymentStrategy {
            type_: Some(strategy.to_string()),
            rolling_update: Some(RollingUpdateDeployment {
                max_surge: Some(IntOrString::String("25%".to_string())),
                max_unavailable: Some(IntOrString::Int(0)),
            }),
        },
        Strategy::Recreate => DeploymentStrategy {
            type_: Some(strategy.to_string()),
            rolling_update: None,
        },
    }
}

/// Keep the replica count chosen by the autoscaler
pub fn keep_autoscaled_replicas(current: &Deployment, desired: &mut Deployment) {
    if let Some(spec) = desired.spec.as_mut() {
        if spec.replicas.is_none() {
            spec.replicas = current.spec.as_ref().and_then(|s| s.replicas);
        }
    }
}

// =============================================================================
// Service
// =============================================================================

/// Desired ClusterIP Service exposing the main, additional and metrics ports
pub fn desired_service(app: &Application) -> Result<Desired<Service>> {
    let id = ParentIdentity::of(app)?;
    let spec = &app.spec;

    let ports = container_ports(spec)
        .into_iter()
        .map(|p| ServicePort {
            name: p.name,
            port: p.container_port,
            target_port: Some(IntOrString::Int(p.container_port)),
            protocol: p.protocol,
            ..Default::default()
        })
        .collect();

    Ok(Desired::Apply(Service {
        metadata: metadata(&id, spec),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(BTreeMap::from([(APP_LABEL.to_string(), id.name.clone())])),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }))
}

/// Keep the cluster IPs allocated by the API server
pub fn keep_cluster_ips(current: &Service, desired: &mut Service) {
    if let (Some(current), Some(desired)) = (current.spec.as_ref(), desired.spec.as_mut()) {
        desired.cluster_ip = current.cluster_ip.clone();
        desired.cluster_ips = current.cluster_ips.clone();
    }
}

// =============================================================================
// Autoscaling and disruption
// =============================================================================

/// Desired HorizontalPodAutoscaler; removed when the replica count is fixed
pub fn desired_autoscaler(app: &Application) -> Result<Desired<HorizontalPodAutoscaler>> {
    let id = ParentIdentity::of(app)?;
    let replicas = app.spec.replicas();
    if !replicas.autoscales() {
        return Ok(Desired::Remove(id.name));
    }

    Ok(Desired::Apply(HorizontalPodAutoscaler {
        metadata: metadata(&id, &app.spec),
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name: id.name.clone(),
            },
            min_replicas: Some(replicas.min),
            max_replicas: replicas.max,
            metrics: Some(vec![MetricSpec {
                type_: "Resource".to_string(),
                resource: Some(ResourceMetricSource {
                    name: "cpu".to_string(),
                    target: MetricTarget {
                        type_: "Utilization".to_string(),
                        average_utilization: Some(replicas.target_cpu_utilization),
                        ..Default::default()
                    },
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }))
}

/// Desired PodDisruptionBudget; removed when disabled.
///
/// Half the pods must stay up when more than one is wanted. On API servers
/// that support it, unhealthy pods may always be evicted so a broken rollout
/// cannot block node drains.
pub fn desired_disruption_budget(
    app: &Application,
    config: &OperatorConfig,
) -> Result<Desired<PodDisruptionBudget>> {
    let id = ParentIdentity::of(app)?;
    if !app.spec.pdb_enabled() {
        return Ok(Desired::Remove(id.name));
    }

    let min_available = if app.spec.replicas().min > 1 {
        IntOrString::String("50%".to_string())
    } else {
        IntOrString::Int(0)
    };

    Ok(Desired::Apply(PodDisruptionBudget {
        metadata: metadata(&id, &app.spec),
        spec: Some(PodDisruptionBudgetSpec {
            selector: Some(pod_selector(&id.name)),
            min_available: Some(min_available),
            unhealthy_pod_eviction_policy: config
                .server_version
                .supports_unhealthy_pod_eviction_policy()
                .then(|| "AlwaysAllow".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }))
}
