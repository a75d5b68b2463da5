//! Pod template compiler shared by Application (Deployment) and SKIPJob
//! (Job / CronJob).
//!
//! Both parents describe a single container plus pod level settings; the
//! [`WorkloadView`] borrows those fields so one compiler builds the template
//! with the same security defaults, volumes and mesh annotations.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMapEnvSource, ConfigMapProjection, ConfigMapVolumeSource, Container,
    ContainerPort, EmptyDirVolumeSource, EnvFromSource, EnvVar, HTTPGetAction, KeyToPath,
    LocalObjectReference, PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec,
    PodTemplateSpec, Probe as K8sProbe, ProjectedVolumeSource, ResourceRequirements,
    SeccompProfile, SecretEnvSource, SecretVolumeSource, SecurityContext,
    ServiceAccountTokenProjection, TCPSocketAction, TopologySpreadConstraint, Volume,
    VolumeMount, VolumeProjection,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use skiperator_common::crd::{EnvFrom, FilesFrom, GcpSettings, PodSettings, Priority, Probe};
use skiperator_common::mesh::{HOLD_APPLICATION_ANNOTATION, HOLD_APPLICATION_VALUE};
use skiperator_common::{Error, OperatorConfig, Result, APP_LABEL};

use crate::gcp::{self, GCP_CREDENTIALS_FILE, GCP_TOKEN_DIR};

/// User and group every workload container runs as
pub const WORKLOAD_UID: i64 = 150;

/// Writable scratch directory mounted into every container
const TMP_VOLUME: &str = "tmp";

/// Borrowed view of the container a parent describes
#[derive(Clone, Debug, Default)]
pub struct WorkloadView<'a> {
    /// Parent name; used for the container, labels and ServiceAccount
    pub name: &'a str,
    /// Container image
    pub image: &'a str,
    /// Container command
    pub command: &'a [String],
    /// Container ports
    pub ports: Vec<ContainerPort>,
    /// Literal environment
    pub env: &'a [EnvVar],
    /// ConfigMaps and Secrets exposed as environment
    pub env_from: &'a [EnvFrom],
    /// Secrets exposed as environment that the operator manages
    pub managed_secrets: Vec<String>,
    /// Files mounted from ConfigMaps, Secrets and volumes
    pub files_from: &'a [FilesFrom],
    /// Resource requests and limits
    pub resources: Option<&'a ResourceRequirements>,
    /// Liveness probe
    pub liveness: Option<&'a Probe>,
    /// Readiness probe
    pub readiness: Option<&'a Probe>,
    /// Startup probe
    pub startup: Option<&'a Probe>,
    /// GCP workload identity
    pub gcp: Option<&'a GcpSettings>,
    /// Pod annotations and scheduling settings
    pub pod_settings: Option<&'a PodSettings>,
    /// Scheduling priority
    pub priority: Priority,
    /// Extra pod labels
    pub labels: Option<&'a BTreeMap<String, String>>,
    /// Pod restart policy; `None` leaves the Kubernetes default
    pub restart_policy: Option<&'a str>,
    /// Spread pods across nodes and zones
    pub spread: bool,
}

/// Compiles a [`WorkloadView`] into a pod template
pub struct PodTemplateCompiler<'a> {
    config: &'a OperatorConfig,
}

impl<'a> PodTemplateCompiler<'a> {
    /// Create a compiler for the given operator configuration
    pub fn new(config: &'a OperatorConfig) -> Self {
        Self { config }
    }

    /// Build the pod template
    pub fn compile(&self, view: &WorkloadView<'_>) -> Result<PodTemplateSpec> {
        let mut volumes = vec![Volume {
            name: TMP_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }];
        let mut mounts = vec![VolumeMount {
            name: TMP_VOLUME.to_string(),
            mount_path: "/tmp".to_string(),
            ..Default::default()
        }];

        for files in view.files_from {
            let (volume, mount) = file_volume(view.name, files)?;
            if !volumes.iter().any(|v| v.name == volume.name) {
                volumes.push(volume);
            }
            mounts.push(mount);
        }

        let mut env = view.env.to_vec();
        if let Some(service_account) = view.gcp.and_then(GcpSettings::service_account) {
            volumes.push(gcp_volume(view.name));
            mounts.push(VolumeMount {
                name: gcp::VOLUME_NAME.to_string(),
                mount_path: GCP_TOKEN_DIR.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
            env.push(EnvVar {
                name: "GOOGLE_APPLICATION_CREDENTIALS".to_string(),
                value: Some(format!("{GCP_TOKEN_DIR}/{GCP_CREDENTIALS_FILE}")),
                ..Default::default()
            });
            tracing::trace!(service_account, "mounting gcp workload identity");
        }

        let container = Container {
            name: view.name.to_string(),
            image: Some(view.image.to_string()),
            image_pull_policy: Some("Always".to_string()),
            command: (!view.command.is_empty()).then(|| view.command.to_vec()),
            ports: (!view.ports.is_empty()).then(|| view.ports.clone()),
            env: (!env.is_empty()).then_some(env),
            env_from: env_from(view),
            resources: view.resources.cloned(),
            security_context: Some(container_security_context()),
            volume_mounts: Some(mounts),
            liveness_probe: view.liveness.map(probe),
            readiness_probe: view.readiness.map(probe),
            startup_probe: view.startup.map(probe),
            ..Default::default()
        };

        let mut labels = BTreeMap::from([(APP_LABEL.to_string(), view.name.to_string())]);
        if let Some(extra) = view.labels {
            labels.extend(extra.clone());
        }

        let mut annotations = BTreeMap::from([(
            HOLD_APPLICATION_ANNOTATION.to_string(),
            HOLD_APPLICATION_VALUE.to_string(),
        )]);
        if let Some(settings) = view.pod_settings {
            annotations.extend(settings.annotations.clone());
        }

        let spread = view.spread
            && !view
                .pod_settings
                .is_some_and(|s| s.disable_pod_spread_topology_constraints);

        Ok(PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![container],
                volumes: Some(volumes),
                service_account_name: Some(view.name.to_string()),
                security_context: Some(pod_security_context()),
                image_pull_secrets: self.image_pull_secrets(),
                priority_class_name: Some(view.priority.class_name().to_string()),
                restart_policy: view.restart_policy.map(String::from),
                termination_grace_period_seconds: view
                    .pod_settings
                    .and_then(|s| s.termination_grace_period_seconds),
                topology_spread_constraints: spread.then(|| topology_spread(view.name)),
                ..Default::default()
            }),
        })
    }

    fn image_pull_secrets(&self) -> Option<Vec<LocalObjectReference>> {
        if self.config.image_pull_secrets.is_empty() {
            return None;
        }
        Some(
            self.config
                .image_pull_secrets
                .iter()
                .map(|name| LocalObjectReference { name: name.clone() })
                .collect(),
        )
    }
}

/// Container security defaults: non-root, read-only root filesystem, no
/// privilege escalation, all capabilities dropped.
pub fn container_security_context() -> SecurityContext {
    SecurityContext {
        run_as_user: Some(WORKLOAD_UID),
        run_as_group: Some(WORKLOAD_UID),
        run_as_non_root: Some(true),
        privileged: Some(false),
        allow_privilege_escalation: Some(false),
        read_only_root_filesystem: Some(true),
        capabilities: Some(Capabilities {
            add: Some(vec!["NET_BIND_SERVICE".to_string()]),
            drop: Some(vec!["ALL".to_string()]),
        }),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod_security_context() -> PodSecurityContext {
    PodSecurityContext {
        fs_group: Some(WORKLOAD_UID),
        supplemental_groups: Some(vec![WORKLOAD_UID]),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env_from(view: &WorkloadView<'_>) -> Option<Vec<EnvFromSource>> {
    let mut sources: Vec<EnvFromSource> = view
        .env_from
        .iter()
        .flat_map(|e| {
            let config_map = e.config_map.as_ref().map(|name| EnvFromSource {
                config_map_ref: Some(ConfigMapEnvSource {
                    name: name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            });
            let secret = e.secret.as_ref().map(|name| EnvFromSource {
                secret_ref: Some(SecretEnvSource {
                    name: name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            });
            config_map.into_iter().chain(secret)
        })
        .collect();

    sources.extend(view.managed_secrets.iter().map(|name| EnvFromSource {
        secret_ref: Some(SecretEnvSource {
            name: name.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }));

    (!sources.is_empty()).then_some(sources)
}

fn file_volume(parent: &str, files: &FilesFrom) -> Result<(Volume, VolumeMount)> {
    let source = files.source_name().ok_or_else(|| {
        Error::derivation_for(
            parent,
            format!("filesFrom entry for {} names no source", files.mount_path),
        )
    })?;

    let mut volume = Volume {
        name: source.to_string(),
        ..Default::default()
    };
    if let Some(name) = &files.config_map {
        volume.config_map = Some(ConfigMapVolumeSource {
            name: name.clone(),
            ..Default::default()
        });
    } else if let Some(name) = &files.secret {
        volume.secret = Some(SecretVolumeSource {
            secret_name: Some(name.clone()),
            ..Default::default()
        });
    } else if files.empty_dir.is_some() {
        volume.empty_dir = Some(EmptyDirVolumeSource::default());
    } else if let Some(claim) = &files.persistent_volume_claim {
        volume.persistent_volume_claim = Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim.clone(),
            ..Default::default()
        });
    }

    let mount = VolumeMount {
        name: source.to_string(),
        mount_path: files.mount_path.clone(),
        ..Default::default()
    };
    Ok((volume, mount))
}

fn gcp_volume(parent: &str) -> Volume {
    Volume {
        name: gcp::VOLUME_NAME.to_string(),
        projected: Some(ProjectedVolumeSource {
            default_mode: Some(0o644),
            sources: Some(vec![
                VolumeProjection {
                    service_account_token: Some(ServiceAccountTokenProjection {
                        audience: Some(gcp::TOKEN_AUDIENCE.to_string()),
                        expiration_seconds: Some(172_800),
                        path: gcp::TOKEN_FILE.to_string(),
                    }),
                    ..Default::default()
                },
                VolumeProjection {
                    config_map: Some(ConfigMapProjection {
                        name: gcp::config_map_name(parent),
                        items: Some(vec![KeyToPath {
                            key: gcp::CONFIG_KEY.to_string(),
                            path: GCP_CREDENTIALS_FILE.to_string(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            ]),
        }),
        ..Default::default()
    }
}

fn probe(p: &Probe) -> K8sProbe {
    let port = IntOrString::Int(p.port);
    let (http_get, tcp_socket) = match &p.path {
        Some(path) => (
            Some(HTTPGetAction {
                path: Some(path.clone()),
                port,
                ..Default::default()
            }),
            None,
        ),
        None => (
            None,
            Some(TCPSocketAction {
                port,
                ..Default::default()
            }),
        ),
    };
    K8sProbe {
        http_get,
        tcp_socket,
        initial_delay_seconds: Some(p.initial_delay),
        period_seconds: Some(p.period),
        timeout_seconds: Some(p.timeout),
        failure_threshold: Some(p.failure_threshold),
        success_threshold: Some(p.success_threshold),
        ..Default::default()
    }
}

fn topology_spread(name: &str) -> Vec<TopologySpreadConstraint> {
    ["kubernetes.io/hostname", "topology.kubernetes.io/zone"]
        .into_iter()
        .map(|key| TopologySpreadConstraint {
            max_skew: 1,
            topology_key: key.to_string(),
            when_unsatisfiable: "ScheduleAnyway".to_string(),
            label_selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([(APP_LABEL.to_string(), name.to_string())])),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiperator_common::crd::GcpAuth;

    fn view<'a>() -> WorkloadView<'a> {
        WorkloadView {
            name: "my-app",
            image: "ghcr.io/kartverket/app:1",
            spread: true,
            ..Default::default()
        }
    }

    fn spec(template: &PodTemplateSpec) -> &PodSpec {
        template.spec.as_ref().unwrap()
    }

    #[test]
    fn containers_run_locked_down() {
        let config = OperatorConfig::default();
        let template = PodTemplateCompiler::new(&config).compile(&view()).unwrap();

        let container = &spec(&template).containers[0];
        let sc = container.security_context.as_ref().unwrap();
        assert_eq!(sc.read_only_root_filesystem, Some(true));
        assert_eq!(sc.allow_privilege_escalation, Some(false));
        assert_eq!(sc.run_as_user, Some(WORKLOAD_UID));
        assert_eq!(
            sc.capabilities.as_ref().unwrap().drop,
            Some(vec!["ALL".to_string()])
        );
        let tmp = &container.volume_mounts.as_ref().unwrap()[0];
        assert_eq!(tmp.mount_path, "/tmp");
    }

    #[test]
    fn pods_are_labelled_and_hold_for_sidecar() {
        let config = OperatorConfig::default();
        let template = PodTemplateCompiler::new(&config).compile(&view()).unwrap();

        let meta = template.metadata.as_ref().unwrap();
        assert_eq!(meta.labels.as_ref().unwrap()[APP_LABEL], "my-app");
        assert_eq!(
            meta.annotations.as_ref().unwrap()[HOLD_APPLICATION_ANNOTATION],
            HOLD_APPLICATION_VALUE
        );
        let pod = spec(&template);
        assert_eq!(pod.service_account_name.as_deref(), Some("my-app"));
        assert_eq!(pod.priority_class_name.as_deref(), Some("skip-medium"));
        assert_eq!(pod.image_pull_secrets.as_ref().unwrap()[0].name, "github-auth");
        assert_eq!(pod.topology_spread_constraints.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn spread_can_be_disabled() {
        let config = OperatorConfig::default();
        let settings = PodSettings {
            disable_pod_spread_topology_constraints: true,
            ..Default::default()
        };
        let mut v = view();
        v.pod_settings = Some(&settings);

        let template = PodTemplateCompiler::new(&config).compile(&v).unwrap();
        assert!(spec(&template).topology_spread_constraints.is_none());
    }

    #[test]
    fn probes_use_http_with_path_and_tcp_without() {
        let config = OperatorConfig::default();
        let http = Probe {
            path: Some("/health".to_string()),
            port: 8080,
            ..Default::default()
        };
        let tcp = Probe {
            port: 8080,
            ..Default::default()
        };
        let mut v = view();
        v.liveness = Some(&http);
        v.readiness = Some(&tcp);

        let template = PodTemplateCompiler::new(&config).compile(&v).unwrap();

        let container = &spec(&template).containers[0];
        assert!(container.liveness_probe.as_ref().unwrap().http_get.is_some());
        assert!(container.readiness_probe.as_ref().unwrap().tcp_socket.is_some());
    }

    #[test]
    fn env_from_includes_managed_secrets() {
        let config = OperatorConfig::default();
        let env_from = vec![EnvFrom {
            config_map: Some("settings".to_string()),
            secret: None,
        }];
        let mut v = view();
        v.env_from = &env_from;
        v.managed_secrets = vec!["my-app-idporten".to_string()];

        let template = PodTemplateCompiler::new(&config).compile(&v).unwrap();

        let sources = spec(&template).containers[0].env_from.clone().unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].config_map_ref.as_ref().unwrap().name, "settings");
        assert_eq!(sources[1].secret_ref.as_ref().unwrap().name, "my-app-idporten");
    }

    #[test]
    fn gcp_identity_mounts_credentials() {
        let config = OperatorConfig::default();
        let gcp = GcpSettings {
            auth: Some(GcpAuth {
                service_account: "app@project.iam.gserviceaccount.com".to_string(),
            }),
        };
        let mut v = view();
        v.gcp = Some(&gcp);

        let template = PodTemplateCompiler::new(&config).compile(&v).unwrap();

        let pod = spec(&template);
        assert!(pod
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .any(|vol| vol.name == gcp::VOLUME_NAME && vol.projected.is_some()));
        let env = pod.containers[0].env.as_ref().unwrap();
        assert_eq!(env[0].name, "GOOGLE_APPLICATION_CREDENTIALS");
    }

    #[test]
    fn files_from_without_source_is_rejected() {
        let config = OperatorConfig::default();
        let files = vec![FilesFrom {
            mount_path: "/data".to_string(),
            ..Default::default()
        }];
        let mut v = view();
        v.files_from = &files;

        assert!(PodTemplateCompiler::new(&config).compile(&v).is_err());
    }
}
