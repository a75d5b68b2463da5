//! Compiles a SKIPJob into a batch/v1 Job or CronJob, plus its PodMonitor

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, Job, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use skiperator_common::crd::{JobSettings, SkipJob, DEFAULT_BACKOFF_LIMIT};
use skiperator_common::mesh::DROPPED_ISTIO_METRICS;
use skiperator_common::resources::monitoring::{
    Endpoint, NamespaceSelector, PodMonitor, PodMonitorSpec, RelabelConfig,
};
use skiperator_common::naming::hash16;
use skiperator_common::{OperatorConfig, Result, APP_LABEL};
use skiperator_workload::{Desired, ParentIdentity, PodTemplateCompiler, WorkloadView};

/// Label carried by the Job, its pods and every Job a CronJob spawns
pub const SKIPJOB_NAME_LABEL: &str = "skiperator.kartverket.no/skipjob-name";

/// Annotation on a one-off Job with the hash of the pod template it was created from
pub const TEMPLATE_HASH_ANNOTATION: &str = "skiperator.kartverket.no/template-hash";

const DEFAULT_RESTART_POLICY: &str = "Never";
const SCRAPE_INTERVAL: &str = "60s";

/// The batch object a SKIPJob runs as
#[derive(Clone, Debug, PartialEq)]
pub enum Workload {
    /// One-off run
    Job(Job),
    /// Scheduled runs
    CronJob(CronJob),
}

/// Labels of the Job, its pods and spawned Jobs
pub fn job_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), name.to_string()),
        (SKIPJOB_NAME_LABEL.to_string(), name.to_string()),
    ])
}

/// Selector for the Jobs and pods of a SKIPJob
pub fn run_selector(name: &str) -> String {
    format!("{SKIPJOB_NAME_LABEL}={name}")
}

fn pod_template(job: &SkipJob, name: &str, config: &OperatorConfig) -> Result<PodTemplateSpec> {
    let container = &job.spec.container;
    let labels = job_labels(name);
    let view = WorkloadView {
        name,
        image: &container.image,
        command: &container.command,
        env: &container.env,
        env_from: &container.env_from,
        files_from: &container.files_from,
        resources: container.resources.as_ref(),
        liveness: container.liveness.as_ref(),
        readiness: container.readiness.as_ref(),
        startup: container.startup.as_ref(),
        gcp: container.gcp.as_ref(),
        pod_settings: container.pod_settings.as_ref(),
        priority: container.priority.unwrap_or_default(),
        labels: Some(&labels),
        restart_policy: Some(
            container
                .restart_policy
                .as_deref()
                .unwrap_or(DEFAULT_RESTART_POLICY),
        ),
        spread: false,
        ..Default::default()
    };
    PodTemplateCompiler::new(config).compile(&view)
}

fn job_spec(settings: Option<&JobSettings>, template: PodTemplateSpec) -> JobSpec {
    let settings = settings.cloned().unwrap_or_default();
    JobSpec {
        active_deadline_seconds: settings.active_deadline_seconds,
        backoff_limit: Some(settings.backoff_limit.unwrap_or(DEFAULT_BACKOFF_LIMIT)),
        suspend: settings.suspend,
        ttl_seconds_after_finished: settings.ttl_seconds_after_finished,
        template,
        ..Default::default()
    }
}

/// Desired Job or CronJob, chosen by whether a schedule is set
pub fn desired_workload(job: &SkipJob, config: &OperatorConfig) -> Result<Workload> {
    let id = ParentIdentity::of(job)?;
    let template = pod_template(job, &id.name, config)?;
    let spec = job_spec(job.spec.job.as_ref(), template);
    let metadata = ObjectMeta {
        name: Some(id.name.clone()),
        namespace: Some(id.namespace.clone()),
        labels: Some(job_labels(&id.name)),
        ..Default::default()
    };

    let Some(cron) = job.spec.cron.as_ref() else {
        let mut metadata = metadata;
        metadata.annotations = Some(BTreeMap::from([(
            TEMPLATE_HASH_ANNOTATION.to_string(),
            template_hash(&spec.template)?,
        )]));
        return Ok(Workload::Job(Job {
            metadata,
            spec: Some(spec),
            ..Default::default()
        }));
    };

    Ok(Workload::CronJob(CronJob {
        metadata,
        spec: Some(CronJobSpec {
            schedule: cron.schedule.clone(),
            time_zone: cron.time_zone.clone(),
            suspend: cron.suspend,
            starting_deadline_seconds: cron.starting_deadline_seconds,
            concurrency_policy: cron.concurrency_policy.clone(),
            job_template: JobTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(job_labels(&id.name)),
                    ..Default::default()
                }),
                spec: Some(spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }))
}

/// Hash of a Job's pod template as compiled, before the API server adds to it
pub fn template_hash(template: &PodTemplateSpec) -> Result<String> {
    Ok(hash16(&serde_json::to_string(template)?))
}

/// Template hash a Job was created with, if it carries one
pub fn recorded_template_hash(job: &Job) -> Option<&str> {
    job.metadata
        .annotations
        .as_ref()?
        .get(TEMPLATE_HASH_ANNOTATION)
        .map(String::as_str)
}

/// Keep the selector and pod labels the API server generates for a Job
pub fn keep_generated_selector(current: &Job, desired: &mut Job) {
    let (Some(current), Some(desired)) = (current.spec.as_ref(), desired.spec.as_mut()) else {
        return;
    };
    desired.selector = current.selector.clone();
    desired.manual_selector = current.manual_selector;

    let generated = current
        .template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    let labels = desired
        .template
        .metadata
        .get_or_insert_with(ObjectMeta::default)
        .labels
        .get_or_insert_with(BTreeMap::new);
    for (key, value) in generated {
        labels.entry(key).or_insert(value);
    }
}

/// Scrape configuration for the SKIPJob's pods
pub fn desired_pod_monitor(job: &SkipJob) -> Result<Desired<PodMonitor>> {
    let id = ParentIdentity::of(job)?;
    let Some(prometheus) = job.spec.prometheus.as_ref() else {
        return Ok(Desired::Remove(id.name));
    };

    let metric_relabelings = if prometheus.allow_all_metrics {
        Vec::new()
    } else {
        vec![RelabelConfig {
            action: "drop".to_string(),
            source_labels: vec!["__name__".to_string()],
            regex: Some(DROPPED_ISTIO_METRICS.to_string()),
        }]
    };

    Ok(Desired::Apply(PodMonitor {
        metadata: ObjectMeta {
            name: Some(id.name.clone()),
            namespace: Some(id.namespace.clone()),
            labels: Some(job_labels(&id.name)),
            ..Default::default()
        },
        spec: PodMonitorSpec {
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(
                    SKIPJOB_NAME_LABEL.to_string(),
                    id.name.clone(),
                )])),
                ..Default::default()
            },
            namespace_selector: Some(NamespaceSelector {
                match_names: vec![id.namespace],
            }),
            pod_metrics_endpoints: vec![Endpoint {
                target_port: Some(IntOrString::Int(prometheus.port)),
                path: Some(prometheus.path.clone()),
                interval: Some(SCRAPE_INTERVAL.to_string()),
                metric_relabelings,
            }],
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiperator_common::crd::{ContainerSettings, CronSettings, PrometheusConfig, SkipJobSpec};

    fn skip_job(spec: SkipJobSpec) -> SkipJob {
        let mut job = SkipJob::new("backup", spec);
        job.metadata.namespace = Some("team-a".to_string());
        job.metadata.uid = Some("uid-1".to_string());
        job
    }

    fn container() -> ContainerSettings {
        ContainerSettings {
            image: "ghcr.io/kartverket/backup:1.0".to_string(),
            command: vec!["/backup".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn one_off_job_records_its_template_hash() {
        let compile = |image: &str| {
            let mut settings = container();
            settings.image = image.to_string();
            let job = skip_job(SkipJobSpec {
                container: settings,
                ..Default::default()
            });
            match desired_workload(&job, &OperatorConfig::default()).unwrap() {
                Workload::Job(batch) => batch,
                Workload::CronJob(_) => panic!("expected a Job"),
            }
        };

        let v1 = compile("ghcr.io/kartverket/backup:1.0");
        let hash = recorded_template_hash(&v1).unwrap().to_string();
        assert_eq!(hash, template_hash(&v1.spec.as_ref().unwrap().template).unwrap());
        assert_eq!(recorded_template_hash(&compile("ghcr.io/kartverket/backup:1.0")), Some(hash.as_str()));
        assert_ne!(recorded_template_hash(&compile("ghcr.io/kartverket/backup:2.0")), Some(hash.as_str()));
        assert_eq!(recorded_template_hash(&Job::default()), None);
    }

    #[test]
    fn one_off_job_carries_run_label_and_restart_policy() {
        let job = skip_job(SkipJobSpec {
            container: container(),
            ..Default::default()
        });
        let Workload::Job(batch) = desired_workload(&job, &OperatorConfig::default()).unwrap() else {
            panic!("expected a Job");
        };
        let spec = batch.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(DEFAULT_BACKOFF_LIMIT));

        let template_meta = spec.template.metadata.unwrap();
        assert_eq!(template_meta.labels.unwrap()[SKIPJOB_NAME_LABEL], "backup");
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        assert!(pod.topology_spread_constraints.is_none());
        assert_eq!(pod.containers[0].name, "backup");
    }

    /// Story: a schedule turns the SKIPJob into a CronJob whose Jobs stay traceable
    #[test]
    fn story_schedule_produces_cronjob() {
        let job = skip_job(SkipJobSpec {
            container: ContainerSettings {
                restart_policy: Some("OnFailure".to_string()),
                ..container()
            },
            cron: Some(CronSettings {
                schedule: "0 3 * * *".to_string(),
                time_zone: Some("Europe/Oslo".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        let Workload::CronJob(cron) = desired_workload(&job, &OperatorConfig::default()).unwrap() else {
            panic!("expected a CronJob");
        };
        let spec = cron.spec.unwrap();
        assert_eq!(spec.schedule, "0 3 * * *");
        assert_eq!(spec.time_zone.as_deref(), Some("Europe/Oslo"));

        let template = spec.job_template;
        assert_eq!(template.metadata.unwrap().labels.unwrap()[SKIPJOB_NAME_LABEL], "backup");
        let pod = template.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("OnFailure"));
    }

    #[test]
    fn generated_selector_survives_updates() {
        let selector = LabelSelector {
            match_labels: Some(BTreeMap::from([(
                "batch.kubernetes.io/controller-uid".to_string(),
                "abc".to_string(),
            )])),
            ..Default::default()
        };
        let current = Job {
            spec: Some(JobSpec {
                selector: Some(selector.clone()),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(BTreeMap::from([(
                            "batch.kubernetes.io/controller-uid".to_string(),
                            "abc".to_string(),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        let Workload::Job(mut desired) = desired_workload(
            &skip_job(SkipJobSpec {
                container: container(),
                ..Default::default()
            }),
            &OperatorConfig::default(),
        )
        .unwrap() else {
            panic!("expected a Job");
        };

        keep_generated_selector(&current, &mut desired);
        let spec = desired.spec.unwrap();
        assert_eq!(spec.selector, Some(selector));
        let labels = spec.template.metadata.unwrap().labels.unwrap();
        assert_eq!(labels["batch.kubernetes.io/controller-uid"], "abc");
        assert_eq!(labels[SKIPJOB_NAME_LABEL], "backup");
    }

    #[test]
    fn pod_monitor_follows_prometheus_settings() {
        let without = skip_job(SkipJobSpec {
            container: container(),
            ..Default::default()
        });
        assert!(matches!(
            desired_pod_monitor(&without).unwrap(),
            Desired::Remove(name) if name == "backup"
        ));

        let with = skip_job(SkipJobSpec {
            container: container(),
            prometheus: Some(PrometheusConfig {
                port: 9090,
                path: "/metrics".to_string(),
                allow_all_metrics: true,
            }),
            ..Default::default()
        });
        let Desired::Apply(monitor) = desired_pod_monitor(&with).unwrap() else {
            panic!("expected a PodMonitor");
        };
        let endpoint = &monitor.spec.pod_metrics_endpoints[0];
        assert_eq!(endpoint.target_port, Some(IntOrString::Int(9090)));
        assert!(endpoint.metric_relabelings.is_empty());
    }
}
