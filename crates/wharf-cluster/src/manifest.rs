//! Typed workload manifests and their construction from a task.
//!
//! Field names follow the wire format (camelCase); only the fields
//! wharf actually sets are modeled.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use wharf_core::run::TaskRun;

pub const RESTART_NEVER: &str = "Never";
pub const RESTART_ON_FAILURE: &str = "OnFailure";

/// GPU resource key on nodes and pod limits.
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";

/// Environment handed to every container so in-container tooling can
/// find its own jobs-db entry.
pub const TASK_ID_ENV: &str = "WHARF_TASK_ID";
pub const CRED_ENV: &str = "WHARF_CRED";
pub const CRED_PATH: &str = "/etc/wharf/wharf-cred.yml";

/// Image pull secret every workload references.
pub const REGISTRY_SECRET: &str = "registry";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMountSpec {
    pub name: String,
    pub mount_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim: Option<ClaimSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_map: Option<ConfigMapSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimSource {
    pub claim_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretSource {
    pub secret_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_mode: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigMapSource {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub limits: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    pub image_pull_policy: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMountSpec>,
    pub resources: ResourceRequirements,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    pub containers: Vec<ContainerSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<HashMap<String, String>>,
    pub restart_policy: String,
    pub image_pull_secrets: Vec<LocalObjectReference>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    pub spec: PodSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplateSpec {
    pub metadata: Metadata,
    pub spec: PodSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub template: PodTemplateSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: Metadata,
    pub spec: JobSpec,
}

/// Convert a task into the pod spec every resource kind embeds.
///
/// `container_name` overrides the container's name for custom kinds
/// whose operators key on it (`tensorflow`, `pytorch`, `mpi`).
pub fn pod_spec_for(task: &TaskRun, container_name: Option<&str>, restart_policy: &str) -> PodSpec {
    let mut limits = HashMap::new();
    if let Some(gpus) = task.num_gpus
        && gpus > 0
    {
        limits.insert(GPU_RESOURCE.to_string(), gpus.to_string());
    }

    let mut volume_mounts: Vec<VolumeMountSpec> = task
        .mounts
        .iter()
        .map(|m| VolumeMountSpec {
            name: m.name.clone(),
            mount_path: m.path.clone(),
            sub_path: None,
        })
        .collect();
    volume_mounts.extend(task.secrets.iter().map(|s| VolumeMountSpec {
        name: s.name.clone(),
        mount_path: s.path.clone(),
        sub_path: s.sub_path.clone(),
    }));
    volume_mounts.extend(task.config_maps.iter().map(|c| VolumeMountSpec {
        name: c.name.clone(),
        mount_path: c.path.clone(),
        sub_path: c.sub_path.clone(),
    }));

    let mut volumes: Vec<VolumeSpec> = task
        .mounts
        .iter()
        .map(|m| VolumeSpec {
            name: m.name.clone(),
            persistent_volume_claim: Some(ClaimSource {
                claim_name: m.claim.clone(),
            }),
            secret: None,
            config_map: None,
        })
        .collect();
    // One volume per distinct secret/config-map name even when it is
    // projected to several paths.
    let mut seen = std::collections::HashSet::new();
    for secret in &task.secrets {
        if seen.insert(secret.name.as_str()) {
            volumes.push(VolumeSpec {
                name: secret.name.clone(),
                persistent_volume_claim: None,
                secret: Some(SecretSource {
                    secret_name: secret.name.clone(),
                    default_mode: Some(secret.mode),
                }),
                config_map: None,
            });
        }
    }
    for config_map in &task.config_maps {
        if seen.insert(config_map.name.as_str()) {
            volumes.push(VolumeSpec {
                name: config_map.name.clone(),
                persistent_volume_claim: None,
                secret: None,
                config_map: Some(ConfigMapSource {
                    name: config_map.name.clone(),
                }),
            });
        }
    }

    let container = ContainerSpec {
        name: container_name.unwrap_or(&task.label).to_string(),
        image: task.image.clone(),
        command: task.command.clone(),
        args: task.args.clone(),
        image_pull_policy: task.pull_policy.clone(),
        env: vec![
            EnvVar {
                name: TASK_ID_ENV.to_string(),
                value: task.label.clone(),
            },
            EnvVar {
                name: CRED_ENV.to_string(),
                value: CRED_PATH.to_string(),
            },
        ],
        volume_mounts,
        resources: ResourceRequirements { limits },
    };

    PodSpec {
        containers: vec![container],
        volumes,
        node_selector: task.node_selector.clone(),
        restart_policy: restart_policy.to_string(),
        image_pull_secrets: vec![LocalObjectReference {
            name: REGISTRY_SECRET.to_string(),
        }],
    }
}

/// A single-container pod carrying the task's label as its name.
pub fn pod_manifest_for(task: &TaskRun) -> PodManifest {
    PodManifest {
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        metadata: Metadata {
            name: task.label.clone(),
            labels: HashMap::new(),
        },
        spec: pod_spec_for(task, None, RESTART_NEVER),
    }
}

/// A batch job that restarts its pod until completion.
pub fn job_manifest_for(task: &TaskRun) -> JobManifest {
    JobManifest {
        api_version: "batch/v1".to_string(),
        kind: "Job".to_string(),
        metadata: Metadata {
            name: task.label.clone(),
            labels: HashMap::new(),
        },
        spec: JobSpec {
            template: PodTemplateSpec {
                metadata: Metadata {
                    name: format!("{}-template", task.label),
                    labels: HashMap::new(),
                },
                spec: pod_spec_for(task, None, RESTART_ON_FAILURE),
            },
            backoff_limit: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wharf_core::pipeline::TaskDefinition;

    fn task(yaml: &str) -> TaskRun {
        let def: TaskDefinition = serde_yaml::from_str(yaml).unwrap();
        TaskRun::from_definition("flow-test", &def)
    }

    #[test]
    fn pod_manifest_carries_label_and_gpu_limits() {
        let task = task(
            r#"
name: train
image: wharf/train
command: [run-train]
args: ["--lr", "0.01"]
num_gpus: 2
mounts:
  - {claim: data-claim, name: data, path: /data}
"#,
        );
        let manifest = pod_manifest_for(&task);
        assert_eq!(manifest.metadata.name, "flow-test--train");
        let container = &manifest.spec.containers[0];
        assert_eq!(container.name, "flow-test--train");
        assert_eq!(container.resources.limits[GPU_RESOURCE], "2");
        assert_eq!(container.volume_mounts[0].mount_path, "/data");
        assert_eq!(manifest.spec.restart_policy, RESTART_NEVER);
        assert_eq!(
            manifest.spec.volumes[0].persistent_volume_claim.as_ref().unwrap().claim_name,
            "data-claim"
        );
        assert!(container.env.iter().any(|e| e.name == TASK_ID_ENV && e.value == task.label));
    }

    #[test]
    fn zero_gpus_sets_no_limit() {
        let task = task("{name: t, image: i, command: [c], num_gpus: 0}");
        let manifest = pod_manifest_for(&task);
        assert!(manifest.spec.containers[0].resources.limits.is_empty());
    }

    #[test]
    fn job_manifest_restarts_on_failure() {
        let task = task("{name: t, image: i, command: [c]}");
        let manifest = job_manifest_for(&task);
        assert_eq!(manifest.kind, "Job");
        assert_eq!(manifest.spec.template.spec.restart_policy, RESTART_ON_FAILURE);
        assert_eq!(manifest.spec.template.metadata.name, "flow-test--t-template");
    }

    #[test]
    fn wire_names_are_camel_case() {
        let task = task("{name: t, image: i, command: [c], node_selector: {gpu: v100}}");
        let value = serde_json::to_value(pod_manifest_for(&task)).unwrap();
        assert_eq!(value["apiVersion"], "v1");
        assert!(value["spec"]["nodeSelector"].is_object());
        assert_eq!(value["spec"]["containers"][0]["imagePullPolicy"], "IfNotPresent");
        assert_eq!(value["spec"]["imagePullSecrets"][0]["name"], "registry");
    }

    #[test]
    fn shared_secret_volume_is_deduplicated() {
        let task = task(
            r#"
name: t
image: i
command: [c]
secrets:
  - {name: creds, path: /etc/wharf/a}
  - {name: creds, path: /etc/wharf/b}
"#,
        );
        let manifest = pod_manifest_for(&task);
        assert_eq!(manifest.spec.containers[0].volume_mounts.len(), 2);
        assert_eq!(manifest.spec.volumes.len(), 1);
    }
}
