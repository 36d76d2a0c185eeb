//! Pipeline descriptor types.
//!
//! These types represent the user-authored pipeline YAML read from
//! `<root>/<pipeline>/main.yml`.

use crate::{Error, Result};
use regex::Regex;
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::OnceLock;

/// Cluster object names: lower case alphanumerics, `-` and `.`.
fn name_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9-.]+$").unwrap())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    pub tasks: Vec<TaskDefinition>,
}

impl PipelineDefinition {
    /// Load the entry descriptor for a pipeline directory.
    pub fn load(dir: &Path) -> Result<Self> {
        let descriptor = dir.join("main.yml");
        let contents = std::fs::read_to_string(&descriptor)
            .map_err(|e| Error::Validation(format!("cannot read {}: {}", descriptor.display(), e)))?;
        let definition: PipelineDefinition = serde_yaml::from_str(&contents)?;
        definition.validate()?;
        Ok(definition)
    }

    /// Parse a descriptor from a YAML string.
    pub fn parse(contents: &str) -> Result<Self> {
        let definition: PipelineDefinition = serde_yaml::from_str(contents)?;
        definition.validate()?;
        Ok(definition)
    }

    fn validate(&self) -> Result<()> {
        if !name_pattern().is_match(&self.name) {
            return Err(Error::Validation(format!(
                "pipeline name must match [a-z0-9-.]+, got `{}`",
                self.name
            )));
        }
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !name_pattern().is_match(&task.name) || task.name.contains("--") {
                return Err(Error::Validation(format!(
                    "task name must match [a-z0-9-.]+ and not contain `--`, got `{}`",
                    task.name
                )));
            }
            if !seen.insert(task.name.as_str()) {
                return Err(Error::Validation(format!(
                    "task names must be unique, found `{}` twice",
                    task.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    pub image: String,
    #[serde(deserialize_with = "string_or_seq")]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, alias = "mount", deserialize_with = "one_or_many")]
    pub mounts: Vec<VolumeMount>,
    #[serde(default, alias = "secret", deserialize_with = "one_or_many")]
    pub secrets: Vec<SecretMount>,
    #[serde(default, alias = "config_map", deserialize_with = "one_or_many")]
    pub config_maps: Vec<ConfigMapMount>,
    #[serde(default)]
    pub resource_type: ResourceKind,
    #[serde(default)]
    pub node_selector: Option<HashMap<String, String>>,
    #[serde(default = "default_pull_policy")]
    pub pull_policy: String,
    #[serde(default)]
    pub num_gpus: Option<u32>,
    #[serde(default = "default_num_workers")]
    pub num_workers: u32,
    #[serde(default)]
    pub inputs: Option<Vec<String>>,
    #[serde(default)]
    pub outputs: Option<Vec<String>>,
    #[serde(default, deserialize_with = "string_or_seq")]
    pub depends: Vec<String>,
}

fn default_pull_policy() -> String {
    "IfNotPresent".to_string()
}

fn default_num_workers() -> u32 {
    1
}

/// A persistent-volume-claim mount.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeMount {
    pub claim: String,
    pub name: String,
    pub path: String,
}

/// A secret projected into the container filesystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretMount {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub sub_path: Option<String>,
    #[serde(default = "default_secret_mode")]
    pub mode: u32,
}

fn default_secret_mode() -> u32 {
    0o644
}

/// A config-map entry projected into the container filesystem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigMapMount {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub sub_path: Option<String>,
}

/// The resource kind a task maps to on the cluster, which selects
/// the handler that owns its submitted spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ResourceKind {
    #[default]
    #[serde(rename = "Pod", alias = "pod", alias = "POD")]
    Pod,
    #[serde(rename = "Job", alias = "job", alias = "BATCH_JOB")]
    BatchJob,
    #[serde(rename = "TFJob", alias = "tfjob", alias = "tensorflowjob", alias = "TF_JOB")]
    TfJob,
    #[serde(rename = "PyTorchJob", alias = "pytorchjob", alias = "PYTORCH_JOB")]
    PyTorchJob,
    #[serde(rename = "ElasticJob", alias = "elasticjob", alias = "pytorchelastic", alias = "ELASTIC_JOB")]
    ElasticJob,
    #[serde(rename = "MPIJob", alias = "mpijob", alias = "MPI_JOB")]
    MpiJob,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Pod => "Pod",
            ResourceKind::BatchJob => "Job",
            ResourceKind::TfJob => "TFJob",
            ResourceKind::PyTorchJob => "PyTorchJob",
            ResourceKind::ElasticJob => "ElasticJob",
            ResourceKind::MpiJob => "MPIJob",
        };
        write!(f, "{}", name)
    }
}

/// Accept either a scalar string or a sequence of strings.
fn string_or_seq<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct StringOrSeq;

    impl<'de> Visitor<'de> for StringOrSeq {
        type Value = Vec<String>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a string or a list of strings")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> std::result::Result<Self::Value, E> {
            Ok(vec![value.to_string()])
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error> {
            let mut values = Vec::new();
            while let Some(value) = seq.next_element()? {
                values.push(value);
            }
            Ok(values)
        }
    }

    deserializer.deserialize_any(StringOrSeq)
}

/// Accept either a single mapping or a sequence of mappings.
fn one_or_many<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    struct OneOrMany<T>(PhantomData<T>);

    impl<'de, T: Deserialize<'de>> Visitor<'de> for OneOrMany<T> {
        type Value = Vec<T>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a mapping or a list of mappings")
        }

        fn visit_map<A: de::MapAccess<'de>>(self, map: A) -> std::result::Result<Self::Value, A::Error> {
            let one = T::deserialize(de::value::MapAccessDeserializer::new(map))?;
            Ok(vec![one])
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error> {
            let mut values = Vec::new();
            while let Some(value) = seq.next_element()? {
                values.push(value);
            }
            Ok(values)
        }
    }

    deserializer.deserialize_any(OneOrMany(PhantomData))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_descriptor() {
        let yaml = r#"
name: sst2
tasks:
  - name: train
    image: wharf/sst2:latest
    command: run-train
    args: ["--config", "sst2.yml"]
"#;
        let def = PipelineDefinition::parse(yaml).unwrap();
        assert_eq!(def.name, "sst2");
        assert_eq!(def.tasks.len(), 1);
        let task = &def.tasks[0];
        assert_eq!(task.command, vec!["run-train"]);
        assert_eq!(task.resource_type, ResourceKind::Pod);
        assert_eq!(task.pull_policy, "IfNotPresent");
        assert_eq!(task.num_workers, 1);
        assert!(task.depends.is_empty());
    }

    #[test]
    fn accepts_scalar_and_list_depends() {
        let yaml = r#"
name: two-step
tasks:
  - name: train
    image: img
    command: [run-train]
  - name: export
    image: img
    command: [run-export]
    depends: train
  - name: eval
    image: img
    command: [run-eval]
    depends: [train, export]
"#;
        let def = PipelineDefinition::parse(yaml).unwrap();
        assert_eq!(def.tasks[1].depends, vec!["train"]);
        assert_eq!(def.tasks[2].depends, vec!["train", "export"]);
    }

    #[test]
    fn accepts_mount_and_mounts_spellings() {
        let yaml = r#"
name: mounted
tasks:
  - name: a
    image: img
    command: [c]
    mount: {claim: data-claim, name: data, path: /data}
  - name: b
    image: img
    command: [c]
    mounts:
      - {claim: data-claim, name: data, path: /data}
      - {claim: scratch-claim, name: scratch, path: /scratch}
"#;
        let def = PipelineDefinition::parse(yaml).unwrap();
        assert_eq!(def.tasks[0].mounts.len(), 1);
        assert_eq!(def.tasks[1].mounts.len(), 2);
        assert_eq!(def.tasks[1].mounts[1].path, "/scratch");
    }

    #[test]
    fn resolves_yaml_anchors() {
        let yaml = r#"
name: anchored
tasks:
  - name: train
    image: &img wharf/train:v2
    command: [run-train]
    mounts: &m
      - {claim: data-claim, name: data, path: /data}
  - name: export
    image: *img
    command: [run-export]
    mounts: *m
    depends: train
"#;
        let def = PipelineDefinition::parse(yaml).unwrap();
        assert_eq!(def.tasks[1].image, "wharf/train:v2");
        assert_eq!(def.tasks[1].mounts, def.tasks[0].mounts);
    }

    #[test]
    fn rejects_duplicate_task_names() {
        let yaml = r#"
name: dup
tasks:
  - {name: a, image: img, command: [c]}
  - {name: a, image: img, command: [c]}
"#;
        assert!(matches!(
            PipelineDefinition::parse(yaml),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn rejects_invalid_names() {
        let yaml = r#"
name: Bad_Name
tasks:
  - {name: a, image: img, command: [c]}
"#;
        assert!(PipelineDefinition::parse(yaml).is_err());

        let yaml = r#"
name: fine
tasks:
  - {name: has--separator, image: img, command: [c]}
"#;
        assert!(PipelineDefinition::parse(yaml).is_err());
    }

    #[test]
    fn resource_kind_aliases() {
        for (text, kind) in [
            ("Pod", ResourceKind::Pod),
            ("Job", ResourceKind::BatchJob),
            ("TFJob", ResourceKind::TfJob),
            ("tensorflowjob", ResourceKind::TfJob),
            ("PyTorchJob", ResourceKind::PyTorchJob),
            ("pytorchelastic", ResourceKind::ElasticJob),
            ("MPIJob", ResourceKind::MpiJob),
        ] {
            let parsed: ResourceKind = serde_yaml::from_str(text).unwrap();
            assert_eq!(parsed, kind, "alias {}", text);
        }
    }
}
