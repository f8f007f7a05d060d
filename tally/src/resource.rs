//! Monitored resource identities
//!
//! Every time series is attributed to a monitored resource: a type name plus
//! identifying labels. The set of resource kinds is closed. Each variant
//! declares its label names in order, and empty values are left out of the
//! label map.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::series::MonitoredResource;

/// Label every resource must carry.
pub const PROJECT_ID: &str = "project_id";

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
/// Errors produced when converting a [`Resource`]
pub enum Error {
    /// The resource has no project id and none could be detected.
    #[error("resource has no project id")]
    MissingProjectId,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
/// The entity reported metrics are attributed to
pub enum Resource {
    /// Not tied to any particular infrastructure.
    Global {
        /// Owning project.
        #[serde(default)]
        project_id: String,
    },
    /// A Compute Engine VM instance.
    GceInstance {
        /// Owning project.
        #[serde(default)]
        project_id: String,
        /// Numeric VM instance identifier.
        #[serde(default)]
        instance_id: String,
        /// Zone the instance runs in.
        #[serde(default)]
        zone: String,
    },
    /// A container running in a Kubernetes Engine cluster.
    GkeContainer {
        /// Owning project.
        #[serde(default)]
        project_id: String,
        /// Cluster name.
        #[serde(default)]
        cluster_name: String,
        /// Node VM instance identifier.
        #[serde(default)]
        instance_id: String,
        /// Cluster location.
        #[serde(default)]
        zone: String,
        /// Kubernetes namespace.
        #[serde(default)]
        namespace_id: String,
        /// Pod identifier.
        #[serde(default)]
        pod_id: String,
        /// Container name.
        #[serde(default)]
        container_name: String,
    },
    /// A machine or process acting as a node.
    GenericNode {
        /// Owning project.
        #[serde(default)]
        project_id: String,
        /// Region or zone.
        #[serde(default)]
        location: String,
        /// Grouping namespace.
        #[serde(default)]
        namespace: String,
        /// Node identifier.
        #[serde(default)]
        node_id: String,
    },
    /// A unit of work within a job.
    GenericTask {
        /// Owning project.
        #[serde(default)]
        project_id: String,
        /// Region or zone.
        #[serde(default)]
        location: String,
        /// Grouping namespace.
        #[serde(default)]
        namespace: String,
        /// Job name.
        #[serde(default)]
        job: String,
        /// Task identifier within the job.
        #[serde(default)]
        task_id: String,
    },
}

impl Resource {
    /// A [`Resource::Global`] for `project_id`.
    #[must_use]
    pub fn global(project_id: impl Into<String>) -> Self {
        Resource::Global {
            project_id: project_id.into(),
        }
    }

    /// The resource type name as the backend knows it.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Resource::Global { .. } => "global",
            Resource::GceInstance { .. } => "gce_instance",
            Resource::GkeContainer { .. } => "gke_container",
            Resource::GenericNode { .. } => "generic_node",
            Resource::GenericTask { .. } => "generic_task",
        }
    }

    /// The owning project, possibly empty.
    #[must_use]
    pub fn project_id(&self) -> &str {
        match self {
            Resource::Global { project_id }
            | Resource::GceInstance { project_id, .. }
            | Resource::GkeContainer { project_id, .. }
            | Resource::GenericNode { project_id, .. }
            | Resource::GenericTask { project_id, .. } => project_id,
        }
    }

    /// Mutable access to the owning project.
    pub fn project_id_mut(&mut self) -> &mut String {
        match self {
            Resource::Global { project_id }
            | Resource::GceInstance { project_id, .. }
            | Resource::GkeContainer { project_id, .. }
            | Resource::GenericNode { project_id, .. }
            | Resource::GenericTask { project_id, .. } => project_id,
        }
    }

    /// Label name and value pairs in declaration order, empty ones included.
    fn fields(&self) -> Vec<(&'static str, &str)> {
        match self {
            Resource::Global { project_id } => vec![(PROJECT_ID, project_id.as_str())],
            Resource::GceInstance {
                project_id,
                instance_id,
                zone,
            } => vec![
                (PROJECT_ID, project_id.as_str()),
                ("instance_id", instance_id.as_str()),
                ("zone", zone.as_str()),
            ],
            Resource::GkeContainer {
                project_id,
                cluster_name,
                instance_id,
                zone,
                namespace_id,
                pod_id,
                container_name,
            } => vec![
                (PROJECT_ID, project_id.as_str()),
                ("cluster_name", cluster_name.as_str()),
                ("instance_id", instance_id.as_str()),
                ("zone", zone.as_str()),
                ("namespace_id", namespace_id.as_str()),
                ("pod_id", pod_id.as_str()),
                ("container_name", container_name.as_str()),
            ],
            Resource::GenericNode {
                project_id,
                location,
                namespace,
                node_id,
            } => vec![
                (PROJECT_ID, project_id.as_str()),
                ("location", location.as_str()),
                ("namespace", namespace.as_str()),
                ("node_id", node_id.as_str()),
            ],
            Resource::GenericTask {
                project_id,
                location,
                namespace,
                job,
                task_id,
            } => vec![
                (PROJECT_ID, project_id.as_str()),
                ("location", location.as_str()),
                ("namespace", namespace.as_str()),
                ("job", job.as_str()),
                ("task_id", task_id.as_str()),
            ],
        }
    }

    /// The resource's labels. Empty values are skipped.
    #[must_use]
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.fields()
            .into_iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }
}

impl TryFrom<&Resource> for MonitoredResource {
    type Error = Error;

    fn try_from(resource: &Resource) -> Result<Self, Self::Error> {
        if resource.project_id().is_empty() {
            return Err(Error::MissingProjectId);
        }
        Ok(MonitoredResource {
            resource_type: resource.name().to_string(),
            labels: resource.labels(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, Resource};
    use crate::series::MonitoredResource;

    #[test]
    fn global_labels() {
        let resource = Resource::global("tally");
        assert_eq!(resource.name(), "global");
        assert_eq!(resource.project_id(), "tally");

        let monitored = MonitoredResource::try_from(&resource).unwrap();
        assert_eq!(monitored.resource_type, "global");
        assert_eq!(monitored.labels.len(), 1);
        assert_eq!(monitored.labels["project_id"], "tally");
    }

    #[test]
    fn empty_values_are_skipped() {
        let resource = Resource::GkeContainer {
            project_id: "tally".to_string(),
            cluster_name: "prod".to_string(),
            instance_id: String::new(),
            zone: "europe-west2-a".to_string(),
            namespace_id: "default".to_string(),
            pod_id: String::new(),
            container_name: "api".to_string(),
        };

        let labels = resource.labels();
        assert_eq!(
            labels.keys().map(String::as_str).collect::<Vec<_>>(),
            vec![
                "cluster_name",
                "container_name",
                "namespace_id",
                "project_id",
                "zone"
            ]
        );
        assert!(!labels.contains_key("pod_id"));
        assert!(!labels.contains_key("instance_id"));
    }

    #[test]
    fn every_kind_has_its_type_name() {
        let kinds = [
            (Resource::global("p"), "global"),
            (
                Resource::GceInstance {
                    project_id: "p".to_string(),
                    instance_id: "1234".to_string(),
                    zone: "us-central1-a".to_string(),
                },
                "gce_instance",
            ),
            (
                Resource::GenericNode {
                    project_id: "p".to_string(),
                    location: "global".to_string(),
                    namespace: "ns".to_string(),
                    node_id: "n1".to_string(),
                },
                "generic_node",
            ),
            (
                Resource::GenericTask {
                    project_id: "p".to_string(),
                    location: "global".to_string(),
                    namespace: "ns".to_string(),
                    job: "ingest".to_string(),
                    task_id: "7".to_string(),
                },
                "generic_task",
            ),
        ];

        for (resource, name) in kinds {
            assert_eq!(resource.name(), name);
            let monitored = MonitoredResource::try_from(&resource).unwrap();
            assert_eq!(monitored.resource_type, name);
            assert_eq!(monitored.labels["project_id"], "p");
        }
    }

    #[test]
    fn missing_project_id_is_rejected() {
        let resource = Resource::GenericTask {
            project_id: String::new(),
            location: "global".to_string(),
            namespace: "ns".to_string(),
            job: "ingest".to_string(),
            task_id: "7".to_string(),
        };
        assert_eq!(
            MonitoredResource::try_from(&resource).unwrap_err(),
            Error::MissingProjectId
        );
    }

    #[test]
    fn project_id_can_be_filled_in() {
        let mut resource = Resource::global("");
        *resource.project_id_mut() = "detected".to_string();
        assert_eq!(resource.project_id(), "detected");
    }

    #[test]
    fn deserializes_tagged_yaml() {
        let resource: Resource = serde_yaml::from_str(
            r"
type: gce_instance
project_id: tally
instance_id: '42'
",
        )
        .unwrap();
        assert_eq!(
            resource,
            Resource::GceInstance {
                project_id: "tally".to_string(),
                instance_id: "42".to_string(),
                zone: String::new(),
            }
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<Resource, _> = serde_yaml::from_str(
            r"
type: global
project_id: tally
zone: nowhere
",
        );
        assert!(result.is_err());
    }
}
