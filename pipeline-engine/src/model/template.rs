// Pipeline Template
// Declarative pipeline surface: ordered stages, workflow rules, global variables and jobs

use crate::model::job::{JobSpec, Rule};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stages used when a template does not declare any
pub const DEFAULT_STAGES: [&str; 5] = [".pre", "build", "test", "deploy", ".post"];

/// Top-level keys that configure the pipeline rather than declare a job
const RESERVED_KEYS: [&str; 9] = [
    "stages",
    "workflow",
    "variables",
    "default",
    "include",
    "image",
    "services",
    "cache",
    "before_script",
];

/// Errors raised while loading a template
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Template root must be a mapping")]
    NotAMapping,

    #[error("Invalid job '{name}': {source}")]
    InvalidJob {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// `workflow:` keyword
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Parsed pipeline template
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineTemplate {
    /// Ordered stage names; empty means [`DEFAULT_STAGES`]
    #[serde(default)]
    pub stages: Vec<String>,

    #[serde(default)]
    pub workflow: WorkflowSpec,

    /// Global variables visible to rules and jobs
    #[serde(default)]
    pub variables: IndexMap<String, String>,

    /// Jobs in declaration order
    #[serde(default)]
    pub jobs: IndexMap<String, JobSpec>,
}

impl PipelineTemplate {
    pub fn new<I, S>(stages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            stages: stages.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Add a job, keyed by its name
    pub fn job(mut self, job: JobSpec) -> Self {
        self.jobs.insert(job.name.clone(), job);
        self
    }

    pub fn workflow_rule(mut self, rule: Rule) -> Self {
        self.workflow.rules.push(rule);
        self
    }

    pub fn variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Effective stage list
    pub fn stages(&self) -> Vec<String> {
        if self.stages.is_empty() {
            DEFAULT_STAGES.iter().map(|s| s.to_string()).collect()
        } else {
            self.stages.clone()
        }
    }

    /// Load a template from YAML where jobs are top-level keys.
    ///
    /// Keys starting with `.` are hidden jobs and are ignored. No `include`,
    /// `extends` or anchor merging is performed beyond what the YAML parser
    /// itself resolves.
    pub fn from_yaml_str(source: &str) -> Result<Self, TemplateError> {
        let root: serde_yaml::Value = serde_yaml::from_str(source)?;
        let serde_yaml::Value::Mapping(mapping) = root else {
            return Err(TemplateError::NotAMapping);
        };

        let mut template = PipelineTemplate::default();

        for (key, value) in mapping {
            let Some(key) = key.as_str() else {
                continue;
            };

            match key {
                "stages" => template.stages = serde_yaml::from_value(value)?,
                "workflow" => template.workflow = serde_yaml::from_value(value)?,
                "variables" => template.variables = serde_yaml::from_value(value)?,
                k if RESERVED_KEYS.contains(&k) || k.starts_with('.') => {}
                name => {
                    let mut job: JobSpec = serde_yaml::from_value(value).map_err(|source| {
                        TemplateError::InvalidJob {
                            name: name.to_string(),
                            source,
                        }
                    })?;
                    job.name = name.to_string();
                    template.jobs.insert(job.name.clone(), job);
                }
            }
        }

        Ok(template)
    }
}
