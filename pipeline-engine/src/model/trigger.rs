// Trigger Context
// Immutable description of the event that asked for a pipeline

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What caused the pipeline to be requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineSource {
    #[default]
    Push,
    MergeRequestEvent,
    Tag,
    Schedule,
    Api,
    Web,
}

impl PipelineSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineSource::Push => "push",
            PipelineSource::MergeRequestEvent => "merge_request_event",
            PipelineSource::Tag => "tag",
            PipelineSource::Schedule => "schedule",
            PipelineSource::Api => "api",
            PipelineSource::Web => "web",
        }
    }
}

impl fmt::Display for PipelineSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerContext {
    /// Commit branch (absent for tag pipelines)
    #[serde(default)]
    pub branch: Option<String>,

    #[serde(default)]
    pub commit_message: String,

    #[serde(default)]
    pub source: PipelineSource,

    #[serde(default)]
    pub tag: Option<String>,

    /// Project default branch, exposed as `CI_DEFAULT_BRANCH`
    #[serde(default)]
    pub default_branch: Option<String>,

    /// Arbitrary trigger variables; these win over predefined ones
    #[serde(default)]
    pub variables: IndexMap<String, String>,
}

impl TriggerContext {
    /// Push to `branch`
    pub fn push(branch: impl Into<String>) -> Self {
        Self {
            branch: Some(branch.into()),
            source: PipelineSource::Push,
            ..Default::default()
        }
    }

    /// Tag pipeline for `tag`
    pub fn tag(tag: impl Into<String>) -> Self {
        Self {
            tag: Some(tag.into()),
            source: PipelineSource::Tag,
            ..Default::default()
        }
    }

    pub fn with_source(mut self, source: PipelineSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.commit_message = message.into();
        self
    }

    pub fn with_default_branch(mut self, branch: impl Into<String>) -> Self {
        self.default_branch = Some(branch.into());
        self
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Predefined CI variables derived from the trigger, followed by the
    /// trigger's own variables.
    pub fn to_variables(&self) -> IndexMap<String, String> {
        let mut vars = IndexMap::new();

        if let Some(branch) = &self.branch {
            vars.insert("CI_COMMIT_BRANCH".to_string(), branch.clone());
        }
        if let Some(tag) = &self.tag {
            vars.insert("CI_COMMIT_TAG".to_string(), tag.clone());
        }
        if let Some(ref_name) = self.tag.as_ref().or(self.branch.as_ref()) {
            vars.insert("CI_COMMIT_REF_NAME".to_string(), ref_name.clone());
        }
        if let Some(default_branch) = &self.default_branch {
            vars.insert("CI_DEFAULT_BRANCH".to_string(), default_branch.clone());
        }

        vars.insert(
            "CI_COMMIT_MESSAGE".to_string(),
            self.commit_message.clone(),
        );
        vars.insert(
            "CI_COMMIT_TITLE".to_string(),
            self.commit_message
                .lines()
                .next()
                .unwrap_or_default()
                .to_string(),
        );
        vars.insert(
            "CI_PIPELINE_SOURCE".to_string(),
            self.source.as_str().to_string(),
        );

        for (k, v) in &self.variables {
            vars.insert(k.clone(), v.clone());
        }

        vars
    }
}
