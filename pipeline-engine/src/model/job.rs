// Job Definition Model
// Static declaration of a single job: stage, script, artifacts, needs, parallelism, rules

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Stage a job lands in when it does not name one.
pub const DEFAULT_STAGE: &str = "test";

/// Artifact expiry applied when a job does not set `expire_in`.
pub const DEFAULT_EXPIRE_DAYS: i64 = 30;

/// When a job (or a matching rule) is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum When {
    /// Run when every required upstream succeeded
    #[default]
    OnSuccess,
    /// Run only when a required upstream failed
    OnFailure,
    /// Run once upstream work has finished, whatever its outcome
    Always,
    /// Never run (excludes the job, or skips the pipeline for workflow rules)
    Never,
}

impl When {
    pub fn as_str(&self) -> &'static str {
        match self {
            When::OnSuccess => "on_success",
            When::OnFailure => "on_failure",
            When::Always => "always",
            When::Never => "never",
        }
    }
}

impl fmt::Display for When {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a `rules:` list, shared by job rules and `workflow:rules`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Rule {
    /// Condition expression (`if:`). A rule without one always matches.
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Outcome when the rule matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<When>,

    /// Overrides the job's `allow_failure` when the rule matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_failure: Option<bool>,

    /// Variables injected when the rule matches
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub variables: IndexMap<String, String>,
}

impl Rule {
    /// Rule matching when `condition` holds
    pub fn when_if(condition: impl Into<String>, when: When) -> Self {
        Self {
            condition: Some(condition.into()),
            when: Some(when),
            ..Default::default()
        }
    }

    /// Unconditional rule
    pub fn otherwise(when: When) -> Self {
        Self {
            when: Some(when),
            ..Default::default()
        }
    }

    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    pub fn with_allow_failure(mut self, allow: bool) -> Self {
        self.allow_failure = Some(allow);
        self
    }
}

/// A `needs:` entry. A bare job name deserializes as a required need that
/// downloads artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "NeedDef")]
pub struct Need {
    pub job: String,
    pub optional: bool,
    pub artifacts: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NeedDef {
    Name(String),
    Full {
        job: String,
        #[serde(default)]
        optional: bool,
        #[serde(default = "default_true")]
        artifacts: bool,
    },
}

impl From<NeedDef> for Need {
    fn from(def: NeedDef) -> Self {
        match def {
            NeedDef::Name(job) => Need::new(job),
            NeedDef::Full {
                job,
                optional,
                artifacts,
            } => Need {
                job,
                optional,
                artifacts,
            },
        }
    }
}

impl Need {
    pub fn new(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            optional: false,
            artifacts: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn without_artifacts(mut self) -> Self {
        self.artifacts = false;
        self
    }
}

impl From<&str> for Need {
    fn from(job: &str) -> Self {
        Need::new(job)
    }
}

fn default_true() -> bool {
    true
}

/// Value of one matrix variable: a single value or the list to fan out over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MatrixValue {
    One(String),
    Many(Vec<String>),
}

impl MatrixValue {
    pub fn values(&self) -> &[String] {
        match self {
            MatrixValue::One(v) => std::slice::from_ref(v),
            MatrixValue::Many(vs) => vs,
        }
    }
}

/// One `parallel:matrix` entry: variable name to values. The entry expands
/// to the Cartesian product of its value lists.
pub type MatrixEntry = IndexMap<String, MatrixValue>;

/// `parallel:` keyword: a plain instance count or a matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Parallel {
    Count(u32),
    Matrix { matrix: Vec<MatrixEntry> },
}

/// `artifacts:` keyword
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ArtifactSpec {
    /// Path patterns captured after a successful run (`*` and `**` globs)
    #[serde(default)]
    pub paths: Vec<String>,

    /// Retention of the produced bundle
    #[serde(default)]
    pub expire_in: ExpireIn,
}

/// Artifact retention. `None` means the bundle never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExpireIn(pub Option<chrono::Duration>);

impl Default for ExpireIn {
    fn default() -> Self {
        ExpireIn(Some(chrono::Duration::days(DEFAULT_EXPIRE_DAYS)))
    }
}

impl ExpireIn {
    pub fn never() -> Self {
        ExpireIn(None)
    }

    pub fn after(duration: chrono::Duration) -> Self {
        ExpireIn(Some(duration))
    }

    /// Parse a human duration such as `30 days`, `1 week`, `2h 30min` or `never`.
    /// A bare number is read as seconds.
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        if input.eq_ignore_ascii_case("never") {
            return Ok(ExpireIn(None));
        }
        if input.is_empty() {
            return Err("empty duration".to_string());
        }

        let mut total = chrono::Duration::zero();
        let mut chars = input.chars().peekable();

        while chars.peek().is_some() {
            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }
            if chars.peek().is_none() {
                break;
            }

            let mut number = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_digit() {
                    number.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            if number.is_empty() {
                return Err(format!("invalid duration '{}'", input));
            }
            let amount: i64 = number
                .parse()
                .map_err(|_| format!("invalid duration '{}'", input))?;

            while chars.peek().is_some_and(|c| c.is_whitespace()) {
                chars.next();
            }

            let mut unit = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_ascii_alphabetic() {
                    unit.push(c.to_ascii_lowercase());
                    chars.next();
                } else {
                    break;
                }
            }

            let seconds_per_unit = match unit.as_str() {
                "" | "s" | "sec" | "secs" | "second" | "seconds" => 1,
                "m" | "min" | "mins" | "minute" | "minutes" => 60,
                "h" | "hr" | "hrs" | "hour" | "hours" => 3_600,
                "d" | "day" | "days" => 86_400,
                "w" | "wk" | "week" | "weeks" => 7 * 86_400,
                "mo" | "month" | "months" => 30 * 86_400,
                "y" | "yr" | "year" | "years" => 365 * 86_400,
                other => return Err(format!("unknown duration unit '{}'", other)),
            };

            total += chrono::Duration::seconds(amount * seconds_per_unit);
        }

        Ok(ExpireIn(Some(total)))
    }
}

impl TryFrom<String> for ExpireIn {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ExpireIn::parse(&value)
    }
}

impl From<ExpireIn> for String {
    fn from(value: ExpireIn) -> Self {
        match value.0 {
            None => "never".to_string(),
            Some(d) => format!("{} seconds", d.num_seconds()),
        }
    }
}

/// `script:` accepts a single string or a list of lines.
#[derive(Deserialize)]
#[serde(untagged)]
enum ScriptDef {
    Line(String),
    Lines(Vec<String>),
}

fn deserialize_script<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match ScriptDef::deserialize(deserializer)? {
        ScriptDef::Line(s) => s,
        ScriptDef::Lines(lines) => lines.join("\n"),
    })
}

fn default_stage() -> String {
    DEFAULT_STAGE.to_string()
}

/// Static declaration of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Job name; filled from the template's job key
    #[serde(default)]
    pub name: String,

    #[serde(default = "default_stage")]
    pub stage: String,

    /// Opaque handle handed to the job runner
    #[serde(
        default,
        rename = "script",
        deserialize_with = "deserialize_script"
    )]
    pub script_ref: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<ArtifactSpec>,

    /// Jobs in earlier stages to download artifacts from. `None` means all of
    /// them; an empty list means none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<Need>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<Parallel>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<Rule>,

    #[serde(default)]
    pub allow_failure: bool,

    #[serde(default)]
    pub when: When,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub variables: IndexMap<String, String>,
}

impl JobSpec {
    pub fn new(name: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stage: stage.into(),
            script_ref: String::new(),
            artifacts: None,
            dependencies: None,
            needs: Vec::new(),
            parallel: None,
            rules: Vec::new(),
            allow_failure: false,
            when: When::OnSuccess,
            variables: IndexMap::new(),
        }
    }

    pub fn script(mut self, script: impl Into<String>) -> Self {
        self.script_ref = script.into();
        self
    }

    pub fn needs<I, N>(mut self, needs: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<Need>,
    {
        self.needs.extend(needs.into_iter().map(Into::into));
        self
    }

    pub fn dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = Some(deps.into_iter().map(Into::into).collect());
        self
    }

    pub fn artifacts<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = self.artifacts.get_or_insert_with(ArtifactSpec::default);
        spec.paths.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn expire_in(mut self, expire_in: ExpireIn) -> Self {
        self.artifacts
            .get_or_insert_with(ArtifactSpec::default)
            .expire_in = expire_in;
        self
    }

    pub fn parallel(mut self, count: u32) -> Self {
        self.parallel = Some(Parallel::Count(count));
        self
    }

    pub fn matrix(mut self, matrix: Vec<MatrixEntry>) -> Self {
        self.parallel = Some(Parallel::Matrix { matrix });
        self
    }

    pub fn rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn allow_failure(mut self) -> Self {
        self.allow_failure = true;
        self
    }

    pub fn when(mut self, when: When) -> Self {
        self.when = when;
        self
    }

    pub fn variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Declared artifact path patterns
    pub fn artifact_paths(&self) -> &[String] {
        self.artifacts
            .as_ref()
            .map(|a| a.paths.as_slice())
            .unwrap_or(&[])
    }

    /// Effective artifact retention
    pub fn artifact_expiry(&self) -> ExpireIn {
        self.artifacts
            .as_ref()
            .map(|a| a.expire_in)
            .unwrap_or_default()
    }
}
