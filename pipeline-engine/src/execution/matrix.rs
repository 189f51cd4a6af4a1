// Parallel / Matrix Expansion
// Expands `parallel:` declarations into concrete job instances

use crate::model::{JobSpec, MatrixEntry, Parallel};

use indexmap::IndexMap;

/// One concrete instance produced from a job declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatrixInstance {
    /// Instance id: `name`, `name i/N` or `name: [v1, v2]`
    pub name: String,
    /// Variables specific to this instance
    pub variables: IndexMap<String, String>,
}

/// Reason a `parallel:` declaration cannot be expanded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpansionError {
    ZeroCount,
    EmptyMatrix,
    EmptyEntry(usize),
    EmptyValues { entry: usize, variable: String },
}

impl std::fmt::Display for ExpansionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpansionError::ZeroCount => write!(f, "parallel count must be at least 1"),
            ExpansionError::EmptyMatrix => write!(f, "matrix has no entries"),
            ExpansionError::EmptyEntry(i) => write!(f, "matrix entry {} has no variables", i),
            ExpansionError::EmptyValues { entry, variable } => write!(
                f,
                "matrix entry {} variable '{}' has no values",
                entry, variable
            ),
        }
    }
}

/// Odometer over the Cartesian product of one matrix entry.
///
/// The rightmost variable varies fastest. Nothing is materialized up front;
/// clone the iterator to restart it.
#[derive(Debug, Clone)]
pub struct Combinations<'a> {
    axes: Vec<(&'a str, &'a [String])>,
    digits: Vec<usize>,
    done: bool,
}

impl<'a> Combinations<'a> {
    pub fn new(entry: &'a MatrixEntry) -> Self {
        let axes: Vec<_> = entry
            .iter()
            .map(|(name, value)| (name.as_str(), value.values()))
            .collect();
        let done = axes.is_empty() || axes.iter().any(|(_, values)| values.is_empty());

        Self {
            digits: vec![0; axes.len()],
            axes,
            done,
        }
    }

    /// Number of combinations this entry yields
    pub fn total(&self) -> usize {
        if self.axes.is_empty() {
            return 0;
        }
        self.axes.iter().map(|(_, values)| values.len()).product()
    }

    fn advance(&mut self) {
        for position in (0..self.digits.len()).rev() {
            self.digits[position] += 1;
            if self.digits[position] < self.axes[position].1.len() {
                return;
            }
            self.digits[position] = 0;
        }
        self.done = true;
    }
}

impl<'a> Iterator for Combinations<'a> {
    type Item = Vec<(&'a str, &'a str)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let combination = self
            .axes
            .iter()
            .zip(&self.digits)
            .map(|((name, values), &digit)| (*name, values[digit].as_str()))
            .collect();

        self.advance();
        Some(combination)
    }
}

/// Lazy expansion of a whole job declaration into instances.
///
/// Parallel and matrix instances carry `CI_NODE_INDEX` (1-based) and
/// `CI_NODE_TOTAL`; a plain job carries no instance variables.
#[derive(Debug, Clone)]
pub struct InstanceIter<'a> {
    job: &'a str,
    kind: IterKind<'a>,
    index: usize,
    total: usize,
}

#[derive(Debug, Clone)]
enum IterKind<'a> {
    Single { emitted: bool },
    Count(u32),
    Matrix {
        entries: &'a [MatrixEntry],
        entry: usize,
        current: Option<Combinations<'a>>,
    },
}

impl<'a> Iterator for InstanceIter<'a> {
    type Item = MatrixInstance;

    fn next(&mut self) -> Option<Self::Item> {
        let instance = match &mut self.kind {
            IterKind::Single { emitted } => {
                if *emitted {
                    return None;
                }
                *emitted = true;
                return Some(MatrixInstance {
                    name: self.job.to_string(),
                    variables: IndexMap::new(),
                });
            }

            IterKind::Count(count) => {
                if self.index >= *count as usize {
                    return None;
                }
                MatrixInstance {
                    name: format!("{} {}/{}", self.job, self.index + 1, count),
                    variables: IndexMap::new(),
                }
            }

            IterKind::Matrix {
                entries,
                entry,
                current,
            } => loop {
                if current.is_none() {
                    let entries: &'a [MatrixEntry] = *entries;
                    let next_entry = entries.get(*entry)?;
                    *current = Some(Combinations::new(next_entry));
                }

                match current.as_mut().and_then(Iterator::next) {
                    Some(combination) => {
                        let values: Vec<&str> = combination.iter().map(|(_, v)| *v).collect();
                        break MatrixInstance {
                            name: format!("{}: [{}]", self.job, values.join(", ")),
                            variables: combination
                                .into_iter()
                                .map(|(k, v)| (k.to_string(), v.to_string()))
                                .collect(),
                        };
                    }
                    None => {
                        *entry += 1;
                        *current = None;
                    }
                }
            },
        };

        self.index += 1;
        let mut instance = instance;
        instance
            .variables
            .insert("CI_NODE_INDEX".to_string(), self.index.to_string());
        instance
            .variables
            .insert("CI_NODE_TOTAL".to_string(), self.total.to_string());
        Some(instance)
    }
}

/// Expands `parallel:` into instances
pub struct MatrixExpander;

impl MatrixExpander {
    /// Validate the declaration and return a lazy instance iterator
    pub fn expand(job: &JobSpec) -> Result<InstanceIter<'_>, ExpansionError> {
        let (kind, total) = match &job.parallel {
            None => (IterKind::Single { emitted: false }, 1),
            Some(Parallel::Count(0)) => return Err(ExpansionError::ZeroCount),
            Some(Parallel::Count(count)) => (IterKind::Count(*count), *count as usize),
            Some(Parallel::Matrix { matrix }) => {
                Self::validate_matrix(matrix)?;
                let total = matrix.iter().map(|e| Combinations::new(e).total()).sum();
                (
                    IterKind::Matrix {
                        entries: matrix,
                        entry: 0,
                        current: None,
                    },
                    total,
                )
            }
        };

        Ok(InstanceIter {
            job: &job.name,
            kind,
            index: 0,
            total,
        })
    }

    /// Number of instances a declaration yields, without expanding it
    pub fn count(job: &JobSpec) -> Result<usize, ExpansionError> {
        Ok(Self::expand(job)?.total)
    }

    fn validate_matrix(matrix: &[MatrixEntry]) -> Result<(), ExpansionError> {
        if matrix.is_empty() {
            return Err(ExpansionError::EmptyMatrix);
        }

        for (i, entry) in matrix.iter().enumerate() {
            if entry.is_empty() {
                return Err(ExpansionError::EmptyEntry(i));
            }
            if let Some((variable, _)) = entry.iter().find(|(_, v)| v.values().is_empty()) {
                return Err(ExpansionError::EmptyValues {
                    entry: i,
                    variable: variable.clone(),
                });
            }
        }

        Ok(())
    }
}
