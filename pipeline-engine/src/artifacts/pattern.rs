// Artifact Path Patterns
// Glob-style `artifacts:paths` entries compiled to anchored regexes

use regex::Regex;

/// Set of compiled `artifacts:paths` patterns.
///
/// `*` matches within one path segment, `**` across segments and `?` a single
/// character. A pattern naming a directory also matches everything below it.
#[derive(Debug, Clone)]
pub struct PathPatterns {
    patterns: Vec<Regex>,
}

impl PathPatterns {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(&glob_to_regex(p.as_ref())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, path: &str) -> bool {
        let path = normalize(path);
        self.patterns.iter().any(|re| re.is_match(path))
    }
}

fn normalize(path: &str) -> &str {
    path.trim_start_matches("./")
}

fn glob_to_regex(glob: &str) -> String {
    let glob = normalize(glob).trim_end_matches('/');
    let mut out = String::from("^");
    let mut chars = glob.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                // `**/` also matches zero directories
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }

    out.push_str("(?:/.*)?$");
    out
}
