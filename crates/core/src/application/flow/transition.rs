// State transitions and exit-code pattern matching

use std::cmp::Ordering;

/// Edge of the flow graph: from `state_name`, on a status matching
/// `pattern`, go to `next` (or end the flow when `next` is `None`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    state_name: String,
    pattern: String,
    next: Option<String>,
}

impl StateTransition {
    pub fn new(
        state_name: impl Into<String>,
        pattern: impl Into<String>,
        next: impl Into<String>,
    ) -> Self {
        Self {
            state_name: state_name.into(),
            pattern: pattern.into(),
            next: Some(next.into()),
        }
    }

    /// Transition that ends the flow with the status just produced.
    pub fn end(state_name: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            state_name: state_name.into(),
            pattern: pattern.into(),
            next: None,
        }
    }

    pub fn state_name(&self) -> &str {
        &self.state_name
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn next(&self) -> Option<&str> {
        self.next.as_deref()
    }

    pub fn is_end(&self) -> bool {
        self.next.is_none()
    }

    pub fn matches(&self, status: &str) -> bool {
        glob_match(&self.pattern, status)
    }

    /// Most specific first: fewer `*`, then fewer `?`, then by pattern.
    pub fn specificity_cmp(&self, other: &Self) -> Ordering {
        let key = |t: &Self| {
            (
                t.pattern.matches('*').count(),
                t.pattern.matches('?').count(),
            )
        };
        key(self)
            .cmp(&key(other))
            .then_with(|| self.pattern.cmp(&other.pattern))
    }
}

/// `*` matches any run of characters, `?` exactly one.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();
    let (mut p, mut v) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while v < value.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, v));
                p += 1;
            }
            Some(&c) if c == '?' || c == value[v] => {
                p += 1;
                v += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    v = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}
