//! Probe script surface: probe descriptions and clause splitting.
//!
//! A script is a sequence of clauses, each
//! `probe-desc [/predicate/] { action; ... }`. This module only carves the
//! text into those pieces; resolving fields and actions against the provider
//! is the compiler's job.

use std::fmt;

use anyhow::Result;

use crate::errors::CompileError;

// Format is
// provider:module:function:name
// with module and function optionally empty, e.g. ip:::send
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProbeDesc {
    pub provider: String,
    pub module: String,
    pub function: String,
    pub name: String,
}

impl ProbeDesc {
    pub fn parse(text: &str) -> Result<Self> {
        let parts = text.split(':').collect::<Vec<&str>>();
        if parts.len() != 4 {
            return Err(anyhow::anyhow!("invalid probe description \"{}\"", text));
        }
        if parts[0].is_empty() || parts[3].is_empty() {
            return Err(anyhow::anyhow!(
                "probe description \"{}\" needs a provider and a probe name",
                text
            ));
        }
        Ok(ProbeDesc {
            provider: parts[0].to_string(),
            module: parts[1].to_string(),
            function: parts[2].to_string(),
            name: parts[3].to_string(),
        })
    }
}

impl fmt::Display for ProbeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.provider, self.module, self.function, self.name
        )
    }
}

/// One clause as carved out of the script text, before semantic validation.
#[derive(Clone, Debug, PartialEq)]
pub struct RawClause {
    pub probe: String,
    pub predicate: Option<String>,
    pub body: Vec<String>,
}

/// Split script text into raw clauses. Syntax errors carry the index of the
/// clause being scanned when the error was hit.
pub fn split_clauses(text: &str) -> Result<Vec<RawClause>, CompileError> {
    let chars: Vec<char> = text.chars().collect();
    let n = chars.len();
    let mut clauses = Vec::new();
    let mut i = 0;

    loop {
        while i < n && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= n {
            break;
        }
        let clause = clauses.len();

        let start = i;
        while i < n && chars[i] != '/' && chars[i] != '{' {
            i += 1;
        }
        if i >= n {
            return Err(CompileError::Syntax {
                clause,
                reason: "clause has no action block".to_string(),
            });
        }
        let probe = chars[start..i]
            .iter()
            .collect::<String>()
            .trim()
            .to_string();
        if probe.is_empty() {
            return Err(CompileError::Syntax {
                clause,
                reason: "clause is missing a probe description".to_string(),
            });
        }

        let predicate = if chars[i] == '/' {
            i += 1;
            let pstart = i;
            let mut in_str = false;
            while i < n {
                let c = chars[i];
                if in_str {
                    if c == '"' {
                        in_str = false;
                    }
                } else if c == '"' {
                    in_str = true;
                } else if c == '/' {
                    break;
                }
                i += 1;
            }
            if i >= n {
                return Err(CompileError::Syntax {
                    clause,
                    reason: "unterminated predicate".to_string(),
                });
            }
            let pred = chars[pstart..i]
                .iter()
                .collect::<String>()
                .trim()
                .to_string();
            i += 1;
            while i < n && chars[i].is_whitespace() {
                i += 1;
            }
            if i >= n || chars[i] != '{' {
                return Err(CompileError::Syntax {
                    clause,
                    reason: "predicate must be followed by an action block".to_string(),
                });
            }
            if pred.is_empty() {
                None
            } else {
                Some(pred)
            }
        } else {
            None
        };

        // chars[i] == '{'
        i += 1;
        let bstart = i;
        let mut in_str = false;
        while i < n {
            let c = chars[i];
            if in_str {
                if c == '\\' {
                    i += 2;
                    continue;
                }
                if c == '"' {
                    in_str = false;
                }
            } else if c == '"' {
                in_str = true;
            } else if c == '}' {
                break;
            }
            i += 1;
        }
        if i >= n {
            return Err(CompileError::Syntax {
                clause,
                reason: "unterminated action block".to_string(),
            });
        }
        let body_text: String = chars[bstart..i].iter().collect();
        i += 1;

        clauses.push(RawClause {
            probe,
            predicate,
            body: split_statements(&body_text),
        });
    }

    Ok(clauses)
}

// Statements are ';'-separated; semicolons inside string literals don't count.
fn split_statements(body: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut stmt = String::new();
    let mut in_str = false;
    let mut escaped = false;
    for c in body.chars() {
        if in_str {
            stmt.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_str = false;
            }
        } else if c == '"' {
            in_str = true;
            stmt.push(c);
        } else if c == ';' {
            let trimmed = stmt.trim();
            if !trimmed.is_empty() {
                statements.push(trimmed.to_string());
            }
            stmt.clear();
        } else {
            stmt.push(c);
        }
    }
    let trimmed = stmt.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
    statements
}
