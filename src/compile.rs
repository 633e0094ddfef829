//! Probe Compiler: turns script text into an activatable program layout.
//!
//! Compilation is all-or-nothing: every clause is parsed and validated
//! against the provider's field tables before anything is handed to the
//! engine, and the first bad clause fails the whole program with its index.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Write as _;

use rand::RngCore;

use crate::errors::CompileError;
use crate::record::{FieldKind, FieldValue, TraceRecord};
use crate::script::{self, ProbeDesc, RawClause};

/// One output slot of a clause's formatted action.
#[derive(Clone, Debug, PartialEq)]
pub struct OutputField {
    pub name: String,
    pub kind: FieldKind,
}

/// Tokenized printf format: literal runs and conversions bound to argument
/// slots.
#[derive(Clone, Debug, PartialEq)]
pub enum FormatToken {
    Literal(String),
    Conversion { spec: char, arg: usize },
}

/// The aggregating actions the compiler accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggFunc {
    Count,
    Sum,
    Min,
    Max,
    Avg,
    Quantize,
}

impl AggFunc {
    fn parse(name: &str) -> Option<AggFunc> {
        match name {
            "count" => Some(AggFunc::Count),
            "sum" => Some(AggFunc::Sum),
            "min" => Some(AggFunc::Min),
            "max" => Some(AggFunc::Max),
            "avg" => Some(AggFunc::Avg),
            "quantize" => Some(AggFunc::Quantize),
            _ => None,
        }
    }
}

impl fmt::Display for AggFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggFunc::Count => write!(f, "count"),
            AggFunc::Sum => write!(f, "sum"),
            AggFunc::Min => write!(f, "min"),
            AggFunc::Max => write!(f, "max"),
            AggFunc::Avg => write!(f, "avg"),
            AggFunc::Quantize => write!(f, "quantize"),
        }
    }
}

/// One `@name[keys] = func(operand)` action.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregationSpec {
    pub name: String,
    pub keys: Vec<OutputField>,
    pub func: AggFunc,
    pub operand: Option<String>,
}

/// One compiled clause. The cookie is a userspace-generated random u64 the
/// engine tags records with so the decoder can find the layout again.
#[derive(Clone, Debug)]
pub struct Clause {
    pub cookie: u64,
    pub probe: ProbeDesc,
    pub predicate: Option<String>,
    pub format: Vec<FormatToken>,
    pub outputs: Vec<OutputField>,
    pub aggregations: Vec<AggregationSpec>,
}

impl Clause {
    /// Render a decoded record through this clause's format tokens.
    pub fn render(&self, record: &TraceRecord) -> String {
        let mut out = String::new();
        for token in &self.format {
            match token {
                FormatToken::Literal(text) => out.push_str(text),
                FormatToken::Conversion { spec, arg } => match record.values.get(*arg) {
                    Some(FieldValue::Integer(v)) if *spec == 'x' => {
                        let _ = write!(out, "{:x}", v);
                    }
                    Some(value) => {
                        let _ = write!(out, "{}", value);
                    }
                    None => out.push_str("<missing>"),
                },
            }
        }
        out
    }
}

/// A fully validated program: the ordered clause list plus the cookie index
/// the decoder uses to map records back to layouts.
#[derive(Clone, Debug, Default)]
pub struct CompiledProgram {
    clauses: Vec<Clause>,
    by_cookie: HashMap<u64, usize>,
}

impl CompiledProgram {
    pub(crate) fn new(clauses: Vec<Clause>) -> Self {
        let by_cookie = clauses
            .iter()
            .enumerate()
            .map(|(index, clause)| (clause.cookie, index))
            .collect();
        CompiledProgram { clauses, by_cookie }
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn clause_by_cookie(&self, cookie: u64) -> Option<&Clause> {
        self.by_cookie.get(&cookie).map(|index| &self.clauses[*index])
    }
}

/// Compile `text` against the provider's field tables, injected as `fields`.
///
/// Succeeds only if every clause does; the error names the offending clause.
pub fn compile<F>(
    text: &str,
    fields: F,
    rng: &mut dyn RngCore,
) -> Result<CompiledProgram, CompileError>
where
    F: Fn(&ProbeDesc) -> Option<HashMap<String, FieldKind>>,
{
    if text.trim().is_empty() {
        return Err(CompileError::EmptySpec);
    }
    let raw = script::split_clauses(text)?;
    let mut clauses = Vec::with_capacity(raw.len());
    for (index, raw_clause) in raw.iter().enumerate() {
        clauses.push(compile_clause(index, raw_clause, &fields, rng)?);
    }
    Ok(CompiledProgram::new(clauses))
}

fn compile_clause<F>(
    index: usize,
    raw: &RawClause,
    fields: &F,
    rng: &mut dyn RngCore,
) -> Result<Clause, CompileError>
where
    F: Fn(&ProbeDesc) -> Option<HashMap<String, FieldKind>>,
{
    let probe = ProbeDesc::parse(&raw.probe).map_err(|e| CompileError::Syntax {
        clause: index,
        reason: e.to_string(),
    })?;
    let known = fields(&probe).ok_or_else(|| CompileError::UnknownProbe {
        clause: index,
        probe: probe.to_string(),
    })?;

    if let Some(predicate) = &raw.predicate {
        for ident in predicate_identifiers(predicate) {
            if !known.contains_key(&ident) {
                return Err(CompileError::UnresolvedField {
                    clause: index,
                    field: ident,
                    probe: probe.to_string(),
                });
            }
        }
    }

    let mut format = Vec::new();
    let mut outputs = Vec::new();
    let mut aggregations = Vec::new();
    let mut saw_printf = false;
    for stmt in &raw.body {
        if stmt.starts_with("printf") {
            if saw_printf {
                return Err(syntax(index, "more than one printf action in clause"));
            }
            saw_printf = true;
            (format, outputs) = parse_printf(index, stmt, &known, &probe)?;
        } else if stmt.starts_with('@') {
            aggregations.push(parse_aggregation(index, stmt, &known, &probe)?);
        } else {
            return Err(syntax(index, format!("unsupported action \"{stmt}\"")));
        }
    }

    Ok(Clause {
        cookie: rng.next_u64(),
        probe,
        predicate: raw.predicate.clone(),
        format,
        outputs,
        aggregations,
    })
}

fn syntax(clause: usize, reason: impl Into<String>) -> CompileError {
    CompileError::Syntax {
        clause,
        reason: reason.into(),
    }
}

fn parse_printf(
    clause: usize,
    stmt: &str,
    known: &HashMap<String, FieldKind>,
    probe: &ProbeDesc,
) -> Result<(Vec<FormatToken>, Vec<OutputField>), CompileError> {
    let inner = call_body(stmt, "printf")
        .ok_or_else(|| syntax(clause, format!("malformed printf action \"{stmt}\"")))?;
    let args = split_args(inner);
    if args.is_empty() {
        return Err(syntax(clause, "printf needs a format string"));
    }
    let fmt = unquote(&args[0])
        .ok_or_else(|| syntax(clause, "printf format must be a quoted string"))?;

    let mut outputs = Vec::with_capacity(args.len() - 1);
    for arg in &args[1..] {
        if !is_identifier(arg) {
            return Err(syntax(
                clause,
                format!("printf argument \"{arg}\" is not a field"),
            ));
        }
        let kind = *known
            .get(arg.as_str())
            .ok_or_else(|| CompileError::UnresolvedField {
                clause,
                field: arg.clone(),
                probe: probe.to_string(),
            })?;
        outputs.push(OutputField {
            name: arg.clone(),
            kind,
        });
    }

    let mut tokens = Vec::new();
    let mut conversions = Vec::new();
    let mut literal = String::new();
    let mut chars = fmt.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '%' {
            literal.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            literal.push('%');
            continue;
        }
        // flags, width, precision
        while let Some(&next) = chars.peek() {
            if next.is_ascii_digit() || next == '-' || next == '+' || next == '.' {
                chars.next();
            } else {
                break;
            }
        }
        let spec = chars
            .next()
            .ok_or_else(|| syntax(clause, "dangling % in printf format"))?;
        let expected = conversion_kind(spec)
            .ok_or_else(|| syntax(clause, format!("unsupported conversion %{spec}")))?;
        if !literal.is_empty() {
            tokens.push(FormatToken::Literal(std::mem::take(&mut literal)));
        }
        tokens.push(FormatToken::Conversion {
            spec,
            arg: conversions.len(),
        });
        conversions.push(expected);
    }
    if !literal.is_empty() {
        tokens.push(FormatToken::Literal(literal));
    }

    if conversions.len() != outputs.len() {
        return Err(CompileError::FormatArity {
            clause,
            conversions: conversions.len(),
            args: outputs.len(),
        });
    }
    for (expected, output) in conversions.iter().zip(outputs.iter()) {
        if expected != &output.kind {
            return Err(CompileError::FormatKind {
                clause,
                field: output.name.clone(),
                expected: *expected,
                found: output.kind,
            });
        }
    }

    Ok((tokens, outputs))
}

fn parse_aggregation(
    clause: usize,
    stmt: &str,
    known: &HashMap<String, FieldKind>,
    probe: &ProbeDesc,
) -> Result<AggregationSpec, CompileError> {
    // @name[key, key] = func(operand)
    let rest = &stmt[1..];
    let eq = rest
        .find('=')
        .ok_or_else(|| syntax(clause, format!("aggregation \"{stmt}\" needs \"= func(...)\"")))?;
    let target = rest[..eq].trim();
    let action = rest[eq + 1..].trim();

    let (name, keys_raw) = match target.find('[') {
        Some(open) => {
            if !target.ends_with(']') {
                return Err(syntax(clause, format!("unterminated key list in \"{stmt}\"")));
            }
            (
                target[..open].trim(),
                Some(&target[open + 1..target.len() - 1]),
            )
        }
        None => (target, None),
    };
    if !is_identifier(name) {
        return Err(syntax(
            clause,
            format!("\"{name}\" is not a valid aggregation name"),
        ));
    }

    let mut keys = Vec::new();
    if let Some(raw) = keys_raw {
        for key in raw.split(',') {
            let key = key.trim();
            let kind = *known
                .get(key)
                .ok_or_else(|| CompileError::UnresolvedField {
                    clause,
                    field: key.to_string(),
                    probe: probe.to_string(),
                })?;
            keys.push(OutputField {
                name: key.to_string(),
                kind,
            });
        }
    }

    let open = action
        .find('(')
        .ok_or_else(|| syntax(clause, format!("aggregation \"{stmt}\" needs a function call")))?;
    if !action.ends_with(')') {
        return Err(syntax(clause, format!("malformed aggregation \"{stmt}\"")));
    }
    let func_name = action[..open].trim();
    let func = AggFunc::parse(func_name)
        .ok_or_else(|| syntax(clause, format!("unknown aggregating function \"{func_name}\"")))?;
    let operand = action[open + 1..action.len() - 1].trim();

    let operand = if func == AggFunc::Count {
        if !operand.is_empty() {
            return Err(syntax(clause, "count() takes no operand"));
        }
        None
    } else {
        if operand.is_empty() {
            return Err(syntax(clause, format!("{func}() needs an operand")));
        }
        let kind = *known
            .get(operand)
            .ok_or_else(|| CompileError::UnresolvedField {
                clause,
                field: operand.to_string(),
                probe: probe.to_string(),
            })?;
        if !matches!(kind, FieldKind::Integer | FieldKind::Float) {
            return Err(syntax(
                clause,
                format!("{func}() needs a numeric operand, \"{operand}\" is a {kind}"),
            ));
        }
        Some(operand.to_string())
    };

    Ok(AggregationSpec {
        name: name.to_string(),
        keys,
        func,
        operand,
    })
}

fn conversion_kind(spec: char) -> Option<FieldKind> {
    match spec {
        'd' | 'i' | 'u' | 'x' => Some(FieldKind::Integer),
        's' => Some(FieldKind::String),
        'p' | 'a' => Some(FieldKind::Address),
        'f' => Some(FieldKind::Float),
        _ => None,
    }
}

// "printf ( ... )" -> "..."
fn call_body<'a>(stmt: &'a str, name: &str) -> Option<&'a str> {
    let rest = stmt.strip_prefix(name)?.trim();
    let rest = rest.strip_prefix('(')?;
    rest.strip_suffix(')')
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// Comma-split that leaves string literals alone.
fn split_args(inner: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut cur = String::new();
    let mut in_str = false;
    let mut escaped = false;
    for c in inner.chars() {
        if in_str {
            cur.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_str = false;
            }
        } else if c == '"' {
            in_str = true;
            cur.push(c);
        } else if c == ',' {
            args.push(cur.trim().to_string());
            cur.clear();
        } else {
            cur.push(c);
        }
    }
    if !cur.trim().is_empty() || !args.is_empty() {
        args.push(cur.trim().to_string());
    }
    args
}

fn unquote(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.len() < 2 || !raw.starts_with('"') || !raw.ends_with('"') {
        return None;
    }
    let mut out = String::new();
    let mut chars = raw[1..raw.len() - 1].chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            '"' => out.push('"'),
            '\\' => out.push('\\'),
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    Some(out)
}

// Identifiers referenced by a predicate, with string and numeric literals
// (including 0x.. forms) skipped.
fn predicate_identifiers(predicate: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = predicate.chars().peekable();
    let mut in_str = false;
    while let Some(c) = chars.next() {
        if in_str {
            if c == '"' {
                in_str = false;
            }
            continue;
        }
        if c == '"' {
            in_str = true;
        } else if c.is_ascii_digit() {
            while let Some(&next) = chars.peek() {
                if next.is_ascii_alphanumeric() || next == '_' {
                    chars.next();
                } else {
                    break;
                }
            }
        } else if c.is_ascii_alphabetic() || c == '_' {
            let mut ident = String::from(c);
            while let Some(&next) = chars.peek() {
                if next.is_ascii_alphanumeric() || next == '_' {
                    ident.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            out.push(ident);
        }
    }
    out
}
