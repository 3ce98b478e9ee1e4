//! Expression terms and their parser registry.
//!
//! Each term kind provides a parser (JSON term → boxed expression) and an
//! evaluator. Parsers live in a registry keyed by term name, so adding a
//! term kind means adding a registry entry; the evaluator core never
//! changes.

use std::{collections::HashMap, fmt, sync::RwLock};

use once_cell::sync::Lazy;
use serde_json::Value;
use vigil_path::PathString;
use vigil_wildmatch::{wildmatch, WildFlags};

use crate::{
    clock::{resolve_clock_value, ClockSpec, QuerySince},
    errors::QueryError,
    query::{CaseSensitivity, QueryCtx},
    view::FileNode,
};

pub(crate) trait QueryExpr: Send + Sync + fmt::Debug {
    fn evaluate(&self, ctx: &QueryCtx<'_>, file: &FileNode) -> bool;
}

#[derive(Clone, Copy)]
pub(crate) struct ParseCtx {
    pub case_sensitive: CaseSensitivity,
}

pub(crate) type TermParser =
    fn(&Value, &ParseCtx) -> Result<Box<dyn QueryExpr>, QueryError>;

static TERM_PARSERS: Lazy<RwLock<HashMap<&'static str, TermParser>>> = Lazy::new(|| {
    let mut parsers: HashMap<&'static str, TermParser> = HashMap::new();
    parsers.insert("allof", AllOfExpr::parse);
    parsers.insert("anyof", AnyOfExpr::parse);
    parsers.insert("not", NotExpr::parse);
    parsers.insert("true", ConstExpr::parse_true);
    parsers.insert("false", ConstExpr::parse_false);
    parsers.insert("exists", ExistsExpr::parse);
    parsers.insert("empty", EmptyExpr::parse);
    parsers.insert("suffix", SuffixExpr::parse);
    parsers.insert("match", WildMatchExpr::parse_match);
    parsers.insert("imatch", WildMatchExpr::parse_imatch);
    parsers.insert("pcre", RegexExpr::parse_pcre);
    parsers.insert("ipcre", RegexExpr::parse_ipcre);
    parsers.insert("name", NameExpr::parse_name);
    parsers.insert("iname", NameExpr::parse_iname);
    parsers.insert("dirname", DirNameExpr::parse_dirname);
    parsers.insert("idirname", DirNameExpr::parse_idirname);
    parsers.insert("since", SinceExpr::parse);
    parsers.insert("size", SizeExpr::parse);
    parsers.insert("type", TypeExpr::parse);
    RwLock::new(parsers)
});

/// Install a parser for a new term kind. Later registrations win.
pub(crate) fn register_term(name: &'static str, parser: TermParser) {
    TERM_PARSERS
        .write()
        .expect("term registry poisoned")
        .insert(name, parser);
}

pub(crate) fn parse_expr(
    term: &Value,
    ctx: &ParseCtx,
) -> Result<Box<dyn QueryExpr>, QueryError> {
    let name = match term {
        Value::String(name) => name.as_str(),
        Value::Array(items) => items
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| QueryError::Parse("expected array with term name".into()))?,
        _ => {
            return Err(QueryError::Parse(
                "expected a term name or [term, ...] array".into(),
            ))
        }
    };
    let parser = TERM_PARSERS
        .read()
        .expect("term registry poisoned")
        .get(name)
        .copied()
        .ok_or_else(|| QueryError::Parse(format!("unknown expression term '{}'", name)))?;
    parser(term, ctx)
}

fn term_args(term: &Value) -> &[Value] {
    match term {
        Value::Array(items) => items,
        _ => &[],
    }
}

// --- integer comparators --------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct IntCompare {
    pub op: CompareOp,
    pub operand: i64,
}

impl IntCompare {
    /// Parse a `[field, op, operand]` triple.
    pub(crate) fn parse(term: &[Value]) -> Result<IntCompare, QueryError> {
        if term.len() != 3 {
            return Err(QueryError::Parse(
                "integer comparator must have 3 elements".into(),
            ));
        }
        let opname = term[1]
            .as_str()
            .ok_or_else(|| QueryError::Parse("integer comparator op must be a string".into()))?;
        let operand = term[2]
            .as_i64()
            .ok_or_else(|| {
                QueryError::Parse("integer comparator operand must be an integer".into())
            })?;
        let op = match opname {
            "eq" => CompareOp::Eq,
            "ne" => CompareOp::Ne,
            "gt" => CompareOp::Gt,
            "ge" => CompareOp::Ge,
            "lt" => CompareOp::Lt,
            "le" => CompareOp::Le,
            _ => {
                return Err(QueryError::Parse(format!(
                    "integer comparator opname `{}' is invalid",
                    opname
                )))
            }
        };
        Ok(IntCompare { op, operand })
    }

    pub(crate) fn eval(&self, value: i64) -> bool {
        match self.op {
            CompareOp::Eq => value == self.operand,
            CompareOp::Ne => value != self.operand,
            CompareOp::Gt => value > self.operand,
            CompareOp::Ge => value >= self.operand,
            CompareOp::Lt => value < self.operand,
            CompareOp::Le => value <= self.operand,
        }
    }
}

// --- boolean structure ----------------------------------------------------

#[derive(Debug)]
struct AllOfExpr(Vec<Box<dyn QueryExpr>>);

impl AllOfExpr {
    fn parse(term: &Value, ctx: &ParseCtx) -> Result<Box<dyn QueryExpr>, QueryError> {
        Ok(Box::new(AllOfExpr(parse_sub_terms("allof", term, ctx)?)))
    }
}

impl QueryExpr for AllOfExpr {
    fn evaluate(&self, ctx: &QueryCtx<'_>, file: &FileNode) -> bool {
        self.0.iter().all(|expr| expr.evaluate(ctx, file))
    }
}

#[derive(Debug)]
struct AnyOfExpr(Vec<Box<dyn QueryExpr>>);

impl AnyOfExpr {
    fn parse(term: &Value, ctx: &ParseCtx) -> Result<Box<dyn QueryExpr>, QueryError> {
        Ok(Box::new(AnyOfExpr(parse_sub_terms("anyof", term, ctx)?)))
    }
}

impl QueryExpr for AnyOfExpr {
    fn evaluate(&self, ctx: &QueryCtx<'_>, file: &FileNode) -> bool {
        self.0.iter().any(|expr| expr.evaluate(ctx, file))
    }
}

fn parse_sub_terms(
    which: &str,
    term: &Value,
    ctx: &ParseCtx,
) -> Result<Vec<Box<dyn QueryExpr>>, QueryError> {
    let args = &term_args(term)[1..];
    if args.is_empty() {
        return Err(QueryError::Parse(format!(
            "\"{}\" must have at least one subexpression",
            which
        )));
    }
    args.iter().map(|sub| parse_expr(sub, ctx)).collect()
}

#[derive(Debug)]
struct NotExpr(Box<dyn QueryExpr>);

impl NotExpr {
    fn parse(term: &Value, ctx: &ParseCtx) -> Result<Box<dyn QueryExpr>, QueryError> {
        let args = term_args(term);
        if args.len() != 2 {
            return Err(QueryError::Parse(
                "\"not\" must have exactly one subexpression".into(),
            ));
        }
        Ok(Box::new(NotExpr(parse_expr(&args[1], ctx)?)))
    }
}

impl QueryExpr for NotExpr {
    fn evaluate(&self, ctx: &QueryCtx<'_>, file: &FileNode) -> bool {
        !self.0.evaluate(ctx, file)
    }
}

#[derive(Debug)]
struct ConstExpr(bool);

impl ConstExpr {
    fn parse_true(_term: &Value, _ctx: &ParseCtx) -> Result<Box<dyn QueryExpr>, QueryError> {
        Ok(Box::new(ConstExpr(true)))
    }

    fn parse_false(_term: &Value, _ctx: &ParseCtx) -> Result<Box<dyn QueryExpr>, QueryError> {
        Ok(Box::new(ConstExpr(false)))
    }
}

impl QueryExpr for ConstExpr {
    fn evaluate(&self, _ctx: &QueryCtx<'_>, _file: &FileNode) -> bool {
        self.0
    }
}

// --- file state -----------------------------------------------------------

#[derive(Debug)]
struct ExistsExpr;

impl ExistsExpr {
    fn parse(_term: &Value, _ctx: &ParseCtx) -> Result<Box<dyn QueryExpr>, QueryError> {
        Ok(Box::new(ExistsExpr))
    }
}

impl QueryExpr for ExistsExpr {
    fn evaluate(&self, _ctx: &QueryCtx<'_>, file: &FileNode) -> bool {
        file.exists
    }
}

#[derive(Debug)]
struct EmptyExpr;

impl EmptyExpr {
    fn parse(_term: &Value, _ctx: &ParseCtx) -> Result<Box<dyn QueryExpr>, QueryError> {
        Ok(Box::new(EmptyExpr))
    }
}

impl QueryExpr for EmptyExpr {
    fn evaluate(&self, _ctx: &QueryCtx<'_>, file: &FileNode) -> bool {
        if !file.exists {
            return false;
        }
        if file.stat.is_dir() || file.stat.is_file() {
            return file.stat.size == 0;
        }
        false
    }
}

// --- names and suffixes ---------------------------------------------------

fn suffix_match(name: &str, suffix: &str) -> bool {
    let name = name.as_bytes();
    let suffix_len = suffix.len();
    if name.len() <= suffix_len {
        return false;
    }
    if name[name.len() - suffix_len - 1] != b'.' {
        return false;
    }
    name[name.len() - suffix_len..].eq_ignore_ascii_case(suffix.as_bytes())
}

#[derive(Debug)]
struct SuffixExpr {
    suffix: String,
}

impl SuffixExpr {
    fn parse(term: &Value, _ctx: &ParseCtx) -> Result<Box<dyn QueryExpr>, QueryError> {
        let args = term_args(term);
        let suffix = args
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| QueryError::Parse("must use [\"suffix\", \"suffixstring\"]".into()))?;
        Ok(Box::new(SuffixExpr {
            suffix: suffix.to_ascii_lowercase(),
        }))
    }
}

impl QueryExpr for SuffixExpr {
    fn evaluate(&self, _ctx: &QueryCtx<'_>, file: &FileNode) -> bool {
        suffix_match(&file.name, &self.suffix)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scope {
    Basename,
    Wholename,
}

fn parse_scope(which: &str, value: Option<&Value>) -> Result<Scope, QueryError> {
    match value {
        None => Ok(Scope::Basename),
        Some(Value::String(s)) if s == "basename" => Ok(Scope::Basename),
        Some(Value::String(s)) if s == "wholename" => Ok(Scope::Wholename),
        Some(other) => Err(QueryError::Parse(format!(
            "Invalid scope '{}' for {} expression",
            other.as_str().unwrap_or("<not a string>"),
            which
        ))),
    }
}

#[derive(Debug)]
struct WildMatchExpr {
    pattern: String,
    case_sensitive: CaseSensitivity,
    scope: Scope,
    noescape: bool,
    includedotfiles: bool,
}

impl WildMatchExpr {
    fn parse(
        term: &Value,
        case_sensitive: CaseSensitivity,
        which: &str,
    ) -> Result<Box<dyn QueryExpr>, QueryError> {
        let args = term_args(term);
        if args.len() < 2 || args.len() > 4 {
            return Err(QueryError::Parse(format!(
                "Expected [\"{}\", \"pattern\", \"scope\"?]",
                which
            )));
        }
        let pattern = args
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                QueryError::Parse(format!("Expected [\"{}\", \"pattern\", \"scope\"?]", which))
            })?;
        let scope = parse_scope(which, args.get(2))?;
        let mut noescape = false;
        let mut includedotfiles = false;
        if let Some(opts) = args.get(3) {
            let opts = opts.as_object().ok_or_else(|| {
                QueryError::Parse(format!("fourth argument to \"{}\" must be an object", which))
            })?;
            noescape = opts.get("noescape").and_then(Value::as_bool).unwrap_or(false);
            includedotfiles = opts
                .get("includedotfiles")
                .and_then(Value::as_bool)
                .unwrap_or(false);
        }
        Ok(Box::new(WildMatchExpr {
            pattern: pattern.to_string(),
            case_sensitive,
            scope,
            noescape,
            includedotfiles,
        }))
    }

    fn parse_match(term: &Value, ctx: &ParseCtx) -> Result<Box<dyn QueryExpr>, QueryError> {
        Self::parse(term, ctx.case_sensitive, "match")
    }

    fn parse_imatch(term: &Value, _ctx: &ParseCtx) -> Result<Box<dyn QueryExpr>, QueryError> {
        Self::parse(term, CaseSensitivity::Insensitive, "imatch")
    }
}

impl QueryExpr for WildMatchExpr {
    fn evaluate(&self, ctx: &QueryCtx<'_>, file: &FileNode) -> bool {
        let subject = match self.scope {
            Scope::Wholename => ctx.wholename.as_str(),
            Scope::Basename => file.name.as_str(),
        };
        let mut flags = WildFlags::empty();
        if !self.includedotfiles {
            flags |= WildFlags::PERIOD;
        }
        if self.noescape {
            flags |= WildFlags::NOESCAPE;
        }
        if self.scope == Scope::Wholename {
            flags |= WildFlags::PATHNAME;
        }
        if self.case_sensitive == CaseSensitivity::Insensitive {
            flags |= WildFlags::CASEFOLD;
        }
        wildmatch(&self.pattern, subject, flags)
    }
}

#[derive(Debug)]
struct RegexExpr {
    regex: regex::Regex,
    scope: Scope,
}

impl RegexExpr {
    fn parse(
        term: &Value,
        caseless: bool,
        which: &str,
    ) -> Result<Box<dyn QueryExpr>, QueryError> {
        let args = term_args(term);
        if args.len() < 2 || args.len() > 3 {
            return Err(QueryError::Parse(format!(
                "Expected [\"{}\", \"pattern\", \"scope\"?]",
                which
            )));
        }
        let pattern = args.get(1).and_then(Value::as_str).ok_or_else(|| {
            QueryError::Parse(format!("Expected [\"{}\", \"pattern\", \"scope\"?]", which))
        })?;
        let scope = parse_scope(which, args.get(2))?;
        let regex = regex::RegexBuilder::new(pattern)
            .case_insensitive(caseless)
            .build()
            .map_err(|err| QueryError::Parse(format!("invalid {}: {} in {}", which, err, pattern)))?;
        Ok(Box::new(RegexExpr { regex, scope }))
    }

    fn parse_pcre(term: &Value, ctx: &ParseCtx) -> Result<Box<dyn QueryExpr>, QueryError> {
        Self::parse(
            term,
            ctx.case_sensitive == CaseSensitivity::Insensitive,
            "pcre",
        )
    }

    fn parse_ipcre(term: &Value, _ctx: &ParseCtx) -> Result<Box<dyn QueryExpr>, QueryError> {
        Self::parse(term, true, "ipcre")
    }
}

impl QueryExpr for RegexExpr {
    fn evaluate(&self, ctx: &QueryCtx<'_>, file: &FileNode) -> bool {
        let subject = match self.scope {
            Scope::Wholename => ctx.wholename.as_str(),
            Scope::Basename => file.name.as_str(),
        };
        self.regex.is_match(subject)
    }
}

#[derive(Debug)]
struct NameExpr {
    names: std::collections::HashSet<String>,
    caseless: bool,
    scope: Scope,
}

impl NameExpr {
    fn parse(
        term: &Value,
        caseless: bool,
        which: &str,
    ) -> Result<Box<dyn QueryExpr>, QueryError> {
        let args = term_args(term);
        if args.len() < 2 || args.len() > 3 {
            return Err(QueryError::Parse(format!(
                "Expected [\"{}\", \"name\" | [names], \"scope\"?]",
                which
            )));
        }
        let mut names = std::collections::HashSet::new();
        match &args[1] {
            Value::String(name) => {
                names.insert(normalize_name(name, caseless));
            }
            Value::Array(items) => {
                for item in items {
                    let name = item.as_str().ok_or_else(|| {
                        QueryError::Parse(format!(
                            "Argument 2 to \"{}\" must be either a string or an array of strings",
                            which
                        ))
                    })?;
                    names.insert(normalize_name(name, caseless));
                }
            }
            _ => {
                return Err(QueryError::Parse(format!(
                    "Argument 2 to \"{}\" must be either a string or an array of strings",
                    which
                )))
            }
        }
        let scope = parse_scope(which, args.get(2))?;
        Ok(Box::new(NameExpr {
            names,
            caseless,
            scope,
        }))
    }

    fn parse_name(term: &Value, ctx: &ParseCtx) -> Result<Box<dyn QueryExpr>, QueryError> {
        Self::parse(
            term,
            ctx.case_sensitive == CaseSensitivity::Insensitive,
            "name",
        )
    }

    fn parse_iname(term: &Value, _ctx: &ParseCtx) -> Result<Box<dyn QueryExpr>, QueryError> {
        Self::parse(term, true, "iname")
    }
}

fn normalize_name(name: &str, caseless: bool) -> String {
    if caseless {
        name.to_ascii_lowercase()
    } else {
        name.to_string()
    }
}

impl QueryExpr for NameExpr {
    fn evaluate(&self, ctx: &QueryCtx<'_>, file: &FileNode) -> bool {
        let subject = match self.scope {
            Scope::Wholename => ctx.wholename.as_str(),
            Scope::Basename => file.name.as_str(),
        };
        if self.caseless {
            self.names.contains(&subject.to_ascii_lowercase())
        } else {
            self.names.contains(subject)
        }
    }
}

#[derive(Debug)]
struct DirNameExpr {
    dirname: PathString,
    depth: IntCompare,
    caseless: bool,
}

impl DirNameExpr {
    fn parse(
        term: &Value,
        caseless: bool,
        which: &str,
    ) -> Result<Box<dyn QueryExpr>, QueryError> {
        let args = term_args(term);
        if args.len() < 2 || args.len() > 3 {
            return Err(QueryError::Parse(format!(
                "Invalid number of arguments for '{}' term",
                which
            )));
        }
        let name = args[1].as_str().ok_or_else(|| {
            QueryError::Parse(format!("Argument 2 to '{}' must be a string", which))
        })?;
        let depth = match args.get(2) {
            None => IntCompare {
                op: CompareOp::Ge,
                operand: 0,
            },
            Some(Value::Array(depth_term)) => {
                if depth_term.first().and_then(Value::as_str) != Some("depth") {
                    return Err(QueryError::Parse(format!(
                        "Third parameter to '{}' should be a relational depth term",
                        which
                    )));
                }
                IntCompare::parse(depth_term)?
            }
            Some(_) => {
                return Err(QueryError::Parse(format!(
                    "Invalid number of arguments for '{}' term",
                    which
                )))
            }
        };
        Ok(Box::new(DirNameExpr {
            dirname: PathString::new(name),
            depth,
            caseless,
        }))
    }

    fn parse_dirname(term: &Value, ctx: &ParseCtx) -> Result<Box<dyn QueryExpr>, QueryError> {
        Self::parse(
            term,
            ctx.case_sensitive == CaseSensitivity::Insensitive,
            "dirname",
        )
    }

    fn parse_idirname(term: &Value, _ctx: &ParseCtx) -> Result<Box<dyn QueryExpr>, QueryError> {
        Self::parse(term, true, "idirname")
    }
}

impl QueryExpr for DirNameExpr {
    fn evaluate(&self, ctx: &QueryCtx<'_>, _file: &FileNode) -> bool {
        let whole = ctx.wholename.as_str();
        let dirname = self.dirname.as_str();

        // The wholename can only be a child of dirname if it is longer.
        if whole.len() <= dirname.len() {
            return false;
        }
        // Check for the separator, so a shared prefix is not mistaken for
        // containment. The empty dirname (the root) has no separator at
        // position zero.
        if !dirname.is_empty() && whole.as_bytes()[dirname.len()] != b'/' {
            return false;
        }
        let matched = if self.caseless {
            whole[..dirname.len()].eq_ignore_ascii_case(dirname)
        } else {
            whole.starts_with(dirname)
        };
        if !matched {
            return false;
        }

        let actual_depth = whole[dirname.len() + 1..]
            .bytes()
            .filter(|&b| b == b'/')
            .count() as i64;
        self.depth.eval(actual_depth)
    }
}

// --- clocks, sizes, types -------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SinceField {
    Oclock,
    Cclock,
    Mtime,
    Ctime,
}

#[derive(Debug)]
struct SinceExpr {
    spec: ClockSpec,
    field: SinceField,
}

impl SinceExpr {
    fn parse(term: &Value, _ctx: &ParseCtx) -> Result<Box<dyn QueryExpr>, QueryError> {
        let args = term_args(term);
        if args.len() < 2 || args.len() > 3 {
            return Err(QueryError::Parse(
                "\"since\" term has invalid number of parameters".into(),
            ));
        }
        let spec = ClockSpec::parse(&args[1])
            .ok_or_else(|| QueryError::Parse("invalid clockspec for \"since\" term".into()))?;
        if matches!(spec, ClockSpec::NamedCursor(_)) {
            return Err(QueryError::Parse(
                "named cursors are not allowed in \"since\" terms".into(),
            ));
        }
        let field = match args.get(2) {
            None => SinceField::Oclock,
            Some(value) => {
                let name = value.as_str().ok_or_else(|| {
                    QueryError::Parse("field name for \"since\" term must be a string".into())
                })?;
                match name {
                    "oclock" => SinceField::Oclock,
                    "cclock" => SinceField::Cclock,
                    "mtime" => SinceField::Mtime,
                    "ctime" => SinceField::Ctime,
                    _ => {
                        return Err(QueryError::Parse(format!(
                            "invalid field name \"{}\" for \"since\" term",
                            name
                        )))
                    }
                }
            }
        };
        if matches!(field, SinceField::Mtime | SinceField::Ctime)
            && !matches!(spec, ClockSpec::Timestamp(_))
        {
            return Err(QueryError::Parse(format!(
                "field \"{}\" requires a timestamp value for comparison in \"since\" term",
                match field {
                    SinceField::Mtime => "mtime",
                    _ => "ctime",
                }
            )));
        }
        Ok(Box::new(SinceExpr { spec, field }))
    }
}

impl QueryExpr for SinceExpr {
    fn evaluate(&self, ctx: &QueryCtx<'_>, file: &FileNode) -> bool {
        let since = match &self.spec {
            ClockSpec::Timestamp(ts) => QuerySince::Timestamp(*ts),
            ClockSpec::Clock(value) => {
                resolve_clock_value(value, ctx.root_number, ctx.view.last_age_out_tick())
            }
            // Rejected at parse time.
            ClockSpec::NamedCursor(_) => return false,
        };

        match self.field {
            SinceField::Oclock | SinceField::Cclock => {
                let stamp = if self.field == SinceField::Oclock {
                    file.otime
                } else {
                    file.ctime
                };
                match since {
                    QuerySince::Timestamp(ts) => ts > stamp.timestamp,
                    QuerySince::Clock {
                        is_fresh_instance: true,
                        ..
                    } => file.exists,
                    QuerySince::Clock { ticks, .. } => stamp.ticks > ticks,
                }
            }
            SinceField::Mtime | SinceField::Ctime => {
                let tval = if self.field == SinceField::Mtime {
                    file.stat.mtime
                } else {
                    file.stat.ctime
                };
                match since {
                    QuerySince::Timestamp(ts) => tval > ts,
                    // Unreachable: parse restricts these fields to
                    // timestamp clockspecs.
                    _ => false,
                }
            }
        }
    }
}

#[derive(Debug)]
struct SizeExpr {
    comp: IntCompare,
}

impl SizeExpr {
    fn parse(term: &Value, _ctx: &ParseCtx) -> Result<Box<dyn QueryExpr>, QueryError> {
        let args = term_args(term);
        if args.is_empty() {
            return Err(QueryError::Parse("Expected array for 'size' term".into()));
        }
        Ok(Box::new(SizeExpr {
            comp: IntCompare::parse(args)?,
        }))
    }
}

impl QueryExpr for SizeExpr {
    fn evaluate(&self, _ctx: &QueryCtx<'_>, file: &FileNode) -> bool {
        // Removed files never evaluate true.
        if !file.exists {
            return false;
        }
        self.comp.eval(file.stat.size as i64)
    }
}

#[derive(Debug)]
struct TypeExpr {
    type_char: char,
}

impl TypeExpr {
    fn parse(term: &Value, _ctx: &ParseCtx) -> Result<Box<dyn QueryExpr>, QueryError> {
        let args = term_args(term);
        let arg = args
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| QueryError::Parse("must use [\"type\", \"typechar\"]".into()))?;
        let mut chars = arg.chars();
        let (Some(type_char), None) = (chars.next(), chars.next()) else {
            return Err(QueryError::Parse(format!(
                "invalid type string '{}'",
                arg
            )));
        };
        if !"bcdfpls".contains(type_char) {
            return Err(QueryError::Parse(format!(
                "invalid type character '{}'",
                type_char
            )));
        }
        Ok(Box::new(TypeExpr { type_char }))
    }
}

impl QueryExpr for TypeExpr {
    fn evaluate(&self, _ctx: &QueryCtx<'_>, file: &FileNode) -> bool {
        file.stat.type_char() == self.type_char
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;
    use test_case::test_case;

    use super::{parse_expr, IntCompare, ParseCtx};
    use crate::{errors::QueryError, query::CaseSensitivity};

    fn ctx() -> ParseCtx {
        ParseCtx {
            case_sensitive: CaseSensitivity::Sensitive,
        }
    }

    #[test_case("eq", 5, 5, true)]
    #[test_case("eq", 5, 6, false)]
    #[test_case("ne", 5, 6, true)]
    #[test_case("gt", 5, 6, true)]
    #[test_case("ge", 5, 5, true)]
    #[test_case("lt", 5, 4, true)]
    #[test_case("le", 5, 6, false)]
    fn test_int_compare(op: &str, operand: i64, value: i64, expected: bool) {
        let comp = IntCompare::parse(&[json!("size"), json!(op), json!(operand)]).unwrap();
        assert_eq!(comp.eval(value), expected);
    }

    #[test]
    fn test_int_compare_rejects_unknown_op() {
        let err = IntCompare::parse(&[json!("size"), json!("approx"), json!(5)]).unwrap_err();
        assert!(matches!(err, QueryError::Parse(_)));
    }

    #[test]
    fn test_unknown_term_is_a_parse_error() {
        let err = parse_expr(&json!(["frobnicate", 1]), &ctx()).unwrap_err();
        assert!(matches!(err, QueryError::Parse(msg) if msg.contains("frobnicate")));
    }

    #[test]
    fn test_bare_string_terms_parse() {
        assert!(parse_expr(&json!("exists"), &ctx()).is_ok());
        assert!(parse_expr(&json!("true"), &ctx()).is_ok());
        assert!(parse_expr(&json!("empty"), &ctx()).is_ok());
    }

    #[test]
    fn test_nested_boolean_terms_parse() {
        let term = json!(["allof", ["anyof", "exists", "empty"], ["not", "false"]]);
        assert!(parse_expr(&term, &ctx()).is_ok());
    }

    #[test]
    fn test_allof_requires_subexpressions() {
        let err = parse_expr(&json!(["allof"]), &ctx()).unwrap_err();
        assert!(matches!(err, QueryError::Parse(_)));
    }

    #[test]
    fn test_since_term_rejects_cursor_and_bad_fields() {
        let err = parse_expr(&json!(["since", "n:foo"]), &ctx()).unwrap_err();
        assert!(matches!(err, QueryError::Parse(_)));

        let err = parse_expr(&json!(["since", 12345, "octime"]), &ctx()).unwrap_err();
        assert!(matches!(err, QueryError::Parse(_)));

        // mtime needs a timestamp, not a clock string.
        let err = parse_expr(&json!(["since", "c:1:2:3:4", "mtime"]), &ctx()).unwrap_err();
        assert!(matches!(err, QueryError::Parse(_)));

        assert!(parse_expr(&json!(["since", 12345, "mtime"]), &ctx()).is_ok());
        assert!(parse_expr(&json!(["since", "c:1:2:3:4", "oclock"]), &ctx()).is_ok());
    }

    #[test]
    fn test_pcre_rejects_bad_patterns() {
        let err = parse_expr(&json!(["pcre", "(unclosed"]), &ctx()).unwrap_err();
        assert!(matches!(err, QueryError::Parse(_)));
    }

    #[test]
    fn test_match_scope_validation() {
        assert!(parse_expr(&json!(["match", "*.c", "wholename"]), &ctx()).is_ok());
        let err = parse_expr(&json!(["match", "*.c", "midname"]), &ctx()).unwrap_err();
        assert!(matches!(err, QueryError::Parse(_)));
    }

    #[test]
    fn test_new_term_kinds_can_be_registered() {
        #[derive(Debug)]
        struct YesExpr;
        impl super::QueryExpr for YesExpr {
            fn evaluate(
                &self,
                _ctx: &crate::query::QueryCtx<'_>,
                _file: &crate::view::FileNode,
            ) -> bool {
                true
            }
        }

        super::register_term("registered-for-test", |_term, _ctx| Ok(Box::new(YesExpr)));
        assert!(parse_expr(&json!(["registered-for-test"]), &ctx()).is_ok());
    }

    #[test]
    fn test_dirname_depth_validation() {
        assert!(parse_expr(&json!(["dirname", "src"]), &ctx()).is_ok());
        assert!(
            parse_expr(&json!(["dirname", "src", ["depth", "ge", 2]]), &ctx()).is_ok()
        );
        let err = parse_expr(
            &json!(["dirname", "src", ["height", "ge", 2]]),
            &ctx(),
        )
        .unwrap_err();
        assert!(matches!(err, QueryError::Parse(_)));
    }
}
