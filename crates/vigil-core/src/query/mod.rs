//! The query engine.
//!
//! A query selects candidate files through one of four generators — explicit
//! paths, the suffix index, a glob tree, or (by default) the
//! recently-changed list bounded by `since` — and filters them through a
//! boolean expression tree. Matched files are rendered into the requested
//! output fields.

mod expr;
mod glob;
mod parse;

use std::collections::HashSet;

use serde_json::{json, Map, Value};
use tracing::debug;
use vigil_path::PathString;

pub(crate) use expr::QueryExpr;
pub(crate) use glob::GlobTree;
pub use parse::parse_query;
use vigil_wildmatch::WildFlags;

use crate::{
    clock::{clock_id_string, ClockSpec, QuerySince, RootClock},
    errors::QueryError,
    view::{FileId, FileNode, InMemoryView},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaseSensitivity {
    Sensitive,
    Insensitive,
}

impl CaseSensitivity {
    /// macOS and Windows filesystems are case-insensitive in the default
    /// configuration; everything else is assumed sensitive.
    pub fn default_for_os() -> Self {
        if cfg!(any(target_os = "macos", target_os = "windows")) {
            CaseSensitivity::Insensitive
        } else {
            CaseSensitivity::Sensitive
        }
    }
}

#[derive(Clone, Debug)]
pub struct PathSpec {
    pub name: PathString,
    /// Directory walk depth; negative means unlimited.
    pub depth: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Field {
    Name,
    Exists,
    New,
    Size,
    Mode,
    Uid,
    Gid,
    Ino,
    Dev,
    Nlink,
    Mtime,
    Ctime,
    Oclock,
    Cclock,
    Type,
    SymlinkTarget,
}

impl Field {
    fn parse(name: &str) -> Option<Field> {
        Some(match name {
            "name" => Field::Name,
            "exists" => Field::Exists,
            "new" => Field::New,
            "size" => Field::Size,
            "mode" => Field::Mode,
            "uid" => Field::Uid,
            "gid" => Field::Gid,
            "ino" => Field::Ino,
            "dev" => Field::Dev,
            "nlink" => Field::Nlink,
            "mtime" => Field::Mtime,
            "ctime" => Field::Ctime,
            "oclock" => Field::Oclock,
            "cclock" => Field::Cclock,
            "type" => Field::Type,
            "symlink_target" => Field::SymlinkTarget,
            _ => return None,
        })
    }

    fn label(&self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::Exists => "exists",
            Field::New => "new",
            Field::Size => "size",
            Field::Mode => "mode",
            Field::Uid => "uid",
            Field::Gid => "gid",
            Field::Ino => "ino",
            Field::Dev => "dev",
            Field::Nlink => "nlink",
            Field::Mtime => "mtime",
            Field::Ctime => "ctime",
            Field::Oclock => "oclock",
            Field::Cclock => "cclock",
            Field::Type => "type",
            Field::SymlinkTarget => "symlink_target",
        }
    }
}

pub fn default_field_list() -> Vec<Field> {
    vec![
        Field::Name,
        Field::Exists,
        Field::New,
        Field::Size,
        Field::Mode,
    ]
}

pub(crate) fn parse_field_list(value: Option<&Value>) -> Result<Vec<Field>, QueryError> {
    let Some(value) = value else {
        return Ok(default_field_list());
    };
    let arr = value
        .as_array()
        .ok_or_else(|| QueryError::Parse("field list must be an array of strings".into()))?;
    let mut fields = Vec::with_capacity(arr.len());
    for entry in arr {
        let name = entry
            .as_str()
            .ok_or_else(|| QueryError::Parse("field list must be an array of strings".into()))?;
        let field = Field::parse(name)
            .ok_or_else(|| QueryError::Parse(format!("unknown field name \"{}\"", name)))?;
        fields.push(field);
    }
    if fields.is_empty() {
        return Err(QueryError::Parse("field list must not be empty".into()));
    }
    Ok(fields)
}

#[derive(Debug)]
pub struct Query {
    pub(crate) since: Option<ClockSpec>,
    pub(crate) suffixes: Vec<PathString>,
    pub(crate) paths: Option<Vec<PathSpec>>,
    pub(crate) glob: Option<GlobTree>,
    pub(crate) glob_flags: WildFlags,
    pub(crate) relative_root: Option<PathString>,
    pub(crate) expr: Option<Box<dyn QueryExpr>>,
    pub(crate) fields: Vec<Field>,
    pub(crate) sync_timeout: std::time::Duration,
    pub(crate) lock_timeout: std::time::Duration,
    pub(crate) dedup_results: bool,
    pub(crate) empty_on_fresh_instance: bool,
    pub(crate) case_sensitive: CaseSensitivity,
}

impl Query {
    pub fn sync_timeout(&self) -> std::time::Duration {
        self.sync_timeout
    }

    pub fn lock_timeout(&self) -> std::time::Duration {
        self.lock_timeout
    }
}

impl Default for Query {
    fn default() -> Self {
        Self {
            since: None,
            suffixes: Vec::new(),
            paths: None,
            glob: None,
            glob_flags: WildFlags::PERIOD,
            relative_root: None,
            expr: None,
            fields: default_field_list(),
            sync_timeout: std::time::Duration::from_millis(60_000),
            lock_timeout: std::time::Duration::ZERO,
            dedup_results: false,
            empty_on_fresh_instance: false,
            case_sensitive: CaseSensitivity::default_for_os(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct QueryResult {
    pub root_number: u32,
    pub ticks: u32,
    /// Clock string captured at the start of execution.
    pub clock: String,
    /// The input clock rendered back, when the query was clock-based.
    pub since: Option<String>,
    pub is_fresh_instance: bool,
    pub files: Vec<Value>,
    /// The deduplicated wholenames, in match order. Populated when
    /// `dedup_results` is set; trigger argv appending feeds on it.
    pub deduped_names: Vec<PathString>,
    pub warning: Option<String>,
}

impl QueryResult {
    pub fn render_response(&self) -> Value {
        let mut response = Map::new();
        response.insert("clock".into(), json!(self.clock));
        if let Some(since) = &self.since {
            response.insert("since".into(), json!(since));
        }
        response.insert("is_fresh_instance".into(), json!(self.is_fresh_instance));
        response.insert("files".into(), Value::Array(self.files.clone()));
        if let Some(warning) = &self.warning {
            response.insert("warning".into(), json!(warning));
        }
        Value::Object(response)
    }
}

/// Per-execution state threaded through generators and expression terms.
pub(crate) struct QueryCtx<'a> {
    pub query: &'a Query,
    pub view: &'a InMemoryView,
    pub since: QuerySince,
    pub root_number: u32,
    /// The path of the file currently being considered, relative to the
    /// root (or the relative root), `/`-joined.
    pub wholename: PathString,
    pub results: Vec<Value>,
    pub deduped_names: Vec<PathString>,
    pub dedup: HashSet<PathString>,
    pub num_walked: u64,
}

/// Filter one candidate through scope, expression and dedup, rendering it
/// into the result set if it survives.
pub(crate) fn process_file(ctx: &mut QueryCtx<'_>, fid: FileId) {
    ctx.num_walked += 1;
    let view = ctx.view;
    let query = ctx.query;
    let file = view.file(fid);

    // On a fresh instance the response is a snapshot; deleted nodes have
    // no place in it.
    if ctx.since.is_fresh_instance() && !file.exists {
        return;
    }

    let full = view.file_full_path(fid);
    let scope = query.relative_root.as_ref().unwrap_or(&view.root_path);
    let Some(rel) = full.strip_prefix(scope) else {
        return;
    };
    if rel.is_empty() {
        return;
    }
    ctx.wholename = PathString::new(rel);

    if let Some(expr) = &query.expr {
        if !expr.evaluate(ctx, file) {
            return;
        }
    }

    if query.dedup_results {
        if !ctx.dedup.insert(ctx.wholename.clone()) {
            return;
        }
        ctx.deduped_names.push(ctx.wholename.clone());
    }

    let rendered = render_file(ctx, file);
    ctx.results.push(rendered);
}

fn is_new(since: QuerySince, file: &FileNode) -> bool {
    match since {
        QuerySince::Timestamp(ts) => file.ctime.timestamp > ts,
        QuerySince::Clock {
            is_fresh_instance: true,
            ..
        } => true,
        QuerySince::Clock { ticks, .. } => file.ctime.ticks > ticks,
    }
}

fn render_field(ctx: &QueryCtx<'_>, file: &FileNode, field: Field) -> Value {
    match field {
        Field::Name => json!(ctx.wholename.as_str()),
        Field::Exists => json!(file.exists),
        Field::New => json!(is_new(ctx.since, file)),
        Field::Size => json!(file.stat.size),
        Field::Mode => json!(file.stat.mode),
        Field::Uid => json!(file.stat.uid),
        Field::Gid => json!(file.stat.gid),
        Field::Ino => json!(file.stat.ino),
        Field::Dev => json!(file.stat.dev),
        Field::Nlink => json!(file.stat.nlink),
        Field::Mtime => json!(file.stat.mtime),
        Field::Ctime => json!(file.stat.ctime),
        Field::Oclock => json!(clock_id_string(ctx.root_number, file.otime.ticks)),
        Field::Cclock => json!(clock_id_string(ctx.root_number, file.ctime.ticks)),
        Field::Type => json!(file.stat.type_char().to_string()),
        Field::SymlinkTarget => match &file.symlink_target {
            Some(target) => json!(target.as_str()),
            None => Value::Null,
        },
    }
}

fn render_file(ctx: &QueryCtx<'_>, file: &FileNode) -> Value {
    // A single-field query renders bare values rather than objects.
    if ctx.query.fields.len() == 1 {
        return render_field(ctx, file, ctx.query.fields[0]);
    }
    let mut obj = Map::new();
    for field in &ctx.query.fields {
        obj.insert(field.label().into(), render_field(ctx, file, *field));
    }
    Value::Object(obj)
}

/// Run a query against the view. The caller supplies the clock mutably:
/// resolution records cursor movement and may bump the tick.
pub(crate) fn execute(
    query: &Query,
    view: &InMemoryView,
    clock: &mut RootClock,
) -> Result<QueryResult, QueryError> {
    let since = clock.eval(query.since.as_ref(), view.last_age_out_tick());
    let root_number = clock.root_number;
    let ticks = clock.ticks;
    let clock_at_start = clock.current_clock_string();
    let since_str = match &query.since {
        Some(ClockSpec::Clock(value)) => Some(clock_id_string(value.root_number, value.ticks)),
        _ => None,
    };
    let is_fresh_instance = since.is_fresh_instance();

    let mut result = QueryResult {
        root_number,
        ticks,
        clock: clock_at_start,
        since: since_str,
        is_fresh_instance,
        files: Vec::new(),
        deduped_names: Vec::new(),
        warning: view.warning.clone(),
    };

    if is_fresh_instance && query.empty_on_fresh_instance {
        return Ok(result);
    }

    let mut ctx = QueryCtx {
        query,
        view,
        since,
        root_number,
        wholename: PathString::new(""),
        results: Vec::new(),
        deduped_names: Vec::new(),
        dedup: HashSet::new(),
        num_walked: 0,
    };

    if query.paths.is_some() {
        view.path_generator(&mut ctx);
    } else if query.glob.is_some() {
        glob::glob_generator(&mut ctx)?;
    } else if !query.suffixes.is_empty() {
        view.suffix_generator(&mut ctx);
    } else {
        view.time_generator(&mut ctx);
    }

    debug!(
        walked = ctx.num_walked,
        results = ctx.results.len(),
        "query complete"
    );

    result.files = ctx.results;
    result.deduped_names = ctx.deduped_names;
    Ok(result)
}

#[cfg(test)]
mod test {
    use serde_json::json;
    use vigil_path::PathString;

    use super::{execute, parse_query, CaseSensitivity};
    use crate::{
        clock::RootClock,
        view::{testutil::test_view, InMemoryView},
    };

    fn root() -> PathString {
        PathString::new("/r")
    }

    /// Build a view holding a small tree, every node observed at tick 1.
    fn populated_view(files: &[&str]) -> InMemoryView {
        let mut view = test_view("/r");
        for path in files {
            let full = PathString::new(format!("/r/{}", path));
            let dir_name = full.dirname().unwrap();
            let dir = view.resolve_dir_create(&dir_name).unwrap();
            let fid =
                view.get_or_create_child_file(dir, &PathString::new(full.basename()), 100, 1);
            view.mark_file_changed(fid, 100, 1);
        }
        view
    }

    fn run(view: &InMemoryView, spec: serde_json::Value) -> Vec<String> {
        let query = parse_query(&spec, &root(), CaseSensitivity::Sensitive).unwrap();
        let mut clock = RootClock::new(1);
        clock.ticks = 10;
        let result = execute(&query, view, &mut clock).unwrap();
        let mut names: Vec<String> = result
            .files
            .iter()
            .map(|v| v.as_str().expect("single-field render").to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_glob_doublestar_selects_across_directories() {
        let view = populated_view(&["src/a/b/x.h", "src/y.c"]);
        let names = run(&view, json!({"glob": ["src/**/*.h"], "fields": ["name"]}));
        assert_eq!(names, vec!["src/a/b/x.h"]);
    }

    #[test]
    fn test_glob_literal_segments_use_direct_lookup() {
        let view = populated_view(&["src/main.c", "src/main.h", "other/main.c"]);
        let names = run(&view, json!({"glob": ["src/main.c"], "fields": ["name"]}));
        assert_eq!(names, vec!["src/main.c"]);
        let names = run(&view, json!({"glob": ["src/*.c"], "fields": ["name"]}));
        assert_eq!(names, vec!["src/main.c"]);
    }

    #[test]
    fn test_suffix_generator_with_expression() {
        let view = populated_view(&["a.c", "b.c", "deep/c.c", "d.h"]);
        let names = run(
            &view,
            json!({
                "suffix": ["c"],
                "expression": ["dirname", "deep"],
                "fields": ["name"],
            }),
        );
        assert_eq!(names, vec!["deep/c.c"]);
    }

    #[test]
    fn test_path_generator_depth_limits() {
        let view = populated_view(&["sub/one", "sub/inner/two", "sub/inner/deeper/three"]);
        let names = run(
            &view,
            json!({"path": [{"path": "sub", "depth": 1}], "fields": ["name"]}),
        );
        assert_eq!(names, vec!["sub/inner/two", "sub/one"]);
    }

    #[test]
    fn test_relative_root_scopes_and_rewrites() {
        let view = populated_view(&["scoped/inside.c", "outside.c"]);
        let names = run(
            &view,
            json!({"relative_root": "scoped", "fields": ["name"]}),
        );
        assert_eq!(names, vec!["inside.c"]);
    }

    #[test]
    fn test_time_generator_stops_at_since() {
        let mut view = test_view("/r");
        let dir = view.root_dir_id();
        let old = view.get_or_create_child_file(dir, &PathString::new("old"), 100, 1);
        view.mark_file_changed(old, 100, 1);
        let new = view.get_or_create_child_file(dir, &PathString::new("new"), 200, 5);
        view.mark_file_changed(new, 200, 5);

        let mut clock = RootClock::new(1);
        clock.ticks = 5;
        let spec = crate::clock::ClockSpec::new_clock(1, 1);
        let spec_str = match &spec {
            crate::clock::ClockSpec::Clock(v) => {
                crate::clock::clock_id_string(v.root_number, v.ticks)
            }
            _ => unreachable!(),
        };
        let query = parse_query(
            &json!({"since": spec_str, "fields": ["name"]}),
            &root(),
            CaseSensitivity::Sensitive,
        )
        .unwrap();
        let result = execute(&query, &view, &mut clock).unwrap();
        assert!(!result.is_fresh_instance);
        let names: Vec<&str> = result.files.iter().filter_map(|v| v.as_str()).collect();
        assert_eq!(names, vec!["new"]);
    }

    #[test]
    fn test_fresh_instance_omits_deleted_files() {
        let mut view = populated_view(&["alive", "doomed"]);
        let dir = view.root_dir_id();
        let doomed = view.child_file(dir, "doomed").unwrap();
        view.set_exists(doomed, false);
        view.mark_file_changed(doomed, 150, 2);

        // No since at all resolves as a fresh instance.
        let names = run(&view, json!({"fields": ["name"]}));
        assert_eq!(names, vec!["alive"]);
    }

    #[test]
    fn test_dedup_law() {
        let view = populated_view(&["dup/x.c"]);
        // Two identical paths walk the same file twice.
        let query = parse_query(
            &json!({
                "path": ["dup", "dup"],
                "dedup_results": true,
                "fields": ["name"],
            }),
            &root(),
            CaseSensitivity::Sensitive,
        )
        .unwrap();
        let mut clock = RootClock::new(1);
        let result = execute(&query, &view, &mut clock).unwrap();
        assert_eq!(result.files.len(), 1);
        assert_eq!(result.deduped_names, vec![PathString::new("dup/x.c")]);
    }

    #[test]
    fn test_expression_terms_filter_results() {
        let view = populated_view(&["src/keep.c", "src/skip.h", "other/keep.c"]);
        let names = run(
            &view,
            json!({
                "expression": ["allof",
                    "exists",
                    ["match", "*.c"],
                    ["dirname", "src"],
                ],
                "fields": ["name"],
            }),
        );
        assert_eq!(names, vec!["src/keep.c"]);
    }

    #[test]
    fn test_name_term_with_array_operand() {
        let view = populated_view(&["a.c", "b.c", "c.c"]);
        let names = run(
            &view,
            json!({
                "expression": ["name", ["a.c", "c.c"]],
                "fields": ["name"],
            }),
        );
        assert_eq!(names, vec!["a.c", "c.c"]);
    }

    #[test]
    fn test_multi_field_render_shape() {
        let view = populated_view(&["file.c"]);
        let query = parse_query(
            &json!({"fields": ["name", "exists", "new", "oclock"]}),
            &root(),
            CaseSensitivity::Sensitive,
        )
        .unwrap();
        let mut clock = RootClock::new(1);
        let result = execute(&query, &view, &mut clock).unwrap();
        assert!(result.is_fresh_instance);
        let file = result.files[0].as_object().unwrap();
        assert_eq!(file["name"], "file.c");
        assert_eq!(file["exists"], true);
        // Fresh instances report everything as new.
        assert_eq!(file["new"], true);
        assert!(file["oclock"].as_str().unwrap().starts_with("c:"));
    }

    #[test]
    fn test_glob_missing_relative_root_is_exec_error() {
        let view = populated_view(&["x"]);
        let query = parse_query(
            &json!({"glob": ["*.c"], "relative_root": "nope"}),
            &root(),
            CaseSensitivity::Sensitive,
        )
        .unwrap();
        let mut clock = RootClock::new(1);
        let err = execute(&query, &view, &mut clock).unwrap_err();
        assert!(matches!(err, crate::errors::QueryError::Exec(_)));
    }
}
