//! Parsing a JSON query specification into a [`Query`].

use std::time::Duration;

use serde_json::Value;
use vigil_path::PathString;
use vigil_wildmatch::WildFlags;

use crate::{
    clock::ClockSpec,
    errors::QueryError,
    query::{
        expr::{parse_expr, ParseCtx},
        parse_field_list, CaseSensitivity, GlobTree, PathSpec, Query,
    },
};

const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_millis(60_000);

fn parse_bool(spec: &Value, key: &str) -> Result<Option<bool>, QueryError> {
    match spec.get(key) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(QueryError::Parse(format!("{} must be a boolean", key))),
    }
}

fn parse_ms(spec: &Value, key: &str) -> Result<Option<Duration>, QueryError> {
    match spec.get(key) {
        None => Ok(None),
        Some(value) => {
            let ms = value
                .as_i64()
                .filter(|&ms| ms >= 0)
                .ok_or_else(|| {
                    QueryError::Parse(format!("{} must be a non-negative integer", key))
                })?;
            Ok(Some(Duration::from_millis(ms as u64)))
        }
    }
}

fn parse_suffixes(spec: &Value) -> Result<Vec<PathString>, QueryError> {
    match spec.get("suffix") {
        None => Ok(Vec::new()),
        Some(Value::String(suffix)) => Ok(vec![PathString::new(suffix.to_ascii_lowercase())]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(|s| PathString::new(s.to_ascii_lowercase()))
                    .ok_or_else(|| {
                        QueryError::Parse("'suffix' must be a string or array of strings".into())
                    })
            })
            .collect(),
        Some(_) => Err(QueryError::Parse(
            "'suffix' must be a string or array of strings".into(),
        )),
    }
}

fn parse_paths(spec: &Value) -> Result<Option<Vec<PathSpec>>, QueryError> {
    let value = match spec.get("path").or_else(|| spec.get("paths")) {
        None => return Ok(None),
        Some(value) => value,
    };
    let items = value
        .as_array()
        .ok_or_else(|| QueryError::Parse("'path' must be an array".into()))?;
    let mut paths = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Value::String(name) => paths.push(PathSpec {
                name: PathString::new(name),
                depth: -1,
            }),
            Value::Object(obj) => {
                let name = obj
                    .get("path")
                    .and_then(Value::as_str)
                    .ok_or_else(|| QueryError::Parse("path element missing 'path'".into()))?;
                let depth = obj
                    .get("depth")
                    .map(|d| {
                        d.as_i64().ok_or_else(|| {
                            QueryError::Parse("path 'depth' must be an integer".into())
                        })
                    })
                    .transpose()?
                    .unwrap_or(-1);
                paths.push(PathSpec {
                    name: PathString::new(name),
                    depth,
                });
            }
            _ => {
                return Err(QueryError::Parse(
                    "path element must be a string or {path, depth} object".into(),
                ))
            }
        }
    }
    Ok(Some(paths))
}

fn parse_globs(spec: &Value, query: &mut Query) -> Result<(), QueryError> {
    let Some(globs) = spec.get("glob") else {
        return Ok(());
    };
    let items = globs
        .as_array()
        .ok_or_else(|| QueryError::Parse("'glob' must be an array".into()))?;
    let patterns: Vec<&str> = items
        .iter()
        .map(|item| {
            item.as_str()
                .ok_or_else(|| QueryError::Parse("'glob' must be an array of strings".into()))
        })
        .collect::<Result<_, _>>()?;

    // Globs implicitly enable dedup_results mode.
    query.dedup_results = true;

    let noescape = parse_bool(spec, "glob_noescape")?.unwrap_or(false);
    let includedotfiles = parse_bool(spec, "glob_includedotfiles")?.unwrap_or(false);
    let mut flags = WildFlags::empty();
    if !includedotfiles {
        flags |= WildFlags::PERIOD;
    }
    if noescape {
        flags |= WildFlags::NOESCAPE;
    }
    query.glob_flags = flags;
    query.glob = Some(GlobTree::compile(patterns));
    Ok(())
}

/// Parse a query specification. `root_path` anchors `relative_root`;
/// `case_sensitive` supplies the platform default, overridable per query.
pub fn parse_query(
    spec: &Value,
    root_path: &PathString,
    case_sensitive: CaseSensitivity,
) -> Result<Query, QueryError> {
    if !spec.is_object() {
        return Err(QueryError::Parse("query spec must be an object".into()));
    }

    let mut query = Query {
        case_sensitive,
        ..Query::default()
    };

    if let Some(case) = parse_bool(spec, "case_sensitive")? {
        query.case_sensitive = if case {
            CaseSensitivity::Sensitive
        } else {
            CaseSensitivity::Insensitive
        };
    }

    if let Some(since) = spec.get("since") {
        query.since = Some(
            ClockSpec::parse(since)
                .ok_or_else(|| QueryError::Parse("invalid clockspec for 'since'".into()))?,
        );
    }

    query.suffixes = parse_suffixes(spec)?;
    query.paths = parse_paths(spec)?;
    parse_globs(spec, &mut query)?;

    if let Some(relative_root) = spec.get("relative_root") {
        let rel = relative_root
            .as_str()
            .ok_or_else(|| QueryError::Parse("'relative_root' must be a string".into()))?;
        query.relative_root = Some(root_path.path_cat(rel.split('/')));
    }

    if let Some(expression) = spec.get("expression") {
        let ctx = ParseCtx {
            case_sensitive: query.case_sensitive,
        };
        query.expr = Some(parse_expr(expression, &ctx)?);
    }

    query.fields = parse_field_list(spec.get("fields"))?;
    query.sync_timeout = parse_ms(spec, "sync_timeout")?.unwrap_or(DEFAULT_SYNC_TIMEOUT);
    query.lock_timeout = parse_ms(spec, "lock_timeout")?.unwrap_or(Duration::ZERO);
    if let Some(dedup) = parse_bool(spec, "dedup_results")? {
        // Never turn dedup back off once globs enabled it.
        query.dedup_results = query.dedup_results || dedup;
    }
    query.empty_on_fresh_instance =
        parse_bool(spec, "empty_on_fresh_instance")?.unwrap_or(false);

    Ok(query)
}

#[cfg(test)]
mod test {
    use serde_json::json;
    use vigil_path::PathString;

    use super::parse_query;
    use crate::{
        errors::QueryError,
        query::{CaseSensitivity, Field},
    };

    fn root() -> PathString {
        PathString::new("/repo")
    }

    fn parse(spec: serde_json::Value) -> Result<crate::query::Query, QueryError> {
        parse_query(&spec, &root(), CaseSensitivity::Sensitive)
    }

    #[test]
    fn test_minimal_query_gets_defaults() {
        let query = parse(json!({})).unwrap();
        assert!(query.since.is_none());
        assert_eq!(query.fields, crate::query::default_field_list());
        assert!(!query.dedup_results);
        assert_eq!(query.sync_timeout.as_millis(), 60_000);
    }

    #[test]
    fn test_full_query_parses() {
        let query = parse(json!({
            "since": "n:checkpoint",
            "suffix": ["C", "h"],
            "expression": ["allof", "exists", ["suffix", "c"]],
            "fields": ["name", "size", "oclock"],
            "sync_timeout": 1500,
            "lock_timeout": 250,
            "relative_root": "src/lib",
            "empty_on_fresh_instance": true,
        }))
        .unwrap();
        assert_eq!(query.suffixes, vec![PathString::new("c"), PathString::new("h")]);
        assert_eq!(
            query.relative_root.as_deref(),
            Some("/repo/src/lib")
        );
        assert_eq!(query.fields, vec![Field::Name, Field::Size, Field::Oclock]);
        assert!(query.empty_on_fresh_instance);
        assert_eq!(query.lock_timeout.as_millis(), 250);
    }

    #[test]
    fn test_paths_accept_strings_and_objects() {
        let query = parse(json!({
            "path": ["sub", {"path": "deep/dir", "depth": 2}],
        }))
        .unwrap();
        let paths = query.paths.unwrap();
        assert_eq!(paths[0].name, "sub");
        assert_eq!(paths[0].depth, -1);
        assert_eq!(paths[1].name, "deep/dir");
        assert_eq!(paths[1].depth, 2);
    }

    #[test]
    fn test_globs_force_dedup() {
        let query = parse(json!({"glob": ["src/**/*.h"]})).unwrap();
        assert!(query.dedup_results);
        assert!(query.glob.is_some());
        let query = parse(json!({"glob": ["a"], "dedup_results": false})).unwrap();
        assert!(query.dedup_results);
    }

    #[test]
    fn test_parse_errors_are_parse_kind() {
        for spec in [
            json!({"since": "totally-bogus"}),
            json!({"glob": "not-an-array"}),
            json!({"suffix": 42}),
            json!({"expression": ["unknown-term"]}),
            json!({"fields": ["name", "sparkle"]}),
            json!({"sync_timeout": -4}),
        ] {
            let err = parse(spec).unwrap_err();
            assert!(matches!(err, QueryError::Parse(_)));
        }
    }

    #[test]
    fn test_case_sensitivity_override() {
        let query = parse(json!({"case_sensitive": false})).unwrap();
        assert_eq!(query.case_sensitive, CaseSensitivity::Insensitive);
    }
}
