//! Triggers: run a command when matching files change.
//!
//! Each trigger gets a task of its own. The task listens to the root's
//! settle publisher; on every settle it asks the engine to assess the
//! trigger (run its query against the rolling clock) and, when files
//! matched, spawns the configured command. Triggers are single-instance:
//! the task waits for the child to exit before considering the next batch.

use std::{
    collections::HashMap,
    io::{Seek, SeekFrom, Write},
    process::Stdio,
    time::Duration,
};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, warn};
use vigil_path::PathString;

use crate::{
    engine::{EngineRequest, SettleEvent},
    errors::TriggerError,
    query::{parse_query, CaseSensitivity, Query},
};

// Allow some misc working overhead in the argv/env budget.
const ARG_SPACE_MARGIN: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StdinStyle {
    DevNull,
    Json,
    NamePerLine,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Redirect {
    pub path: String,
    pub append: bool,
}

fn parse_redirection(
    value: Option<&Value>,
    label: &'static str,
) -> Result<Option<Redirect>, TriggerError> {
    let Some(value) = value else { return Ok(None) };
    let name = value.as_str().ok_or(TriggerError::InvalidRedirection {
        label,
        value: value.to_string(),
    })?;
    let Some(rest) = name.strip_prefix('>') else {
        return Err(TriggerError::InvalidRedirection {
            label,
            value: name.to_string(),
        });
    };
    Ok(Some(match rest.strip_prefix('>') {
        Some(path) => Redirect {
            path: path.to_string(),
            append: true,
        },
        None => Redirect {
            path: rest.to_string(),
            append: false,
        },
    }))
}

#[derive(Debug)]
pub(crate) struct TriggerDef {
    pub name: String,
    /// The raw JSON definition; compared verbatim on re-registration and
    /// written to the persisted state file.
    pub definition: Value,
    pub command: Vec<String>,
    pub append_files: bool,
    pub stdin_style: StdinStyle,
    pub max_files_stdin: usize,
    pub stdout: Option<Redirect>,
    pub stderr: Option<Redirect>,
    pub chdir: Option<String>,
}

/// Parse a trigger definition object into its runtime form plus the query
/// it should execute at each settle.
pub(crate) fn parse_trigger(
    root_path: &PathString,
    case_sensitive: CaseSensitivity,
    trig: &Value,
) -> Result<(TriggerDef, Query), TriggerError> {
    let name = trig
        .get("name")
        .and_then(Value::as_str)
        .ok_or(TriggerError::InvalidName)?
        .to_string();

    let command: Vec<String> = match trig.get("command").and_then(Value::as_array) {
        Some(items) if !items.is_empty() => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or(TriggerError::InvalidCommand)
            })
            .collect::<Result<_, _>>()?,
        _ => return Err(TriggerError::InvalidCommand),
    };

    let append_files = trig
        .get("append_files")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut query_spec = serde_json::Map::new();
    if let Some(expr) = trig.get("expression") {
        query_spec.insert("expression".into(), expr.clone());
    }
    if let Some(relative_root) = trig.get("relative_root") {
        query_spec.insert("relative_root".into(), relative_root.clone());
    }

    let stdin_style = match trig.get("stdin") {
        None => StdinStyle::DevNull,
        Some(Value::Array(fields)) => {
            query_spec.insert("fields".into(), Value::Array(fields.clone()));
            StdinStyle::Json
        }
        Some(Value::String(s)) if s == "/dev/null" => StdinStyle::DevNull,
        Some(Value::String(s)) if s == "NAME_PER_LINE" => {
            query_spec.insert("fields".into(), serde_json::json!(["name"]));
            StdinStyle::NamePerLine
        }
        Some(Value::String(s)) => return Err(TriggerError::InvalidStdin(s.clone())),
        Some(other) => return Err(TriggerError::InvalidStdin(other.to_string())),
    };

    let mut query = parse_query(&Value::Object(query_spec), root_path, case_sensitive)
        .map_err(TriggerError::Query)?;
    if append_files {
        // Appending file names to the command line needs the deduplicated
        // name list, which the dedup machinery collects for us.
        query.dedup_results = true;
    }

    let max_files_stdin = match trig.get("max_files_stdin") {
        None => 0,
        Some(value) => match value.as_i64() {
            Some(n) if n >= 0 => n as usize,
            _ => return Err(TriggerError::InvalidMaxFiles),
        },
    };

    let stdout = parse_redirection(trig.get("stdout"), "stdout")?;
    let stderr = parse_redirection(trig.get("stderr"), "stderr")?;
    let chdir = trig
        .get("chdir")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok((
        TriggerDef {
            name,
            definition: trig.clone(),
            command,
            append_files,
            stdin_style,
            max_files_stdin,
            stdout,
            stderr,
            chdir,
        },
        query,
    ))
}

/// Everything the trigger task needs to spawn one invocation; assembled by
/// the engine when the trigger's query produced results.
#[derive(Debug)]
pub(crate) struct TriggerFire {
    pub files: Vec<Value>,
    pub deduped_names: Vec<PathString>,
    pub clock: String,
    pub since: Option<String>,
    pub relative_root: Option<PathString>,
    pub root_path: PathString,
    pub sock_name: Option<String>,
}

fn arg_budget() -> usize {
    let arg_max = unsafe { libc::sysconf(libc::_SC_ARG_MAX) };
    if arg_max <= 0 {
        usize::MAX
    } else {
        arg_max as usize
    }
}

/// Build the argv, appending file names within the OS argument budget when
/// requested. Returns the argv and whether any names were left off.
pub(crate) fn compute_argv(
    def: &TriggerDef,
    env: &HashMap<String, String>,
    names: &[PathString],
    mut overflow: bool,
) -> (Vec<String>, bool) {
    let mut args = def.command.clone();
    if !def.append_files {
        return (args, overflow);
    }

    let ptr_size = std::mem::size_of::<*const u8>();
    let mut remaining = arg_budget().saturating_sub(ARG_SPACE_MARGIN);

    // Measure how much space the base args and environment occupy.
    for arg in &args {
        remaining = remaining.saturating_sub(arg.len() + 1 + ptr_size);
    }
    for (key, value) in env {
        remaining = remaining.saturating_sub(key.len() + value.len() + 2 + ptr_size);
    }

    for name in names {
        let size = name.len() + 1 + ptr_size;
        if remaining < size {
            overflow = true;
            break;
        }
        remaining -= size;
        args.push(name.to_string());
    }
    (args, overflow)
}

fn build_env(def: &TriggerDef, fire: &TriggerFire) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("WATCHMAN_ROOT".to_string(), fire.root_path.to_string());
    if let Some(sock) = &fire.sock_name {
        env.insert("WATCHMAN_SOCK".to_string(), sock.clone());
    }
    env.insert("WATCHMAN_TRIGGER".to_string(), def.name.clone());
    // Only a relative clock makes a meaningful WATCHMAN_SINCE; the first
    // run has none.
    if let Some(since) = &fire.since {
        env.insert("WATCHMAN_SINCE".to_string(), since.clone());
    }
    env.insert("WATCHMAN_CLOCK".to_string(), fire.clock.clone());
    if let Some(relative_root) = &fire.relative_root {
        env.insert(
            "WATCHMAN_RELATIVE_ROOT".to_string(),
            relative_root.to_string(),
        );
    }
    env
}

fn prepare_stdin(def: &TriggerDef, fire: &TriggerFire) -> std::io::Result<Stdio> {
    if def.stdin_style == StdinStyle::DevNull {
        return Ok(Stdio::null());
    }

    // Adjust the result list to fit within the configured limit.
    let limit = if def.max_files_stdin > 0 {
        def.max_files_stdin.min(fire.files.len())
    } else {
        fire.files.len()
    };
    let files = &fire.files[..limit];

    let mut stdin_file = tempfile::tempfile()?;
    match def.stdin_style {
        StdinStyle::Json => {
            serde_json::to_writer(&mut stdin_file, files)?;
        }
        StdinStyle::NamePerLine => {
            for value in files {
                if let Some(name) = value.as_str() {
                    stdin_file.write_all(name.as_bytes())?;
                    stdin_file.write_all(b"\n")?;
                }
            }
        }
        StdinStyle::DevNull => unreachable!("handled above"),
    }
    stdin_file.seek(SeekFrom::Start(0))?;
    Ok(Stdio::from(stdin_file))
}

fn open_redirect(redirect: &Redirect) -> std::io::Result<Stdio> {
    let mut opts = std::fs::OpenOptions::new();
    opts.create(true).write(true);
    if redirect.append {
        opts.append(true);
    } else {
        opts.truncate(true);
    }
    Ok(Stdio::from(opts.open(&redirect.path)?))
}

fn working_dir(def: &TriggerDef, fire: &TriggerFire) -> PathString {
    let base = fire
        .relative_root
        .clone()
        .unwrap_or_else(|| fire.root_path.clone());
    match &def.chdir {
        None => base,
        Some(target) if target.starts_with('/') => PathString::new(target.as_str()),
        Some(target) => base.path_cat(target.split('/')),
    }
}

fn spawn_command(def: &TriggerDef, fire: &TriggerFire) -> Option<tokio::process::Child> {
    let env = build_env(def, fire);

    // Record an overflow before stdin preparation truncates the results to
    // the configured limit.
    let overflow = def.max_files_stdin > 0 && fire.files.len() > def.max_files_stdin;
    let (args, overflow) = compute_argv(def, &env, &fire.deduped_names, overflow);

    let stdin = match prepare_stdin(def, fire) {
        Ok(stdin) => stdin,
        Err(err) => {
            error!(trigger = %def.name, %err, "unable to prepare trigger stdin");
            return None;
        }
    };

    let mut command = tokio::process::Command::new(&args[0]);
    command
        .args(&args[1..])
        .envs(&env)
        .env("WATCHMAN_FILES_OVERFLOW", if overflow { "true" } else { "false" })
        .stdin(stdin)
        .current_dir(working_dir(def, fire).as_std_path());

    match &def.stdout {
        Some(redirect) => match open_redirect(redirect) {
            Ok(stdio) => {
                command.stdout(stdio);
            }
            Err(err) => {
                error!(trigger = %def.name, %err, "unable to open stdout redirection");
                return None;
            }
        },
        None => {}
    }
    match &def.stderr {
        Some(redirect) => match open_redirect(redirect) {
            Ok(stdio) => {
                command.stderr(stdio);
            }
            Err(err) => {
                error!(trigger = %def.name, %err, "unable to open stderr redirection");
                return None;
            }
        },
        None => {}
    }

    debug!(trigger = %def.name, args = args.len(), "spawning trigger command");
    match command.spawn() {
        Ok(child) => Some(child),
        Err(err) => {
            // No retry is scheduled; the next change will re-assess.
            error!(trigger = %def.name, %err, "trigger spawn failed");
            None
        }
    }
}

/// The per-trigger task: wait for settles, assess via the engine, spawn.
pub(crate) async fn run_trigger_task(
    name: String,
    def: std::sync::Arc<TriggerDef>,
    requests: mpsc::Sender<EngineRequest>,
    mut settle_rx: broadcast::Receiver<SettleEvent>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    debug!(trigger = %name, "waiting for settle");
    let mut current_child: Option<tokio::process::Child> = None;

    loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            event = settle_rx.recv() => match event {
                Ok(event) => {
                    debug!(trigger = %name, tick = event.tick, "settled");
                    let (tx, rx) = oneshot::channel();
                    if requests
                        .send(EngineRequest::TriggerAssess {
                            name: name.clone(),
                            resp: tx,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                    let fire = match rx.await {
                        Ok(Some(fire)) => fire,
                        Ok(None) => continue,
                        Err(_) => break,
                    };
                    if let Some(mut child) = spawn_command(&def, &fire) {
                        // Single instance: wait out the child before
                        // looking at the next settled batch.
                        tokio::select! {
                            biased;
                            _ = &mut stop_rx => {
                                current_child = Some(child);
                                break;
                            }
                            status = child.wait() => {
                                if let Ok(status) = status {
                                    debug!(trigger = %name, %status, "trigger command finished");
                                }
                            }
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(trigger = %name, skipped, "missed settle events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    if let Some(mut child) = current_child.take() {
        let _ = child.kill().await;
        let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
    }
    debug!(trigger = %name, "trigger task exiting");
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use serde_json::json;
    use vigil_path::PathString;

    use super::{compute_argv, parse_trigger, Redirect, StdinStyle};
    use crate::{errors::TriggerError, query::CaseSensitivity};

    fn root() -> PathString {
        PathString::new("/repo")
    }

    fn parse(def: serde_json::Value) -> Result<super::TriggerDef, TriggerError> {
        parse_trigger(&root(), CaseSensitivity::Sensitive, &def).map(|(def, _query)| def)
    }

    #[test]
    fn test_parse_minimal_trigger() {
        let def = parse(json!({
            "name": "build",
            "command": ["make", "all"],
        }))
        .unwrap();
        assert_eq!(def.name, "build");
        assert_eq!(def.command, vec!["make", "all"]);
        assert_eq!(def.stdin_style, StdinStyle::DevNull);
        assert!(!def.append_files);
        assert_eq!(def.max_files_stdin, 0);
    }

    #[test]
    fn test_parse_stdin_styles() {
        let def = parse(json!({
            "name": "t", "command": ["x"], "stdin": ["name", "exists"],
        }))
        .unwrap();
        assert_eq!(def.stdin_style, StdinStyle::Json);

        let def = parse(json!({
            "name": "t", "command": ["x"], "stdin": "NAME_PER_LINE",
        }))
        .unwrap();
        assert_eq!(def.stdin_style, StdinStyle::NamePerLine);

        let err = parse(json!({
            "name": "t", "command": ["x"], "stdin": "/dev/zero",
        }))
        .unwrap_err();
        assert!(matches!(err, TriggerError::InvalidStdin(_)));
    }

    #[test]
    fn test_parse_redirections() {
        let def = parse(json!({
            "name": "t", "command": ["x"],
            "stdout": ">/tmp/out.log",
            "stderr": ">>/tmp/err.log",
        }))
        .unwrap();
        assert_eq!(
            def.stdout,
            Some(Redirect {
                path: "/tmp/out.log".into(),
                append: false
            })
        );
        assert_eq!(
            def.stderr,
            Some(Redirect {
                path: "/tmp/err.log".into(),
                append: true
            })
        );

        let err = parse(json!({
            "name": "t", "command": ["x"], "stdout": "/tmp/raw",
        }))
        .unwrap_err();
        assert!(matches!(err, TriggerError::InvalidRedirection { .. }));
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        assert!(matches!(
            parse(json!({"command": ["x"]})),
            Err(TriggerError::InvalidName)
        ));
        assert!(matches!(
            parse(json!({"name": "t", "command": []})),
            Err(TriggerError::InvalidCommand)
        ));
        assert!(matches!(
            parse(json!({"name": "t", "command": ["x"], "max_files_stdin": -1})),
            Err(TriggerError::InvalidMaxFiles)
        ));
    }

    #[test]
    fn test_append_files_fits_within_budget() {
        let def = parse(json!({
            "name": "t", "command": ["run"], "append_files": true,
        }))
        .unwrap();
        let names: Vec<PathString> = (0..10)
            .map(|i| PathString::new(format!("file-{}.c", i)))
            .collect();
        let (args, overflow) = compute_argv(&def, &HashMap::new(), &names, false);
        assert!(!overflow);
        assert_eq!(args.len(), 11);
        assert_eq!(args[0], "run");
    }

    #[test]
    fn test_append_files_overflow_truncates_argv() {
        let def = parse(json!({
            "name": "t", "command": ["run"], "append_files": true,
        }))
        .unwrap();
        // 100k long names cannot possibly fit in any ARG_MAX.
        let names: Vec<PathString> = (0..100_000)
            .map(|i| PathString::new(format!("{:0>100}", i)))
            .collect();
        let (args, overflow) = compute_argv(&def, &HashMap::new(), &names, false);
        assert!(overflow);
        assert!(args.len() < names.len() + 1);
        // Budget is honored: total appended bytes stay under ARG_MAX.
        let appended: usize = args[1..].iter().map(|arg| arg.len() + 1 + 8).sum();
        assert!(appended <= super::arg_budget());
    }

    #[test]
    fn test_no_append_means_no_argv_growth() {
        let def = parse(json!({
            "name": "t", "command": ["run"],
        }))
        .unwrap();
        let names = vec![PathString::new("a"), PathString::new("b")];
        let (args, overflow) = compute_argv(&def, &HashMap::new(), &names, false);
        assert_eq!(args, vec!["run"]);
        assert!(!overflow);
    }
}
