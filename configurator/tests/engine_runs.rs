//! Interpreter-level tests driving roles and stacks over temporary project
//! trees with a scripted launcher.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde_json::json;

use configurator::core::data::DataContext;
use configurator::core::types::HostIdentity;
use configurator::engine::{Engine, RunOutcome, SkipReason};
use configurator::error::EngineError;
use configurator::io::config::ExecutionConfig;
use configurator::io::launcher::SystemLauncher;
use configurator::test_support::{ProjectTree, ScriptedLauncher};

fn live() -> ExecutionConfig {
    ExecutionConfig {
        dry_run: false,
        ..ExecutionConfig::default()
    }
}

fn host(tags: &[(&str, &str)]) -> HostIdentity {
    let tags: BTreeMap<String, String> = tags
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    HostIdentity::new("web-01").with_tags(tags)
}

/// `deploy = [logic/build, logic/test]`: build's JSON output reaches test as
/// `previous_step`.
#[test]
fn previous_step_feeds_next_logic_unit() {
    let tree = ProjectTree::new();
    tree.stack("deploy", &["logic/build", "logic/test"])
        .python_logic("build", "")
        .python_logic("test", "");
    let config = live();
    let host = host(&[]);
    let launcher = ScriptedLauncher::new(vec![
        ScriptedLauncher::ok(r#"{"artifact":"x.tar"}"#),
        ScriptedLauncher::ok("tests passed"),
    ]);
    let engine = Engine::new(tree.paths(), &config, &host, &launcher);

    let mut ctx = DataContext::new();
    let outcome = engine.run_stack("deploy", &mut ctx).expect("run");

    assert_eq!(outcome.output(), "{\"artifact\":\"x.tar\"}\ntests passed");
    assert_eq!(launcher.stdin_json(0), json!({}));
    assert_eq!(
        launcher.stdin_json(1),
        json!({"previous_step": {"artifact": "x.tar"}})
    );
    // Non-JSON output leaves the previous value in place.
    assert_eq!(ctx.get("previous_step"), Some(&json!({"artifact": "x.tar"})));
}

#[test]
fn previous_step_crosses_nested_stack_boundaries() {
    let tree = ProjectTree::new();
    tree.stack("outer", &["stacks/inner", "logic/after"])
        .stack("inner", &["logic/first", "logic/second"])
        .python_logic("first", "")
        .python_logic("second", "")
        .python_logic("after", "");
    let config = live();
    let host = host(&[]);
    let launcher = ScriptedLauncher::new(vec![
        ScriptedLauncher::ok(r#"{"n":1}"#),
        ScriptedLauncher::ok(r#"{"n":2}"#),
        ScriptedLauncher::ok("done"),
    ]);
    let engine = Engine::new(tree.paths(), &config, &host, &launcher);

    engine
        .run_stack("outer", &mut DataContext::new())
        .expect("run");

    assert_eq!(launcher.stdin_json(1)["previous_step"], json!({"n": 1}));
    assert_eq!(launcher.stdin_json(2)["previous_step"], json!({"n": 2}));
}

/// `[1,` and `2]` are not JSON on their own; their join must not become
/// `previous_step`.
#[test]
fn joined_nested_output_is_not_recorded() {
    let tree = ProjectTree::new();
    tree.stack("outer", &["stacks/inner", "logic/after"])
        .stack("inner", &["logic/first", "logic/second"])
        .python_logic("first", "")
        .python_logic("second", "")
        .python_logic("after", "");
    let config = live();
    let host = host(&[]);
    let launcher = ScriptedLauncher::new(vec![
        ScriptedLauncher::ok("[1,"),
        ScriptedLauncher::ok("2]"),
        ScriptedLauncher::ok("done"),
    ]);
    let engine = Engine::new(tree.paths(), &config, &host, &launcher);

    let mut ctx = DataContext::new();
    engine.run_stack("outer", &mut ctx).expect("run");

    assert_eq!(launcher.stdin_json(2), json!({}));
    assert_eq!(ctx.get("previous_step"), None);
}

#[test]
fn failing_step_stops_the_stack() {
    let tree = ProjectTree::new();
    tree.stack("site", &["logic/a", "logic/b", "logic/c"])
        .python_logic("a", "")
        .python_logic("b", "")
        .python_logic("c", "");
    let config = live();
    let host = host(&[]);
    let launcher = ScriptedLauncher::new(vec![
        ScriptedLauncher::ok("a ok"),
        ScriptedLauncher::failed(1, "b exploded"),
        ScriptedLauncher::ok("c ok"),
    ]);
    let engine = Engine::new(tree.paths(), &config, &host, &launcher);

    let err = engine
        .run_stack("site", &mut DataContext::new())
        .unwrap_err();

    assert!(matches!(err, EngineError::LogicExecution { ref name, .. } if name == "b"));
    assert_eq!(err.output(), Some("b exploded"));
    assert_eq!(launcher.requests().len(), 2);
}

#[test]
fn failure_in_nested_stack_aborts_parent() {
    let tree = ProjectTree::new();
    tree.stack("outer", &["stacks/inner", "logic/never"])
        .stack("inner", &["logic/boom"])
        .python_logic("boom", "")
        .python_logic("never", "");
    let config = live();
    let host = host(&[]);
    let launcher = ScriptedLauncher::new(vec![ScriptedLauncher::failed(3, "")]);
    let engine = Engine::new(tree.paths(), &config, &host, &launcher);

    let err = engine
        .run_stack("outer", &mut DataContext::new())
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::LogicExecution {
            exit_code: Some(3),
            ..
        }
    ));
    assert_eq!(launcher.requests().len(), 1);
}

#[test]
fn unknown_step_prefixes_are_skipped() {
    let tree = ProjectTree::new();
    tree.stack("mixed", &["files/motd", "logic/only"])
        .python_logic("only", "");
    let config = live();
    let host = host(&[]);
    let launcher = ScriptedLauncher::new(vec![ScriptedLauncher::ok("ran")]);
    let engine = Engine::new(tree.paths(), &config, &host, &launcher);

    let outcome = engine
        .run_stack("mixed", &mut DataContext::new())
        .expect("run");
    assert_eq!(outcome.output(), "ran");
}

#[test]
fn data_files_fill_only_missing_keys() {
    let tree = ProjectTree::new();
    tree.stack("outer", &["stacks/inner"])
        .stack("inner", &["logic/show"])
        .data("outer", "users", r#"["alice"]"#)
        .data("inner", "users", r#"["mallory"]"#)
        .data("inner", "motd", r#""welcome""#)
        .data("outer", "preset", r#""from file""#)
        .python_logic("show", "");
    let config = live();
    let host = host(&[]);
    let launcher = ScriptedLauncher::new(vec![ScriptedLauncher::ok("")]);
    let engine = Engine::new(tree.paths(), &config, &host, &launcher);

    let mut ctx = DataContext::new();
    ctx.insert("preset", json!("from caller"));
    engine.run_stack("outer", &mut ctx).expect("run");

    assert_eq!(
        launcher.stdin_json(0),
        json!({
            "preset": "from caller",
            "users": ["alice"],
            "motd": "welcome",
        })
    );
}

#[test]
fn malformed_data_file_fails_before_steps() {
    let tree = ProjectTree::new();
    tree.stack("base", &["logic/x"])
        .data("base", "broken", "{not json")
        .python_logic("x", "");
    let config = live();
    let host = host(&[]);
    let launcher = ScriptedLauncher::new(Vec::new());
    let engine = Engine::new(tree.paths(), &config, &host, &launcher);

    let err = engine
        .run_stack("base", &mut DataContext::new())
        .unwrap_err();
    assert!(matches!(err, EngineError::DataMerge { .. }));
    assert!(launcher.requests().is_empty());
}

#[test]
fn missing_stack_is_config_load_error() {
    let tree = ProjectTree::new();
    tree.stack("outer", &["stacks/ghost"]);
    let config = live();
    let host = host(&[]);
    let launcher = ScriptedLauncher::new(Vec::new());
    let engine = Engine::new(tree.paths(), &config, &host, &launcher);

    let err = engine
        .run_stack("outer", &mut DataContext::new())
        .unwrap_err();
    assert!(matches!(err, EngineError::ConfigLoad { ref name, .. } if name == "ghost"));
}

#[test]
fn cyclic_stacks_are_rejected() {
    let tree = ProjectTree::new();
    tree.stack("loop", &["logic/once", "stacks/loop"])
        .python_logic("once", "");
    let config = live();
    let host = host(&[]);
    let launcher = ScriptedLauncher::new(vec![ScriptedLauncher::ok("")]);
    let engine = Engine::new(tree.paths(), &config, &host, &launcher);

    let err = engine
        .run_stack("loop", &mut DataContext::new())
        .unwrap_err();
    assert_eq!(err.to_string(), "cyclic stack reference: loop -> loop");
}

/// Roles `a-web`, `b-db`, `c-web`: only `a-web` runs even though `c-web` also
/// matches.
#[test]
fn run_roles_stops_at_first_match() {
    let tree = ProjectTree::new();
    tree.role("a-web", &["logic/a"], r#"tags = ["role:web"]"#)
        .role("b-db", &["logic/b"], r#"tags = ["role:db"]"#)
        .role("c-web", &["logic/c"], r#"hostname = ["~", "^web-"]"#)
        .python_logic("a", "")
        .python_logic("b", "")
        .python_logic("c", "");
    let config = live();
    let host = host(&[("role", "web")]);
    let launcher = ScriptedLauncher::new(vec![
        ScriptedLauncher::ok("a ran"),
        ScriptedLauncher::ok("c ran"),
    ]);
    let engine = Engine::new(tree.paths(), &config, &host, &launcher);

    let outcome = engine.run_roles().expect("run");

    assert_eq!(outcome.output(), "a ran");
    let requests = launcher.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].args[0].ends_with("logic/a/__init__.py"));
}

#[test]
fn role_without_matchers_never_runs() {
    let tree = ProjectTree::new();
    tree.role("a-any", &["logic/a"], "").python_logic("a", "");
    let config = live();
    let host = host(&[("role", "web")]);
    let launcher = ScriptedLauncher::new(Vec::new());
    let engine = Engine::new(tree.paths(), &config, &host, &launcher);

    assert_eq!(
        engine.run_roles().expect("run"),
        RunOutcome::Skipped {
            reason: SkipReason::NoMatch
        }
    );
    assert_eq!(
        engine
            .run_role("a-any", &mut DataContext::new())
            .expect("run"),
        RunOutcome::Skipped {
            reason: SkipReason::NoMatch
        }
    );
    assert!(launcher.requests().is_empty());
}

#[test]
fn hostname_matcher_takes_precedence_over_tags() {
    let tree = ProjectTree::new();
    tree.role(
        "db",
        &["logic/a"],
        "hostname = [\"=\", \"db-01\"]\ntags = [\"role:web\"]",
    )
    .python_logic("a", "");
    let config = live();
    let host = host(&[("role", "web")]);
    let launcher = ScriptedLauncher::new(Vec::new());
    let engine = Engine::new(tree.paths(), &config, &host, &launcher);

    let outcome = engine
        .run_role("db", &mut DataContext::new())
        .expect("run");
    assert!(outcome.is_skipped());
}

#[test]
fn role_steps_share_one_context() {
    let tree = ProjectTree::new();
    tree.role("web", &["stacks/base", "logic/app"], r#"tags = ["role:web"]"#)
        .stack("base", &["logic/users"])
        .data("base", "users", r#"["alice"]"#)
        .python_logic("users", "")
        .python_logic("app", "");
    let config = live();
    let host = host(&[("role", "web")]);
    let launcher = ScriptedLauncher::new(vec![
        ScriptedLauncher::ok(r#"{"created":["alice"]}"#),
        ScriptedLauncher::ok("app ok"),
    ]);
    let engine = Engine::new(tree.paths(), &config, &host, &launcher);

    let mut ctx = DataContext::new();
    engine.run_role("web", &mut ctx).expect("run");

    assert_eq!(
        launcher.stdin_json(1),
        json!({"users": ["alice"], "previous_step": {"created": ["alice"]}})
    );
}

#[test]
fn false_condition_skips_cleanly() {
    let tree = ProjectTree::new();
    tree.role("web", &["logic/a"], r#"tags = ["role:web"]"#)
        .stack("site", &["logic/a"])
        .python_logic("a", "");
    let mut config = live();
    config.set_conditions("tags.env == 'prod' && name.startsWith('web-')");
    let host = host(&[("role", "web"), ("env", "dev")]);
    let launcher = ScriptedLauncher::new(Vec::new());
    let engine = Engine::new(tree.paths(), &config, &host, &launcher);

    let condition_false = RunOutcome::Skipped {
        reason: SkipReason::ConditionFalse,
    };
    assert_eq!(engine.run_roles().expect("roles"), condition_false);
    assert_eq!(
        engine
            .run_stack("site", &mut DataContext::new())
            .expect("stack"),
        condition_false
    );
    assert_eq!(
        engine
            .run_logic("a", &mut DataContext::new())
            .expect("logic"),
        condition_false
    );
    assert!(launcher.requests().is_empty());
}

#[test]
fn true_condition_runs() {
    let tree = ProjectTree::new();
    tree.stack("site", &["logic/a"]).python_logic("a", "");
    let mut config = live();
    config.set_conditions("tags.env === 'prod' || name.matches('^db-')");
    let host = host(&[("env", "prod")]);
    let launcher = ScriptedLauncher::new(vec![ScriptedLauncher::ok("ok")]);
    let engine = Engine::new(tree.paths(), &config, &host, &launcher);

    let outcome = engine
        .run_stack("site", &mut DataContext::new())
        .expect("run");
    assert_eq!(outcome.output(), "ok");
}

#[test]
fn condition_error_is_fatal() {
    let tree = ProjectTree::new();
    tree.stack("site", &["logic/a"]).python_logic("a", "");
    let mut config = live();
    config.set_conditions("hostname == 'web-01'");
    let host = host(&[]);
    let launcher = ScriptedLauncher::new(Vec::new());
    let engine = Engine::new(tree.paths(), &config, &host, &launcher);

    let err = engine
        .run_stack("site", &mut DataContext::new())
        .unwrap_err();
    assert!(matches!(err, EngineError::Evaluation { .. }));
    assert!(launcher.requests().is_empty());
}

#[test]
fn dry_run_never_launches() {
    let tree = ProjectTree::new();
    tree.role("web", &["stacks/site"], r#"tags = ["role:web"]"#)
        .stack("site", &["logic/py", "logic/rb"])
        .python_logic("py", "raise SystemExit(1)")
        .logic_file("py", "requirements.txt", "flask\n")
        .ruby_logic("rb", "exit 1");
    let config = ExecutionConfig {
        python_path: "/nonexistent/python".to_string(),
        ruby_path: "/nonexistent/ruby".to_string(),
        ..ExecutionConfig::default()
    };
    let host = host(&[("role", "web")]);
    let launcher = ScriptedLauncher::new(Vec::new());
    let engine = Engine::new(tree.paths(), &config, &host, &launcher);

    let outcome = engine.run_roles().expect("dry run");

    let lines: Vec<&str> = outcome.output().lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("[--dryrun] /nonexistent/python "));
    assert!(lines[0].ends_with("logic/py/__init__.py"));
    assert!(lines[1].starts_with("[--dryrun] /nonexistent/ruby "));
    assert!(lines[1].ends_with("logic/rb/rb.rb"));
    assert!(launcher.requests().is_empty());
}

#[test]
fn unsupported_logic_unit_fails_even_in_dry_run() {
    let tree = ProjectTree::new();
    tree.stack("site", &["logic/shell"])
        .logic_file("shell", "run.sh", "echo hi");
    let config = ExecutionConfig::default();
    let host = host(&[]);
    let launcher = ScriptedLauncher::new(Vec::new());
    let engine = Engine::new(tree.paths(), &config, &host, &launcher);

    let err = engine
        .run_stack("site", &mut DataContext::new())
        .unwrap_err();
    assert!(matches!(err, EngineError::UnsupportedLogicKind { .. }));
}

/// Uses `/bin/sh` as the Python interpreter so the entry points are shell scripts.
#[test]
fn live_run_pipes_context_through_real_processes() {
    let tree = ProjectTree::new();
    tree.stack("site", &["logic/echo", "logic/check"])
        .data("site", "greeting", r#""hi""#)
        .python_logic("echo", "cat\n")
        .python_logic(
            "check",
            "grep -q '\"previous_step\":{\"greeting\":\"hi\"}' && echo \"found $1\"\n",
        );
    let config = ExecutionConfig {
        dry_run: false,
        python_path: "/bin/sh".to_string(),
        ..ExecutionConfig::default()
    };
    let host = host(&[]);
    let engine = Engine::new(tree.paths(), &config, &host, &SystemLauncher);

    let outcome = engine
        .run_stack("site", &mut DataContext::new())
        .expect("run");
    assert_eq!(
        outcome.output(),
        "{\"greeting\":\"hi\"}\nfound --no-dryrun\n"
    );
}

#[test]
fn live_run_times_out_hung_unit() {
    let tree = ProjectTree::new();
    tree.stack("site", &["logic/hang"])
        .python_logic("hang", "echo started\nexec sleep 10\n");
    let config = ExecutionConfig {
        dry_run: false,
        python_path: "/bin/sh".to_string(),
        logic_timeout_secs: 1,
        ..ExecutionConfig::default()
    };
    let host = host(&[]);
    let engine = Engine::new(tree.paths(), &config, &host, &SystemLauncher);

    let err = engine
        .run_stack("site", &mut DataContext::new())
        .unwrap_err();
    assert!(matches!(err, EngineError::Timeout { .. }));
    assert_eq!(err.output(), Some("started\n"));
}

/// The unit ignores a context larger than a pipe buffer and waits on a child
/// of its own; the deadline still ends the run.
#[test]
fn live_run_timeout_covers_unread_input_and_grandchildren() {
    let tree = ProjectTree::new();
    let blob = format!("\"{}\"", "x".repeat(256 * 1024));
    tree.stack("site", &["logic/stuck"])
        .data("site", "blob", &blob)
        .python_logic("stuck", "echo started\nsleep 10\necho late\n");
    let config = ExecutionConfig {
        dry_run: false,
        python_path: "/bin/sh".to_string(),
        logic_timeout_secs: 1,
        ..ExecutionConfig::default()
    };
    let host = host(&[]);
    let engine = Engine::new(tree.paths(), &config, &host, &SystemLauncher);

    let started = Instant::now();
    let err = engine
        .run_stack("site", &mut DataContext::new())
        .unwrap_err();

    assert!(matches!(err, EngineError::Timeout { .. }));
    assert_eq!(err.output(), Some("started\n"));
    assert!(started.elapsed() < Duration::from_secs(5));
}
