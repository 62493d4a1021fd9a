//! CLI tests: spawn the devflow binary and check stdout, stderr and exit codes.

use std::path::Path;
use std::process::{Command, Output};

use devflow::exit_codes;
use devflow::io::config::{DevflowConfig, ProviderConfig, write_config};
use devflow::io::init::{InitOptions, init_devflow};
use devflow::test_support::{TestRepo, git, git_available};

const PLAN: &str = r#"{"stories": [
  {"key": "api", "story_type": "implementation", "title": "Login API", "instructions": "Add the endpoint.", "priority": 1},
  {"key": "tests", "story_type": "unit_tests", "title": "Login tests", "instructions": "Cover the endpoint.", "priority": 2, "depends_on": ["api"]}
]}
"#;

fn devflow(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_devflow"))
        .current_dir(root)
        .args(args)
        .output()
        .expect("spawn devflow")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn commands_fail_with_a_category_before_init() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = devflow(temp.path(), &["next"]);
    assert_eq!(output.status.code(), Some(exit_codes::FAULT));
    assert!(stderr(&output).starts_with("error[internal]:"));
    assert!(stderr(&output).contains("devflow init"));
}

#[test]
fn unknown_story_reports_entity_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    init_devflow(temp.path(), &InitOptions { force: false }).expect("init");
    let output = devflow(temp.path(), &["log", "5"]);
    assert_eq!(output.status.code(), Some(exit_codes::FAULT));
    assert!(stderr(&output).starts_with("error[entity_not_found]: story 5 not found"));
}

#[test]
fn refine_implement_and_run_end_to_end() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let repo = TestRepo::new();
    let root = repo.path();

    let init = devflow(root, &["init"]);
    assert_eq!(init.status.code(), Some(exit_codes::OK), "{}", stderr(&init));

    let plan_path = repo.join("plan.json");
    std::fs::write(&plan_path, PLAN).expect("write plan");
    let config = DevflowConfig {
        provider: ProviderConfig {
            command: vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("cat >/dev/null; cat '{}'", plan_path.display()),
            ],
            ..ProviderConfig::default()
        },
        ..DevflowConfig::default()
    };
    write_config(&root.join(".devflow/config.toml"), &config).expect("config");

    let create = devflow(root, &["create", "Login", "-d", "Users can log in"]);
    assert_eq!(stdout(&create).trim(), "1", "{}", stderr(&create));

    let refine = devflow(root, &["refine", "1"]);
    assert_eq!(refine.status.code(), Some(exit_codes::OK), "{}", stderr(&refine));
    assert_eq!(stdout(&refine), "1\n2\n");

    let next = devflow(root, &["next"]);
    assert_eq!(stdout(&next).trim(), "ready 1");

    let cycle = devflow(root, &["depend", "1", "2"]);
    assert_eq!(cycle.status.code(), Some(exit_codes::FAULT));
    assert!(stderr(&cycle).starts_with("error[cycle_detected]:"));

    let implement = devflow(root, &["implement"]);
    assert_eq!(
        implement.status.code(),
        Some(exit_codes::OK),
        "{}",
        stderr(&implement)
    );
    assert_eq!(stdout(&implement).trim(), "story 1 completed on us-1-1");
    assert!(git(root, &["branch", "--list", "us-1-1"]).contains("us-1-1"));
    assert!(!root.join(".devflow/worktrees/us-1-1").exists());

    let run = devflow(root, &["run", "--workers", "2"]);
    assert_eq!(run.status.code(), Some(exit_codes::OK), "{}", stderr(&run));
    let report = stdout(&run);
    assert!(report.contains("completed: 2"));
    assert!(report.ends_with("complete\n"));

    let list = stdout(&devflow(root, &["list"]));
    assert!(list.contains("work item 1 [completed]"));
    assert!(list.contains("story 2 [completed] p2 Login tests (unit_tests) requires 1\n"));

    let log = stdout(&devflow(root, &["log", "1"]));
    let events: Vec<&str> = log
        .lines()
        .map(|line| line.split_whitespace().nth(2).expect("event column"))
        .collect();
    assert_eq!(
        events,
        vec![
            "started",
            "branch_created",
            "worktree_created",
            "completed",
            "worktree_removed"
        ]
    );
}
