//! Drives the compiled binary against a throwaway data directory.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

struct Env {
    data: tempfile::TempDir,
    project: tempfile::TempDir,
}

impl Env {
    fn new() -> Self {
        Self {
            data: tempfile::tempdir().unwrap(),
            project: tempfile::tempdir().unwrap(),
        }
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_autopatch"))
            .args(args)
            .env("AUTOPATCH_DATA_DIR", self.data.path())
            .current_dir(self.project.path())
            .output()
            .unwrap()
    }

    fn local_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.project.path().join("incoming").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    fn proposal_ids(&self) -> Vec<String> {
        let dir = self.data.path().join("patches");
        let mut ids: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| !name.starts_with('.'))
            .collect();
        ids.sort();
        ids
    }

    fn record(&self, id: &str) -> serde_json::Value {
        let path = self.data.path().join("patches").join(id).join("proposal.json");
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).to_string()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).to_string()
}

fn submit(env: &Env, title: &str, rel: &str, local: &Path) -> String {
    let spec = format!("{}={}", rel, local.display());
    let out = env.run(&["patch", "submit", "--title", title, "--file", &spec]);
    assert!(out.status.success(), "submit failed: {}", stderr(&out));
    let ids = env.proposal_ids();
    ids.last().cloned().unwrap()
}

#[test]
fn submit_list_approve_and_approve_again() {
    let env = Env::new();
    let local = env.local_file("settings.json", "{\"retries\": 3}\n");

    let id = submit(&env, "Raise retries", "src/settings.json", &local);
    assert_eq!(env.proposal_ids().len(), 1);
    let record = env.record(&id);
    assert_eq!(record["status"], "PROPOSED");
    assert_eq!(record["validated"], true);

    let list = env.run(&["patch", "list"]);
    assert!(list.status.success());
    assert!(stdout(&list).contains(&id));

    let proposed = env.run(&["patch", "list", "--status", "proposed"]);
    assert!(stdout(&proposed).contains(&id));
    let merged = env.run(&["patch", "list", "--status", "merged"]);
    assert!(!stdout(&merged).contains(&id));

    let approve = env.run(&["patch", "approve", &id]);
    assert!(approve.status.success(), "approve failed: {}", stderr(&approve));
    assert_eq!(env.record(&id)["status"], "APPROVED");

    let again = env.run(&["patch", "approve", &id]);
    assert!(!again.status.success());
    assert!(stderr(&again).contains("Invalid transition"));
    assert_eq!(env.record(&id)["status"], "APPROVED");
}

#[test]
fn approved_patch_merges_into_project() {
    let env = Env::new();
    let local = env.local_file("settings.json", "{\"retries\": 5}\n");
    let id = submit(&env, "Tune retries", "src/settings.json", &local);

    assert!(env.run(&["patch", "approve", &id]).status.success());
    let merge = env.run(&["patch", "merge", &id]);
    assert!(merge.status.success(), "merge failed: {}", stderr(&merge));

    let written = env.project.path().join("src/settings.json");
    assert_eq!(std::fs::read_to_string(written).unwrap(), "{\"retries\": 5}\n");
    assert_eq!(env.record(&id)["status"], "MERGED");
    assert!(env.data.path().join("apply_history.jsonl").is_file());
}

#[test]
fn failed_validation_is_proposed_but_never_merged() {
    let env = Env::new();
    let local = env.local_file("broken.json", "{\"retries\": \n");
    let id = submit(&env, "Broken", "src/broken.json", &local);

    assert_eq!(env.record(&id)["status"], "PROPOSED");
    let show = env.run(&["patch", "show", &id]);
    assert!(stdout(&show).contains("failed"));

    assert!(env.run(&["patch", "approve", &id]).status.success());
    let merge = env.run(&["patch", "merge", &id]);
    assert!(!merge.status.success());
    assert!(!env.project.path().join("src/broken.json").exists());
    assert_eq!(env.record(&id)["status"], "APPROVED");
}

#[test]
fn list_warns_about_unreadable_proposals() {
    let env = Env::new();
    let local = env.local_file("settings.json", "{\"retries\": 1}\n");
    let id = submit(&env, "Readable", "src/settings.json", &local);
    let broken = env.data.path().join("patches").join("20200101_000000_000000_dead00");
    std::fs::create_dir_all(&broken).unwrap();
    std::fs::write(broken.join("proposal.json"), "{ truncated").unwrap();

    let list = env.run(&["patch", "list"]);

    assert!(list.status.success());
    assert!(stdout(&list).contains(&id));
    assert!(!stdout(&list).contains("dead00"));
    assert!(stderr(&list).contains("Skipping unreadable proposal 20200101_000000_000000_dead00"));
}

#[test]
fn unknown_proposal_is_an_error() {
    let env = Env::new();
    let out = env.run(&["patch", "approve", "20200101_000000_000000_abcdef"]);
    assert!(!out.status.success());
    assert!(stderr(&out).contains("not found"));
}
