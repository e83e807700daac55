//! Integration tests over real subprocesses and filesystems: git
//! repositories in tempdirs, the town directory layout, and the
//! heartbeat/triage chain. No tmux server or bd database is required.

use chrono::{Duration, Utc};
use gt_core::errors::GtError;
use gt_core::feed::{Event, FeedTailer, FeedWriter};
use gt_core::identity::Role;
use gt_core::workspace::{role_from_cwd, CwdRole};
use gt_runtime::git::Git;
use gt_runtime::town_ops::init_town;
use gt_runtime::watchdog::{freshness, triage, Heartbeat, TriageAction, TriageObservation};

async fn init_repo(dir: &std::path::Path) -> Git {
    let git = Git::at(dir);
    for args in [
        vec!["init", "-b", "main"],
        vec!["config", "user.email", "gt@test"],
        vec!["config", "user.name", "gt"],
    ] {
        let out = git.run(&args).await.unwrap();
        assert!(out.success(), "git {args:?}: {}", out.stderr);
    }
    git
}

async fn commit_file(git: &Git, name: &str, content: &str, message: &str) {
    std::fs::write(git.repo().join(name), content).unwrap();
    assert!(git.run(&["add", "."]).await.unwrap().success());
    assert!(git
        .run(&["commit", "-m", message])
        .await
        .unwrap()
        .success());
}

#[tokio::test]
async fn rebase_conflict_is_detected_and_aborted() {
    let dir = tempfile::tempdir().unwrap();
    let git = init_repo(dir.path()).await;
    commit_file(&git, "a.txt", "base\n", "base").await;

    // Diverge: same line changed on both branches.
    assert!(git
        .run(&["checkout", "-b", "feature"])
        .await
        .unwrap()
        .success());
    commit_file(&git, "a.txt", "feature\n", "feature change").await;
    git.checkout("main").await.unwrap();
    commit_file(&git, "a.txt", "mainline\n", "main change").await;
    git.checkout("feature").await.unwrap();

    let err = git.rebase("main").await.unwrap_err();
    assert!(
        matches!(err, GtError::GitConflict { .. }),
        "expected GitConflict, got {err:?}"
    );
    // The rebase was aborted: clean tree, still on feature.
    assert!(git.status_porcelain().await.unwrap().trim().is_empty());
    let head = git
        .run(&["rev-parse", "--abbrev-ref", "HEAD"])
        .await
        .unwrap();
    assert_eq!(head.stdout.trim(), "feature");
}

#[tokio::test]
async fn clean_rebase_and_ff_merge() {
    let dir = tempfile::tempdir().unwrap();
    let git = init_repo(dir.path()).await;
    commit_file(&git, "a.txt", "base\n", "base").await;

    assert!(git
        .run(&["checkout", "-b", "feature"])
        .await
        .unwrap()
        .success());
    commit_file(&git, "b.txt", "new file\n", "feature adds b").await;
    git.checkout("main").await.unwrap();
    commit_file(&git, "c.txt", "other file\n", "main adds c").await;

    git.checkout("feature").await.unwrap();
    git.rebase("main").await.unwrap();
    let feature_sha = git.head_sha().await.unwrap();

    git.checkout("main").await.unwrap();
    git.merge_ff_only("feature").await.unwrap();
    assert_eq!(git.head_sha().await.unwrap(), feature_sha);
    assert!(git.is_ancestor(&feature_sha, "HEAD").await.unwrap());
}

#[tokio::test]
async fn push_verify_sha_against_local_remote() {
    let remote_dir = tempfile::tempdir().unwrap();
    let bare = Git::at(remote_dir.path());
    assert!(bare
        .run(&["init", "--bare", "-b", "main"])
        .await
        .unwrap()
        .success());

    let work_dir = tempfile::tempdir().unwrap();
    let git = init_repo(work_dir.path()).await;
    commit_file(&git, "a.txt", "hello\n", "init").await;
    let remote_path = remote_dir.path().to_string_lossy().into_owned();
    assert!(git
        .run(&["remote", "add", "origin", &remote_path])
        .await
        .unwrap()
        .success());

    let sha = git.head_sha().await.unwrap();
    git.push_verify_sha("origin", "main", &sha).await.unwrap();

    // A stale expectation must fail loudly.
    commit_file(&git, "a.txt", "hello again\n", "second").await;
    let new_sha = git.head_sha().await.unwrap();
    let err = git
        .push_verify_sha("origin", "main", &sha)
        .await
        .unwrap_err();
    assert!(matches!(err, GtError::GitPushMismatch { .. }));
    // With the right SHA it verifies.
    git.push_verify_sha("origin", "main", &new_sha).await.unwrap();
}

#[test]
fn town_layout_and_role_detection() {
    let dir = tempfile::tempdir().unwrap();
    let town = init_town(dir.path(), "citadel").unwrap();
    let rig = town.rig("demo");
    std::fs::create_dir_all(rig.polecat_dir("nux")).unwrap();
    std::fs::create_dir_all(rig.refinery_clone()).unwrap();

    assert_eq!(
        role_from_cwd(town.root(), &rig.polecat_dir("nux")),
        CwdRole::Worker {
            role: Role::Polecat,
            rig: Some("demo".into()),
            worker: "nux".into(),
        }
    );
    assert_eq!(
        role_from_cwd(town.root(), &rig.refinery_clone().join("src")),
        CwdRole::RigSingleton {
            role: Role::Refinery,
            rig: "demo".into(),
        }
    );
}

#[test]
fn feed_round_trip_through_rig_layout() {
    let dir = tempfile::tempdir().unwrap();
    let town = init_town(dir.path(), "citadel").unwrap();
    let path = town.rig("demo").feed_path();

    let mut tailer = FeedTailer::from_end(&path).unwrap();
    let mut writer = FeedWriter::new(&path);
    writer
        .write(
            &Event::new("spawn", "demo/witness")
                .target("demo-12")
                .rig("demo")
                .role("witness"),
        )
        .unwrap();

    let events = tailer.poll().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].rig, "demo");
    assert_eq!(events[0].kind, "spawn");
}

#[test]
fn heartbeat_staleness_drives_triage() {
    let dir = tempfile::tempdir().unwrap();
    let town = init_town(dir.path(), "citadel").unwrap();
    let hb_path = town.deacon_heartbeat();

    // Fresh heartbeat: boot does nothing.
    Heartbeat::touch(&hb_path).unwrap();
    let age = Heartbeat::age_minutes(&hb_path, Utc::now()).unwrap();
    let action = triage(TriageObservation {
        session_dead: false,
        error_in_pane: false,
        freshness: Some(freshness(age)),
        mail_waiting: true,
    });
    assert_eq!(action, TriageAction::Nothing);

    // A 31-minute-old heartbeat is very stale: WAKE.
    let age = Heartbeat::age_minutes(&hb_path, Utc::now() + Duration::minutes(31)).unwrap();
    let action = triage(TriageObservation {
        session_dead: false,
        error_in_pane: false,
        freshness: Some(freshness(age)),
        mail_waiting: false,
    });
    assert_eq!(action, TriageAction::Wake);
}
