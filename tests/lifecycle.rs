//! Lifecycle tests: start/stop/drop/list against the in-memory hypervisor
//! and stub build tools.

mod common;

use std::os::unix::fs::PermissionsExt;

use appvm::error::AppvmError;
use appvm::vm::lifecycle::{StartOutcome, StopOutcome};
use appvm::vm::{self, AppName};

use common::{FakeHypervisor, GIB, SharedHypervisor, TestEnv, builder_with_script};

fn app(name: &str) -> AppName {
    AppName::new(name).unwrap()
}

// ---------------------------------------------------------------------------
// stop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_is_idempotent() {
    let mut hv = FakeHypervisor::new();
    let name = app("chromium");

    assert_eq!(vm::stop(&mut hv, &name).await.unwrap(), StopOutcome::AlreadyStopped);
    assert_eq!(vm::stop(&mut hv, &name).await.unwrap(), StopOutcome::AlreadyStopped);
    assert!(hv.shutdowns.is_empty());
}

#[tokio::test]
async fn stop_requests_shutdown_of_running_domain() {
    let mut hv = FakeHypervisor::new().with_domain("appvm_chromium", 2 * GIB, GIB);
    let outcome = vm::stop(&mut hv, &app("chromium")).await.unwrap();
    assert_eq!(outcome, StopOutcome::ShutdownRequested);
    assert_eq!(hv.shutdowns, vec!["appvm_chromium".to_string()]);
}

// ---------------------------------------------------------------------------
// start
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_then_stop_round_trip() {
    let env = TestEnv::new();
    env.add_spec("chromium");
    let mut hv = FakeHypervisor::new();
    let name = app("chromium");

    let outcome = vm::start(&mut hv, &env.config, &env.paths, &name, false)
        .await
        .unwrap();
    assert_eq!(outcome, StartOutcome::Created);
    assert!(vm::is_running(&mut hv, &name).await.unwrap());

    let desc = &hv.created[0];
    assert_eq!(desc.name, "appvm_chromium");
    assert_eq!(
        desc.system_image,
        std::fs::canonicalize(env.store.join("nixos-system")).unwrap()
    );
    assert_eq!(
        desc.reg_info,
        format!("regInfo={}/closure-info/registration", env.store.display())
    );
    assert_eq!(desc.shared_dir, env.paths.base.join("chromium"));
    assert!(desc.shared_dir.is_dir());
    assert_eq!(desc.disk_image, env.paths.disk_image());

    let mode = std::fs::metadata(env.paths.disk_image())
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o400);
    assert!(env.out_links().is_empty(), "out-link must be removed");

    assert_eq!(vm::stop(&mut hv, &name).await.unwrap(), StopOutcome::ShutdownRequested);
    hv.tear_down("appvm_chromium");
    assert!(!vm::is_running(&mut hv, &name).await.unwrap());
}

#[tokio::test]
async fn start_of_running_app_skips_build() {
    let mut env = TestEnv::new();
    env.set_builder("echo 'builder must not run' >&2; exit 1");
    let mut hv = FakeHypervisor::new().with_domain("appvm_chromium", 2 * GIB, GIB);

    let outcome = vm::start(&mut hv, &env.config, &env.paths, &app("chromium"), false)
        .await
        .unwrap();
    assert_eq!(outcome, StartOutcome::AlreadyRunning);
    assert!(hv.created.is_empty());
}

#[tokio::test]
async fn every_start_of_a_stopped_app_rebuilds() {
    let mut env = TestEnv::new();
    env.add_spec("chromium");
    let counter = env.tmp.path().join("builds");
    let builder = format!(
        "echo x >> \"{}\"\n{}",
        counter.display(),
        common::successful_builder(&env.store)
    );
    env.set_builder(&builder);
    let mut hv = FakeHypervisor::new();
    let name = app("chromium");

    vm::start(&mut hv, &env.config, &env.paths, &name, false).await.unwrap();
    hv.tear_down("appvm_chromium");
    vm::start(&mut hv, &env.config, &env.paths, &name, true).await.unwrap();

    let builds = std::fs::read_to_string(&counter).unwrap();
    assert_eq!(builds.lines().count(), 2);
    assert_eq!(hv.created.len(), 2);
}

#[tokio::test]
async fn concurrent_starts_create_one_domain() {
    let mut env = TestEnv::new();
    env.add_spec("chromium");
    let builder = format!("sleep 0.3\n{}", common::successful_builder(&env.store));
    env.set_builder(&builder);
    let shared = SharedHypervisor::new(FakeHypervisor::new());
    let (mut first, mut second) = (shared.clone(), shared.clone());
    let name = app("chromium");

    let (a, b) = tokio::join!(
        vm::start(&mut first, &env.config, &env.paths, &name, false),
        vm::start(&mut second, &env.config, &env.paths, &name, false),
    );

    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|o| *o == StartOutcome::AlreadyRunning);
    assert_eq!(outcomes, vec![StartOutcome::Created, StartOutcome::AlreadyRunning]);
    assert_eq!(shared.0.lock().await.created.len(), 1);
}

#[tokio::test]
async fn build_failure_surfaces_output_and_skips_create() {
    let mut env = TestEnv::new();
    env.add_spec("chromium");
    env.set_builder("echo \"evaluating derivation\"; echo \"error: undefined variable 'chromum'\" >&2; exit 1");
    let mut hv = FakeHypervisor::new();

    let err = vm::start(&mut hv, &env.config, &env.paths, &app("chromium"), false)
        .await
        .unwrap_err();

    match &err {
        AppvmError::Build { stdout, stderr, .. } => {
            assert!(stdout.contains("evaluating derivation"));
            assert!(stderr.contains("undefined variable 'chromum'"));
        }
        other => panic!("expected build error, got {other:?}"),
    }
    assert!(err.to_string().contains("undefined variable"));
    assert!(hv.created.is_empty());
}

#[tokio::test]
async fn missing_reg_info_fails_and_cleans_out_link() {
    let mut env = TestEnv::new();
    env.add_spec("chromium");
    let builder = builder_with_script(&env.store, "exec qemu-kvm -append \"init=$SYSTEM/init\"");
    env.set_builder(&builder);
    let mut hv = FakeHypervisor::new();

    let err = vm::start(&mut hv, &env.config, &env.paths, &app("chromium"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, AppvmError::Parse(ref m) if m == "should be one reginfo"));
    assert!(env.out_links().is_empty());
    assert!(hv.created.is_empty());
}

#[tokio::test]
async fn unfetchable_remote_spec_is_resolution_error() {
    let mut env = TestEnv::new();
    env.set_evaluator("echo 'error: unable to download' >&2; exit 1");
    let mut hv = FakeHypervisor::new();

    let err = vm::start(&mut hv, &env.config, &env.paths, &app("alice/configs/zoom"), false)
        .await
        .unwrap_err();
    match err {
        AppvmError::Resolution { name, reason } => {
            assert_eq!(name, "alice/configs/zoom");
            assert!(reason.contains("github:alice/configs/nix/zoom.nix"));
            assert!(reason.contains("unable to download"));
        }
        other => panic!("expected resolution error, got {other:?}"),
    }
    assert!(hv.created.is_empty());
}

#[tokio::test]
async fn remote_spec_is_fetched_then_built() {
    let mut env = TestEnv::new();
    let fetched = env.tmp.path().join("fetched-zoom.nix");
    let expr_log = env.tmp.path().join("expr");
    std::fs::write(&fetched, "{ }").unwrap();
    // eval --raw --impure --expr <expr>
    env.set_evaluator(&format!(
        "printf '%s' \"$5\" > \"{}\"\necho \"{}\"",
        expr_log.display(),
        fetched.display()
    ));
    let mut hv = FakeHypervisor::new();

    let outcome = vm::start(&mut hv, &env.config, &env.paths, &app("zoom"), false)
        .await
        .unwrap();
    assert_eq!(outcome, StartOutcome::Created);
    assert_eq!(hv.created[0].name, "appvm_zoom");
    assert_eq!(
        std::fs::read_to_string(&expr_log).unwrap(),
        "(builtins.fetchurl \"https://raw.githubusercontent.com/jollheef/appvm/master/nix/zoom.nix\")"
    );
}

// ---------------------------------------------------------------------------
// drop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn drop_removes_only_the_named_app() {
    let env = TestEnv::new();
    env.write_memory_used("chromium", "300\n");
    env.write_memory_used("thunderbird", "200\n");
    let mut hv = FakeHypervisor::new();

    vm::drop_app(&mut hv, &env.paths, &app("chromium"), false)
        .await
        .unwrap();

    assert!(!env.paths.base.join("chromium").exists());
    assert!(env.paths.base.join("thunderbird").join(".memory_used").exists());
    assert!(env.paths.base.is_dir());
}

#[tokio::test]
async fn drop_leaves_nested_repo_app_alone() {
    let env = TestEnv::new();
    env.write_memory_used("alice", "100\n");
    env.write_memory_used("alice/configs/firefox", "300\n");
    let firefox = app("alice/configs/firefox");
    let mut hv = FakeHypervisor::new();

    vm::drop_app(&mut hv, &env.paths, &app("alice"), false)
        .await
        .unwrap();

    assert!(!env.paths.app_dir(&app("alice")).exists());
    assert_eq!(
        std::fs::read_to_string(env.paths.memory_used_file(&firefox)).unwrap(),
        "300\n"
    );
}

#[tokio::test]
async fn internal_state_is_not_an_app_name() {
    let env = TestEnv::new();
    std::fs::write(env.paths.locks.join("chromium.lock"), "").unwrap();

    for name in [".locks", ".fake.qcow2", "alice/.locks"] {
        let err = AppName::new(name).unwrap_err();
        assert!(matches!(err, AppvmError::InvalidName { .. }), "{name}");
    }
    assert!(env.paths.locks.join("chromium.lock").exists());
}

#[tokio::test]
async fn drop_of_missing_app_succeeds() {
    let env = TestEnv::new();
    let mut hv = FakeHypervisor::new();
    vm::drop_app(&mut hv, &env.paths, &app("never-started"), false)
        .await
        .unwrap();
}

#[tokio::test]
async fn drop_of_running_app_needs_force() {
    let env = TestEnv::new();
    env.write_memory_used("chromium", "300\n");
    let mut hv = FakeHypervisor::new().with_domain("appvm_chromium", 2 * GIB, GIB);

    let err = vm::drop_app(&mut hv, &env.paths, &app("chromium"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, AppvmError::DropRefused { .. }));
    assert!(env.paths.base.join("chromium").exists());

    vm::drop_app(&mut hv, &env.paths, &app("chromium"), true)
        .await
        .unwrap();
    assert!(!env.paths.base.join("chromium").exists());
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

#[tokio::test]
async fn list_separates_started_and_available() {
    let env = TestEnv::new();
    env.add_spec("firefox");
    env.add_spec("chromium");
    let mut hv = FakeHypervisor::new()
        .with_domain("appvm_thunderbird", 2 * GIB, GIB)
        .with_domain("appvm_chromium", 2 * GIB, GIB)
        .with_domain("win10", 8 * GIB, 4 * GIB);

    let listing = vm::list(&mut hv, &env.config).await.unwrap();
    let started: Vec<&str> = listing.started.iter().map(|n| n.as_str()).collect();
    assert_eq!(started, vec!["chromium", "thunderbird"]);
    assert_eq!(listing.available, vec!["chromium".to_string(), "firefox".to_string()]);
}
