//! Integration tests for envspace

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    /// Command isolated from the user's config and spaces
    fn envspace(temp: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("envspace");
        cmd.env("ENVSPACE_CONFIG", temp.path().join("config.toml"))
            .env("ENVSPACE_BASE_DIR", temp.path().join("spaces"));
        cmd
    }

    #[test]
    fn help_displays() {
        let temp = TempDir::new().unwrap();
        envspace(&temp)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("allocate"));
    }

    #[test]
    fn version_displays() {
        let temp = TempDir::new().unwrap();
        envspace(&temp)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("envspace"));
    }

    #[test]
    fn list_empty() {
        let temp = TempDir::new().unwrap();
        envspace(&temp)
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No spaces"));
    }

    #[test]
    fn list_empty_json() {
        let temp = TempDir::new().unwrap();
        envspace(&temp)
            .args(["list", "--format", "json"])
            .assert()
            .success()
            .stdout(predicate::str::starts_with("[]"));
    }

    #[test]
    fn list_shows_spaces() {
        let temp = TempDir::new().unwrap();
        let space = temp.path().join("spaces").join("space-abc");
        std::fs::create_dir_all(&space).unwrap();
        std::fs::write(space.join("state"), "environment_ready").unwrap();
        std::fs::write(space.join("last_usage"), "").unwrap();

        envspace(&temp)
            .args(["list", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("space-abc"));
    }

    #[cfg(unix)]
    #[test]
    fn list_survives_unreadable_usage_marker() {
        let temp = TempDir::new().unwrap();
        for name in ["space-good", "space-bad"] {
            let space = temp.path().join("spaces").join(name);
            std::fs::create_dir_all(&space).unwrap();
            std::fs::write(space.join("state"), "environment_ready").unwrap();
        }
        std::fs::write(temp.path().join("spaces/space-good/last_usage"), "").unwrap();
        let marker = temp.path().join("spaces/space-bad/last_usage");
        std::os::unix::fs::symlink(&marker, &marker).unwrap();

        envspace(&temp)
            .args(["list", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains("space-good").and(predicate::str::contains("space-bad")));
    }

    #[test]
    fn config_path_follows_env() {
        let temp = TempDir::new().unwrap();
        envspace(&temp)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let temp = TempDir::new().unwrap();
        envspace(&temp)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[pool]"));
    }

    #[test]
    fn invalid_config_fails() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("config.toml"), "[pool]\nmax_spaces = \"x\"\n").unwrap();
        envspace(&temp)
            .arg("list")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"));
    }

    #[test]
    fn allocate_missing_spec_fails() {
        let temp = TempDir::new().unwrap();
        envspace(&temp)
            .args(["allocate", "does-not-exist.yaml"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"));
    }

    #[test]
    fn repair_requires_target() {
        let temp = TempDir::new().unwrap();
        envspace(&temp).arg("repair").assert().failure();
    }

    #[test]
    fn repair_unknown_space_fails() {
        let temp = TempDir::new().unwrap();
        envspace(&temp)
            .args(["repair", "space-missing"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("space-missing"));
    }

    #[test]
    fn repair_all_on_empty_pool() {
        let temp = TempDir::new().unwrap();
        envspace(&temp)
            .args(["repair", "--all"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No damaged spaces"));
    }

    #[test]
    fn prune_on_empty_pool() {
        let temp = TempDir::new().unwrap();
        envspace(&temp)
            .args(["prune", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Nothing to prune"));
    }

    #[cfg(unix)]
    #[test]
    fn allocate_with_builder_script() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let script = temp.path().join("builder.sh");
        std::fs::write(
            &script,
            r#"#!/bin/sh
case "$1" in
  hash) cat | sha256sum | cut -d' ' -f1 ;;
  build)
    mkdir -p "$5/toolchain"
    printf '{"TOOLCHAIN_ROOT":"%s"}' "$5/toolchain" > "$7"
    ;;
esac
"#,
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::write(
            temp.path().join("config.toml"),
            format!(
                "[general]\naudit_log = false\n\n[builder]\nprogram = \"{}\"\n",
                script.display()
            ),
        )
        .unwrap();
        let spec = temp.path().join("env.yaml");
        std::fs::write(&spec, "dependencies:\n  - python\n").unwrap();

        envspace(&temp)
            .args(["allocate", "--format", "json"])
            .arg(&spec)
            .assert()
            .success()
            .stdout(predicate::str::contains("\"created\""));

        envspace(&temp)
            .args(["allocate", "--format", "json"])
            .arg(&spec)
            .assert()
            .success()
            .stdout(predicate::str::contains("\"reused\""));
    }
}

mod allocator_tests {
    use chrono::Utc;
    use envspace::allocator::{AllocationOutcome, Allocator, AllocatorOptions, Classification};
    use envspace::builder::InMemoryBuilder;
    use envspace::identity::IdentityComparator;
    use envspace::lock::LockGuard;
    use envspace::space::{files, EnvironmentSpec, SpaceName, SpaceRegistry, TOOLCHAIN_ROOT_KEY};
    use envspace::SpaceError;
    use filetime::FileTime;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    const SPEC_A: &str = "name: a\ndependencies:\n  - python=3.11\n  - pip:\n      - requests\n";
    const SPEC_B: &str = "name: b\ndependencies:\n  - python=3.12\n";
    const SPEC_C: &str = "name: c\ndependencies:\n  - ruby\n";

    struct Pool {
        temp: TempDir,
        builder: Arc<InMemoryBuilder>,
    }

    impl Pool {
        fn new(builder: InMemoryBuilder) -> Self {
            Self {
                temp: TempDir::new().unwrap(),
                builder: Arc::new(builder),
            }
        }

        fn base(&self) -> PathBuf {
            self.temp.path().join("spaces")
        }

        fn allocator(&self, max_spaces: usize) -> Allocator {
            self.allocator_with(max_spaces, Duration::from_secs(5))
        }

        fn allocator_with(&self, max_spaces: usize, lock_timeout: Duration) -> Allocator {
            let comparator = IdentityComparator::with_capacity(
                self.builder.clone(),
                vec!["--use-feature".to_string()],
                16,
            );
            let options = AllocatorOptions {
                max_spaces,
                reuse_timeout: Duration::from_secs(3600),
                lock_timeout,
            };
            Allocator::new(
                SpaceRegistry::new(self.base()),
                self.builder.clone(),
                comparator,
                options,
            )
        }

        fn spec(&self, file: &str, text: &str) -> EnvironmentSpec {
            let path = self.temp.path().join(file);
            fs::write(&path, text).unwrap();
            EnvironmentSpec::new(text, path)
        }

        /// Ready space built from `text`, last used at `last_usage` (unix secs)
        fn ready_space(&self, name: &str, text: &str, last_usage: i64) -> PathBuf {
            let dir = self.base().join(name);
            let root = dir.join("toolchain");
            fs::create_dir_all(&root).unwrap();
            fs::write(dir.join(files::STATE), "environment_ready").unwrap();
            fs::write(dir.join(files::SPEC_CONTENT), text).unwrap();
            fs::write(dir.join(files::SPEC_PATH), format!("/specs/{}.yaml", name)).unwrap();
            fs::write(
                dir.join(files::CAPTURED_ENV),
                serde_json::json!({ TOOLCHAIN_ROOT_KEY: root }).to_string(),
            )
            .unwrap();
            set_usage(&dir, last_usage);
            dir
        }
    }

    fn set_usage(dir: &Path, secs: i64) {
        let marker = dir.join(files::LAST_USAGE);
        fs::write(&marker, "").unwrap();
        filetime::set_file_mtime(&marker, FileTime::from_unix_time(secs, 0)).unwrap();
    }

    fn usage_secs(dir: &Path) -> i64 {
        let meta = fs::metadata(dir.join(files::LAST_USAGE)).unwrap();
        FileTime::from_last_modification_time(&meta).unix_seconds()
    }

    fn lock_files(base: &Path) -> Vec<String> {
        fs::read_dir(base)
            .unwrap()
            .filter_map(Result::ok)
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|n| n.ends_with(".lock"))
            .collect()
    }

    #[tokio::test]
    async fn identical_texts_match_without_hashing() {
        let pool = Pool::new(InMemoryBuilder::new().without_hashing());
        pool.ready_space("a", SPEC_A, 100);
        let allocator = pool.allocator(1);

        let allocation = allocator
            .allocate(&pool.spec("a.yaml", SPEC_A), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(allocation.outcome, AllocationOutcome::Reused);
        assert_eq!(allocation.name.as_str(), "a");
        assert_eq!(pool.builder.build_calls(), 0);
    }

    #[tokio::test]
    async fn volatile_flag_in_nested_list_is_ignored() {
        let pool = Pool::new(InMemoryBuilder::new().without_hashing());
        let stored = "name: a\ndependencies:\n  - python=3.11\n  - pip:\n      - requests\n      - --use-feature=fast-deps\n";
        pool.ready_space("a", stored, 100);
        let allocator = pool.allocator(1);

        let plan = allocator.plan(&pool.spec("a.yaml", SPEC_A)).await.unwrap();

        assert_eq!(plan.classification_of("a"), Some(Classification::CanUse));
    }

    #[tokio::test]
    async fn unavailable_pool_creates_one_space() {
        let pool = Pool::new(InMemoryBuilder::new());
        let now = Utc::now().timestamp();
        let b = pool.ready_space("b", SPEC_B, now);
        let c = pool.ready_space("c", SPEC_C, now);
        let allocator = pool.allocator(3);

        let allocation = allocator
            .allocate(&pool.spec("a.yaml", SPEC_A), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(allocation.outcome, AllocationOutcome::Created);
        assert_eq!(allocator.registry().list_spaces().unwrap().len(), 3);
        assert_eq!(pool.builder.build_calls(), 1);
        assert_eq!(fs::read_to_string(b.join(files::SPEC_CONTENT)).unwrap(), SPEC_B);
        assert_eq!(fs::read_to_string(c.join(files::SPEC_CONTENT)).unwrap(), SPEC_C);
        assert_eq!(usage_secs(&b), now);
        assert_eq!(usage_secs(&c), now);
    }

    #[tokio::test]
    async fn concurrent_reuse_shares_one_space() {
        let pool = Pool::new(InMemoryBuilder::new());
        let dir = pool.ready_space("a", SPEC_A, 100);
        let spec = pool.spec("a.yaml", SPEC_A);
        let cancel = CancellationToken::new();

        let allocators: Vec<Allocator> = (0..4).map(|_| pool.allocator(4)).collect();
        let results = allocate_all(&allocators, &spec, &cancel).await;

        let mut latest = 0;
        for allocation in results {
            assert_eq!(allocation.outcome, AllocationOutcome::Reused);
            assert_eq!(allocation.name.as_str(), "a");
            latest = latest.max(allocation.last_usage.timestamp());
        }
        assert_eq!(pool.builder.build_calls(), 0);
        assert!(lock_files(&pool.base()).is_empty());
        assert!(usage_secs(&dir) >= latest);
    }

    async fn allocate_all(
        allocators: &[Allocator],
        spec: &EnvironmentSpec,
        cancel: &CancellationToken,
    ) -> Vec<envspace::allocator::Allocation> {
        let (a, b, c, d) = tokio::join!(
            allocators[0].allocate(spec, cancel),
            allocators[1].allocate(spec, cancel),
            allocators[2].allocate(spec, cancel),
            allocators[3].allocate(spec, cancel),
        );
        vec![a.unwrap(), b.unwrap(), c.unwrap(), d.unwrap()]
    }

    #[tokio::test]
    async fn failed_rebuild_marks_damaged_and_is_never_selected() {
        let pool = Pool::new(InMemoryBuilder::new().failing_builds());
        let dir = pool.ready_space("b", SPEC_B, 100);
        let allocator = pool.allocator(1);
        let spec = pool.spec("a.yaml", SPEC_A);
        let cancel = CancellationToken::new();

        let err = allocator.allocate(&spec, &cancel).await.unwrap_err();
        assert!(matches!(err, SpaceError::BuildFailed { .. }));
        assert!(dir.join(files::DAMAGED).exists());
        assert_eq!(
            fs::read_to_string(dir.join(files::STATE)).unwrap(),
            "environment_requested"
        );
        assert!(LockGuard::try_acquire("b", &pool.base()).unwrap().is_some());

        pool.builder.set_fail_builds(false);
        let plan = allocator.plan(&spec).await.unwrap();
        assert_eq!(plan.classification_of("b"), Some(Classification::NotAvailable));

        let err = allocator.allocate(&spec, &cancel).await.unwrap_err();
        assert!(matches!(err, SpaceError::ResourceExhausted { max_spaces: 1 }));
        assert_eq!(pool.builder.build_calls(), 1);
    }

    #[tokio::test]
    async fn legacy_markers_consolidate_to_newest() {
        let pool = Pool::new(InMemoryBuilder::new());
        let dir = pool.ready_space("a", SPEC_A, 0);
        fs::remove_file(dir.join(files::LAST_USAGE)).unwrap();
        for epoch in ["100", "300", "200"] {
            fs::write(dir.join(format!("time_{}", epoch)), "").unwrap();
        }

        let allocator = pool.allocator(1);
        let plan = allocator.plan(&pool.spec("b.yaml", SPEC_B)).await.unwrap();

        assert_eq!(plan.classification_of("a"), Some(Classification::ReuseTarget));
        assert_eq!(usage_secs(&dir), 300);
        let leftovers: Vec<_> = fs::read_dir(&dir)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("time_"))
            .collect();
        assert!(leftovers.is_empty());
        assert!(!dir.join(files::DAMAGED).exists());
    }

    #[tokio::test]
    async fn eviction_picks_least_recently_used() {
        let pool = Pool::new(InMemoryBuilder::new());
        let older = pool.ready_space("b", SPEC_B, 100);
        let newer = pool.ready_space("c", SPEC_C, 200);
        let allocator = pool.allocator(2);

        let allocation = allocator
            .allocate(&pool.spec("a.yaml", SPEC_A), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(allocation.outcome, AllocationOutcome::Rebuilt);
        assert_eq!(allocation.name.as_str(), "b");
        assert_eq!(fs::read_to_string(older.join(files::SPEC_CONTENT)).unwrap(), SPEC_A);
        assert_eq!(fs::read_to_string(newer.join(files::SPEC_CONTENT)).unwrap(), SPEC_C);
        assert_eq!(usage_secs(&newer), 200);
    }

    #[tokio::test]
    async fn reuse_of_matching_space_leaves_others_untouched() {
        let pool = Pool::new(InMemoryBuilder::new());
        let a = pool.ready_space("a", SPEC_A, 100);
        let b = pool.ready_space("b", SPEC_B, 100);
        let allocator = pool.allocator(2);

        let allocation = allocator
            .allocate(&pool.spec("a.yaml", SPEC_A), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(allocation.outcome, AllocationOutcome::Reused);
        assert_eq!(allocation.name.as_str(), "a");
        assert_eq!(
            allocation.captured_env.get(TOOLCHAIN_ROOT_KEY).map(PathBuf::from),
            Some(a.join("toolchain"))
        );
        assert!(usage_secs(&a) > 100);
        assert_eq!(usage_secs(&b), 100);
        assert_eq!(fs::read_to_string(b.join(files::SPEC_CONTENT)).unwrap(), SPEC_B);
        assert_eq!(pool.builder.build_calls(), 0);
    }

    #[tokio::test]
    async fn racing_rebuild_converges() {
        let pool = Pool::new(InMemoryBuilder::new());
        pool.ready_space("b", SPEC_B, 100);
        let first = pool.allocator(1);
        let second = pool.allocator(1);
        let spec = pool.spec("a.yaml", SPEC_A);
        let cancel = CancellationToken::new();

        // Both see "b" as a rebuild target before either acts.
        let stale = second.plan(&spec).await.unwrap();
        assert_eq!(stale.classification_of("b"), Some(Classification::ReuseTarget));

        let winner = first.allocate(&spec, &cancel).await.unwrap();
        let loser = second.execute(stale, &cancel).await.unwrap();

        assert_eq!(winner.outcome, AllocationOutcome::Rebuilt);
        assert_eq!(loser.outcome, AllocationOutcome::Reused);
        assert_eq!(loser.name, winner.name);
        assert_eq!(pool.builder.build_calls(), 1);
    }

    #[tokio::test]
    async fn busy_lock_times_out() {
        let pool = Pool::new(InMemoryBuilder::new());
        let dir = pool.ready_space("b", SPEC_B, 100);
        let _held = LockGuard::try_acquire("b", &pool.base()).unwrap().unwrap();
        let allocator = pool.allocator_with(1, Duration::from_millis(200));

        let err = allocator
            .allocate(&pool.spec("a.yaml", SPEC_A), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SpaceError::LockTimeout { .. }));
        assert!(err.is_retryable());
        assert_eq!(fs::read_to_string(dir.join(files::SPEC_CONTENT)).unwrap(), SPEC_B);
        assert_eq!(pool.builder.build_calls(), 0);
    }

    #[tokio::test]
    async fn repair_then_allocate_replaces_damaged_space() {
        let pool = Pool::new(InMemoryBuilder::new());
        let dir = pool.ready_space("a", SPEC_A, 100);
        fs::write(dir.join(files::DAMAGED), "broken").unwrap();
        let allocator = pool.allocator(1);
        let cancel = CancellationToken::new();
        let spec = pool.spec("a.yaml", SPEC_A);

        let err = allocator.allocate(&spec, &cancel).await.unwrap_err();
        assert!(matches!(err, SpaceError::ResourceExhausted { .. }));

        allocator
            .repair(&SpaceName::new("a").unwrap(), &cancel)
            .await
            .unwrap();
        let allocation = allocator.allocate(&spec, &cancel).await.unwrap();

        assert_eq!(allocation.outcome, AllocationOutcome::Created);
        assert_eq!(allocator.registry().list_spaces().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn prune_keeps_spaces_in_use() {
        let pool = Pool::new(InMemoryBuilder::new());
        pool.ready_space("a", SPEC_A, 100);
        pool.ready_space("b", SPEC_B, 200);
        pool.ready_space("c", SPEC_C, 300);
        let _busy = LockGuard::try_acquire("a", &pool.base()).unwrap().unwrap();
        let allocator = pool.allocator(5);

        let pruned = allocator
            .prune(1, false, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(pruned, vec![SpaceName::new("b").unwrap()]);
        assert!(pool.base().join("a").exists());
        assert!(!pool.base().join("b").exists());
        assert!(pool.base().join("c").exists());
    }
}
