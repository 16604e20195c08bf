//! Integration tests for Strata

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    const PLAN: &str = r#"
[[step]]
instruction = "from"
image = "base"

[[step]]
instruction = "copy"
sources = ["hello.txt"]
dest = "/app/"
"#;

    /// A scratch store and config isolated from the user's
    struct Env {
        dir: TempDir,
    }

    impl Env {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
            }
        }

        fn path(&self) -> &Path {
            self.dir.path()
        }

        fn strata(&self) -> Command {
            let mut cmd = cargo_bin_cmd!("strata");
            cmd.env("STRATA_CONFIG", self.path().join("config.toml"))
                .env("STRATA_STORE", self.path().join("store"));
            cmd
        }

        fn import_base(&self) {
            let rootfs = self.path().join("rootfs");
            fs::create_dir_all(rootfs.join("etc")).unwrap();
            fs::write(rootfs.join("etc/os-release"), "ID=test\n").unwrap();
            self.strata()
                .args(["import", "--tag", "base"])
                .arg(&rootfs)
                .assert()
                .success()
                .stdout(predicate::str::contains("Imported"));
        }

        fn write_plan(&self) -> std::path::PathBuf {
            let context = self.path().join("context");
            fs::create_dir_all(&context).unwrap();
            fs::write(context.join("hello.txt"), "hello\n").unwrap();
            let plan = context.join("plan.toml");
            fs::write(&plan, PLAN).unwrap();
            plan
        }
    }

    #[test]
    fn help_displays() {
        Env::new()
            .strata()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("incremental image builds"));
    }

    #[test]
    fn version_displays() {
        Env::new()
            .strata()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("strata"));
    }

    #[test]
    fn config_path() {
        let env = Env::new();
        env.strata()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        Env::new()
            .strata()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[general]").and(predicate::str::contains("[build]")));
    }

    #[test]
    fn invalid_config_is_reported() {
        let env = Env::new();
        fs::write(env.path().join("config.toml"), "[build]\nno_cache = \"maybe\"\n").unwrap();
        env.strata()
            .args(["images"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn config_init_writes_defaults() {
        let env = Env::new();
        let path = env.path().join("config.toml");
        env.strata()
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration initialized"));
        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("[general]"));
        assert!(written.contains("log_format = \"text\""));

        env.strata()
            .args(["config", "init"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("already exists"))
            .stderr(predicate::str::contains("--force"));
    }

    #[test]
    fn config_init_force_recovers_invalid_file() {
        let env = Env::new();
        fs::write(env.path().join("config.toml"), "[build]\nnetwork = \"host\"\n").unwrap();
        env.strata()
            .args(["images"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("unknown field"));

        env.strata()
            .args(["config", "init", "--force"])
            .assert()
            .success();
        env.strata().args(["images"]).assert().success();
    }

    #[test]
    fn images_empty_store() {
        Env::new()
            .strata()
            .args(["images"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No images"));
    }

    #[test]
    fn inspect_missing_image() {
        Env::new()
            .strata()
            .args(["inspect", "nonexistent"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Image not found"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn build_missing_plan() {
        let env = Env::new();
        env.strata()
            .args(["build"])
            .arg(env.path().join("missing.toml"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("Error:"));
    }

    #[test]
    fn build_invalid_plan() {
        let env = Env::new();
        let plan = env.path().join("plan.toml");
        fs::write(&plan, "[[step]]\ninstruction = \"teleport\"\n").unwrap();
        env.strata()
            .arg("build")
            .arg(&plan)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid build plan"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn build_twice_uses_cache() {
        let env = Env::new();
        env.import_base();
        let plan = env.write_plan();

        let first = env
            .strata()
            .args(["build", "--tag", "app", "--quiet"])
            .arg(&plan)
            .assert()
            .success();
        let first_id = String::from_utf8(first.get_output().stdout.clone()).unwrap();
        assert!(first_id.trim().starts_with("sha256:"));

        env.strata()
            .args(["build", "--tag", "app"])
            .arg(&plan)
            .assert()
            .success()
            .stdout(predicate::str::contains("Step 2/2 : COPY hello.txt /app/"))
            .stdout(predicate::str::contains("Using cache"))
            .stdout(predicate::str::contains("1 cached"));

        let second = env
            .strata()
            .args(["build", "--quiet"])
            .arg(&plan)
            .assert()
            .success();
        let second_id = String::from_utf8(second.get_output().stdout.clone()).unwrap();
        assert_eq!(first_id, second_id);

        env.strata()
            .args(["images", "--format", "plain"])
            .assert()
            .success()
            .stdout(predicate::str::contains(first_id.trim()));
        env.strata()
            .args(["inspect", "app"])
            .assert()
            .success()
            .stdout(predicate::str::contains("#(nop) COPY file:"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn prune_keeps_referenced_layers() {
        let env = Env::new();
        env.import_base();
        env.strata()
            .arg("prune")
            .assert()
            .success()
            .stdout(predicate::str::contains("Reclaimed 0 layers"));
        env.strata()
            .args(["inspect", "base"])
            .assert()
            .success();
    }
}
