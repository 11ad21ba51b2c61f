//! Integration tests for the depot binary

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::fs;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    /// A plugin directory and artifact source isolated in a temp dir
    struct Sandbox {
        temp: TempDir,
    }

    impl Sandbox {
        fn new() -> Self {
            Self::with_config("")
        }

        fn with_config(extra: &str) -> Self {
            let temp = TempDir::new().unwrap();
            let config = format!(
                "[general]\ntelemetry = true\n\n[source]\nroot = \"{}\"\n\n{}",
                temp.path().join("sources").display(),
                extra
            );
            fs::write(temp.path().join("config.toml"), config).unwrap();
            Self { temp }
        }

        fn plugin_dir(&self) -> PathBuf {
            self.temp.path().join("depot")
        }

        fn publish(&self, id: &str, version: &str) {
            let dir = self.temp.path().join("sources").join(id).join(version);
            fs::create_dir_all(dir.join("commands")).unwrap();
            fs::write(
                dir.join("plugin.json"),
                format!(r#"{{"name": "{}", "version": "{}"}}"#, id, version),
            )
            .unwrap();
            fs::write(dir.join("commands/run.md"), format!("# {} {}\n", id, version)).unwrap();
        }

        fn depot(&self) -> Command {
            let mut cmd = cargo_bin_cmd!("depot");
            cmd.env_remove("DEPOT_CONFIG")
                .env_remove("DEPOT_PLUGIN_DIR")
                .env_remove("RUST_LOG")
                .arg("--config")
                .arg(self.temp.path().join("config.toml"))
                .arg("--plugin-dir")
                .arg(self.plugin_dir());
            cmd
        }

        fn registry(&self) -> serde_json::Value {
            let bytes = fs::read(self.plugin_dir().join("registry.json")).unwrap();
            serde_json::from_slice(&bytes).unwrap()
        }

        fn link_target(&self, id: &str) -> PathBuf {
            fs::read_link(self.plugin_dir().join("plugins").join(id)).unwrap()
        }
    }

    fn json_output(cmd: &mut Command) -> serde_json::Value {
        let output = cmd.arg("--json").output().unwrap();
        serde_json::from_slice(&output.stdout).unwrap()
    }

    fn version_of(link: &Path) -> String {
        link.file_name().unwrap().to_string_lossy().into_owned()
    }

    #[test]
    fn help_displays() {
        cargo_bin_cmd!("depot")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Local plugin package manager"));
    }

    #[test]
    fn version_displays() {
        cargo_bin_cmd!("depot")
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("depot"));
    }

    #[test]
    fn list_empty() {
        let sandbox = Sandbox::new();
        sandbox
            .depot()
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("No plugins installed"));
    }

    #[test]
    fn config_show() {
        let sandbox = Sandbox::new();
        sandbox
            .depot()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[cache]"))
            .stdout(predicate::str::contains("sources"));
    }

    #[test]
    fn config_path() {
        let sandbox = Sandbox::new();
        sandbox
            .depot()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn install_list_and_verify() {
        let sandbox = Sandbox::new();
        sandbox.publish("alpha", "1.0.0");

        sandbox
            .depot()
            .args(["install", "alpha"])
            .assert()
            .success()
            .stdout(predicate::str::contains("ACTIVATE_SYMLINK"));

        sandbox
            .depot()
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("alpha"))
            .stdout(predicate::str::contains("1.0.0"));

        sandbox
            .depot()
            .args(["verify", "alpha"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Healthy"));

        assert_eq!(version_of(&sandbox.link_target("alpha")), "1.0.0");
        assert!(sandbox.plugin_dir().join("telemetry.log").exists());
    }

    #[test]
    fn install_with_policy_warning_ends_in_warn() {
        let sandbox = Sandbox::with_config("[compatibility]\nwarn = [\"alpha\"]\n");
        sandbox.publish("alpha", "1.0.0");

        sandbox
            .depot()
            .args(["install", "alpha"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[WARN]"))
            .stdout(predicate::str::contains("with 1 warning(s)"));
    }

    #[test]
    fn install_unknown_plugin_fails_with_code() {
        let sandbox = Sandbox::new();
        let result = json_output(sandbox.depot().args(["install", "ghost"]));

        assert_eq!(result["success"], false);
        assert_eq!(result["error"]["code"], "NO_VERSIONS_AVAILABLE");
        assert_eq!(result["error"]["phase"], "VALIDATE_COMPATIBILITY");

        sandbox.depot().args(["install", "ghost"]).assert().failure();
    }

    #[test]
    fn install_twice_requires_force() {
        let sandbox = Sandbox::new();
        sandbox.publish("alpha", "1.0.0");
        sandbox.depot().args(["install", "alpha"]).assert().success();

        let result = json_output(sandbox.depot().args(["install", "alpha"]));
        assert_eq!(result["error"]["code"], "ALREADY_INSTALLED");

        sandbox
            .depot()
            .args(["install", "alpha", "--force"])
            .assert()
            .success();
    }

    #[test]
    fn update_then_rollback() {
        let sandbox = Sandbox::new();
        sandbox.publish("alpha", "1.0.0");
        sandbox.depot().args(["install", "alpha"]).assert().success();
        sandbox.publish("alpha", "1.1.0");

        sandbox
            .depot()
            .arg("outdated")
            .assert()
            .success()
            .stdout(predicate::str::contains("1.0.0 -> 1.1.0"));

        let update = json_output(sandbox.depot().args(["update", "alpha"]));
        assert_eq!(update["success"], true);
        assert_eq!(update["update"]["toVersion"], "1.1.0");
        assert_eq!(version_of(&sandbox.link_target("alpha")), "1.1.0");

        let versions = json_output(sandbox.depot().args(["versions", "alpha"]));
        assert_eq!(versions[0]["version"], "1.0.0");

        sandbox
            .depot()
            .args(["rollback", "alpha", "1.0.0"])
            .assert()
            .success();
        assert_eq!(version_of(&sandbox.link_target("alpha")), "1.0.0");
        assert_eq!(sandbox.registry()["plugins"][0]["version"], "1.0.0");
    }

    #[test]
    fn rollback_to_uncached_version_fails() {
        let sandbox = Sandbox::new();
        sandbox.publish("alpha", "1.0.0");
        sandbox.depot().args(["install", "alpha"]).assert().success();
        let before = fs::read(sandbox.plugin_dir().join("registry.json")).unwrap();

        let result = json_output(sandbox.depot().args(["rollback", "alpha", "0.9.0"]));

        assert_eq!(result["error"]["code"], "VERSION_NOT_CACHED");
        assert_eq!(result["error"]["phaseCode"], "VERIFY_CACHED_VERSION_FAILED");
        assert_eq!(
            fs::read(sandbox.plugin_dir().join("registry.json")).unwrap(),
            before
        );
    }

    #[test]
    fn pin_and_unpin() {
        let sandbox = Sandbox::new();
        sandbox.publish("alpha", "1.0.0");
        sandbox.depot().args(["install", "alpha"]).assert().success();

        sandbox
            .depot()
            .args(["pin", "alpha"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Pinned alpha@1.0.0"));
        assert_eq!(sandbox.registry()["plugins"][0]["pinned"], true);

        sandbox
            .depot()
            .args(["list", "--pinned"])
            .assert()
            .success()
            .stdout(predicate::str::contains("alpha"));

        sandbox.depot().args(["unpin", "alpha"]).assert().success();
        assert_eq!(sandbox.registry()["plugins"][0]["pinned"], false);
    }

    #[test]
    fn unpin_unknown_plugin_is_a_no_op() {
        let sandbox = Sandbox::new();
        let result = json_output(sandbox.depot().args(["unpin", "ghost"]));
        assert_eq!(result["wasNoOp"], true);
    }

    #[test]
    fn pin_unknown_plugin_fails() {
        let sandbox = Sandbox::new();
        sandbox
            .depot()
            .args(["pin", "ghost"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Plugin not installed"));
    }

    #[test]
    fn uninstall_with_eviction() {
        let sandbox = Sandbox::new();
        sandbox.publish("alpha", "1.0.0");
        sandbox.depot().args(["install", "alpha"]).assert().success();

        sandbox
            .depot()
            .args(["uninstall", "alpha", "--evict"])
            .assert()
            .success();

        assert!(!sandbox.plugin_dir().join("plugins/alpha").exists());
        assert!(!sandbox.plugin_dir().join("cache/alpha/1.0.0").exists());
        assert_eq!(sandbox.registry()["plugins"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn cache_stats_and_validate() {
        let sandbox = Sandbox::new();
        sandbox.publish("alpha", "1.0.0");
        sandbox.depot().args(["install", "alpha"]).assert().success();

        let stats = json_output(sandbox.depot().args(["cache", "stats"]));
        assert_eq!(stats["entryCount"], 1);
        assert_eq!(stats["status"], "ok");

        sandbox
            .depot()
            .args(["cache", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("All cache entries verified"));
    }

    #[test]
    fn cache_validate_reports_tampering() {
        let sandbox = Sandbox::new();
        sandbox.publish("alpha", "1.0.0");
        sandbox.depot().args(["install", "alpha"]).assert().success();
        fs::write(
            sandbox.plugin_dir().join("cache/alpha/1.0.0/commands/run.md"),
            "tampered",
        )
        .unwrap();

        sandbox
            .depot()
            .args(["cache", "validate"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("alpha@1.0.0"));
    }

    #[test]
    fn registry_backup_and_restore() {
        let sandbox = Sandbox::new();
        sandbox.publish("alpha", "1.0.0");
        sandbox.depot().args(["install", "alpha"]).assert().success();

        let backup = json_output(sandbox.depot().args(["registry", "backup"]));
        let path = backup["path"].as_str().unwrap().to_string();
        assert!(path.ends_with("-manual.json"));

        sandbox
            .depot()
            .args(["uninstall", "alpha"])
            .assert()
            .success();
        assert_eq!(sandbox.registry()["plugins"].as_array().unwrap().len(), 0);

        sandbox
            .depot()
            .args(["registry", "restore", &path])
            .assert()
            .success();
        assert_eq!(sandbox.registry()["plugins"][0]["pluginId"], "alpha");

        sandbox
            .depot()
            .args(["registry", "validate"])
            .assert()
            .success();
    }

    #[test]
    fn dry_run_leaves_plugin_dir_untouched() {
        let sandbox = Sandbox::new();
        sandbox.publish("alpha", "1.0.0");

        let result = json_output(sandbox.depot().args(["install", "alpha", "--dry-run"]));

        assert_eq!(result["success"], true);
        assert_eq!(result["dryRun"], true);
        assert!(result["preview"]["phases"].is_array());
        assert!(!sandbox.plugin_dir().exists());
    }
}
