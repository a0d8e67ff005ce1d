//! Integration tests for the conveyor binary

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    fn conveyor() -> Command {
        let mut cmd = cargo_bin_cmd!("conveyor");
        cmd.env_remove("CONVEYOR_CONFIG");
        cmd
    }

    #[test]
    fn help_displays() {
        conveyor()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("multi-stage image builds"));
    }

    #[test]
    fn version_displays() {
        conveyor()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("conveyor"));
    }

    #[test]
    fn build_help_lists_introspection() {
        conveyor()
            .args(["build", "--help"])
            .assert()
            .success()
            .stdout(predicate::str::contains("--introspect-error"))
            .stdout(predicate::str::contains("--renew"));
    }

    #[test]
    fn missing_config_fails_with_hint() {
        let temp = TempDir::new().unwrap();
        conveyor()
            .current_dir(temp.path())
            .arg("build")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Configuration file not found"))
            .stderr(predicate::str::contains("conveyor.toml"));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("conveyor.toml");
        std::fs::write(&path, "[project]\nname = \"Bad Name\"\n\n[[image]]\nfrom = \"alpine\"\n")
            .unwrap();

        conveyor()
            .args(["--config", path.to_str().unwrap(), "check"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"))
            .stderr(predicate::str::contains("project.name"));
    }

    #[test]
    fn export_requires_target() {
        conveyor()
            .arg("export")
            .assert()
            .failure()
            .stderr(predicate::str::contains("--to"));
    }
}
