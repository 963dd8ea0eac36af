//! Nightly release archives: pack a build output directory and upload it.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::{debug, instrument};

use crate::error::NonBuildError;
use crate::io::config::{Args, AsteConfig, Credentials};
use crate::io::process::ProcessRunner;

/// `boogie-nightly.tar.gz` for project `Boogie`.
pub fn archive_name(project: &str) -> String {
    format!("{}-nightly.tar.gz", project.to_lowercase())
}

/// Name shown for an uploaded archive: `boogie-nightly_rev42_2011-08-17 15:37.tar.gz`.
pub fn release_file_name(project: &str, revision: &str, date: &str) -> String {
    format!("{}-nightly_rev{revision}_{date}.tar.gz", project.to_lowercase())
}

/// Pack `dir` into `<archive_dir>/<project>-nightly.tar.gz`, entries under `<project>/`.
#[instrument(skip_all, fields(project))]
pub fn pack(project: &str, dir: &Path, archive_dir: &Path) -> Result<PathBuf> {
    if !dir.is_dir() {
        return Err(NonBuildError::new("Build output to release does not exist")
            .with_value("path", dir.display().to_string())
            .into());
    }
    std::fs::create_dir_all(archive_dir)
        .with_context(|| format!("create directory {}", archive_dir.display()))?;
    let path = archive_dir.join(archive_name(project));
    let file = File::create(&path).with_context(|| format!("create {}", path.display()))?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder
        .append_dir_all(project, dir)
        .with_context(|| format!("pack {}", dir.display()))?;
    builder
        .into_inner()
        .and_then(GzEncoder::finish)
        .with_context(|| format!("finish {}", path.display()))?;
    debug!(archive = %path.display(), "release packed");
    Ok(path)
}

pub trait ReleaseUploader {
    fn upload(
        &self,
        project: &str,
        revision: &str,
        credentials: Option<&Credentials>,
        archive: &Path,
    ) -> Result<()>;
}

/// Runs the project's `release.upload` command template.
pub struct CommandReleaseUploader<'a> {
    cfg: &'a AsteConfig,
    args: &'a Args,
    runner: &'a dyn ProcessRunner,
}

impl<'a> CommandReleaseUploader<'a> {
    pub fn new(cfg: &'a AsteConfig, args: &'a Args, runner: &'a dyn ProcessRunner) -> Self {
        Self { cfg, args, runner }
    }
}

impl ReleaseUploader for CommandReleaseUploader<'_> {
    #[instrument(skip_all, fields(project, revision))]
    fn upload(
        &self,
        project: &str,
        revision: &str,
        credentials: Option<&Credentials>,
        archive: &Path,
    ) -> Result<()> {
        let release = self
            .cfg
            .project(project)?
            .release
            .as_ref()
            .with_context(|| format!("project '{project}' has no release settings"))?;
        let password = credentials.map(Credentials::password).unwrap_or_default();
        let date = Local::now().format("%Y-%m-%d %H:%M").to_string();
        let mut extra = BTreeMap::new();
        extra.insert("revision", revision.to_string());
        extra.insert(
            "user",
            credentials.map(|c| c.user.clone()).unwrap_or_default(),
        );
        extra.insert("password", password.clone());
        extra.insert("archive", archive.display().to_string());
        extra.insert("name", release_file_name(project, revision, &date));
        let command = self
            .cfg
            .render(&release.upload, Some(project), self.args, &extra)?;
        let masked = mask(&command, &password);

        let workdir = archive.parent();
        let output = self
            .runner
            .execute(&command, workdir, &mut |line| debug!(line, "upload output"))
            .map_err(|err| match err.downcast::<NonBuildError>() {
                Ok(typed) => typed.with_value("command", masked.clone()).into(),
                Err(other) => other,
            })?;
        if output.return_code != 0 {
            return Err(NonBuildError::new("Release upload failed")
                .with_value("command", masked)
                .with_value("returncode", output.return_code)
                .with_value("output", mask(output.output.trim_end(), &password))
                .into());
        }
        Ok(())
    }
}

fn mask(text: &str, password: &str) -> String {
    if password.is_empty() {
        text.to_string()
    } else {
        text.replace(password, "********")
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use flate2::read::GzDecoder;

    use super::*;
    use crate::error::ErrorKind;
    use crate::test_support::ScriptedProcessRunner;

    #[test]
    fn packs_directory_under_project_name() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = temp.path().join("Binaries");
        fs::create_dir_all(out.join("sub")).expect("mkdir");
        fs::write(out.join("Boogie.exe"), "exe").expect("write");
        fs::write(out.join("sub").join("Core.dll"), "dll").expect("write");

        let archive = pack("Boogie", &out, &temp.path().join("dist")).expect("pack");
        assert_eq!(archive.file_name().and_then(|n| n.to_str()), Some("boogie-nightly.tar.gz"));

        let mut entries: Vec<String> = tar::Archive::new(GzDecoder::new(
            File::open(&archive).expect("open"),
        ))
        .entries()
        .expect("entries")
        .map(|e| e.expect("entry").path().expect("path").display().to_string())
        .filter(|p| p.ends_with(".exe") || p.ends_with(".dll"))
        .collect();
        entries.sort();
        assert_eq!(entries, vec!["Boogie/Boogie.exe", "Boogie/sub/Core.dll"]);
    }

    #[test]
    fn missing_output_is_infrastructure_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = pack("Boogie", &temp.path().join("nope"), temp.path()).expect_err("missing");
        assert_eq!(ErrorKind::of(&err), ErrorKind::NonBuild);
    }

    fn config() -> AsteConfig {
        toml::from_str(
            r#"
[projects.Boogie.release]
dir = "Binaries"
upload = "upload --user {{ user }} --password {{ password }} --rev {{ revision }} {{ archive }}"
"#,
        )
        .expect("parse")
    }

    #[test]
    fn upload_renders_command_and_masks_password_on_failure() {
        let cfg = config();
        let args = Args::new();
        let runner = ScriptedProcessRunner::new().with_output(1, "denied for secret\n");
        let uploader = CommandReleaseUploader::new(&cfg, &args, &runner);
        let credentials = Credentials {
            user: "bot".to_string(),
            password: "D64C6E".to_string(),
        };
        let err = uploader
            .upload("Boogie", "42", Some(&credentials), Path::new("dist/boogie-nightly.tar.gz"))
            .expect_err("upload fails");

        assert_eq!(
            runner.commands(),
            vec!["upload --user bot --password secret --rev 42 dist/boogie-nightly.tar.gz"]
        );
        let typed = err.downcast_ref::<NonBuildError>().expect("typed");
        assert_eq!(
            typed.value("command"),
            Some(&serde_json::json!(
                "upload --user bot --password ******** --rev 42 dist/boogie-nightly.tar.gz"
            ))
        );
        assert_eq!(typed.value("output"), Some(&serde_json::json!("denied for ********")));
    }

    #[test]
    fn release_names_follow_project_and_revision() {
        assert_eq!(archive_name("Chalice"), "chalice-nightly.tar.gz");
        assert_eq!(
            release_file_name("Chalice", "7", "2011-08-17 15:37"),
            "chalice-nightly_rev7_2011-08-17 15:37.tar.gz"
        );
    }
}
