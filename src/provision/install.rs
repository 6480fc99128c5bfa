use log::{debug, info};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::process::Command;

use super::ProvisionError;
use crate::config::RuntimeLayout;

const STAGING_SUFFIX: &str = ".installing";

/// Unpack `archive` into a freshly wiped `scratch` directory.
pub(crate) async fn extract_archive(
    layout: &RuntimeLayout,
    archive: &Path,
    scratch: &Path,
) -> Result<(), ProvisionError> {
    remove_dir_if_exists(scratch).await?;
    fs::create_dir_all(scratch)
        .await
        .map_err(ProvisionError::io(scratch))?;

    let args = layout.extract_args_for(archive, scratch);
    info!(
        "runtime_extract: {} program={} dest={}",
        archive.display(),
        layout.extract_program,
        scratch.display()
    );
    let output = Command::new(&layout.extract_program)
        .args(&args)
        .output()
        .await
        .map_err(|e| ProvisionError::Extraction {
            program: layout.extract_program.clone(),
            status: None,
            stderr: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(ProvisionError::Extraction {
            program: layout.extract_program.clone(),
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Depth-first search under `root` for a directory named `bundle_name`.
pub(crate) async fn find_bundle(
    root: &Path,
    bundle_name: &str,
) -> Result<Option<PathBuf>, ProvisionError> {
    let mut stack = vec![root.to_path_buf()];

    while let Some(current) = stack.pop() {
        let mut entries = fs::read_dir(&current)
            .await
            .map_err(ProvisionError::io(&current))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(ProvisionError::io(&current))?
        {
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(ProvisionError::io(&path))?;
            if !file_type.is_dir() {
                continue;
            }
            if entry.file_name() == bundle_name {
                debug!("runtime_bundle_found: {}", path.display());
                return Ok(Some(path));
            }
            // Archive tools leave resource forks here on macOS.
            if entry.file_name() == "__MACOSX" {
                continue;
            }
            stack.push(path);
        }
    }
    Ok(None)
}

/// Copy `bundle` into `applications_dir`, replacing any existing copy.
///
/// The copy is staged next to the target and renamed into place, so a failed
/// copy never leaves a half-installed bundle under the final name.
pub(crate) async fn install_bundle(
    bundle: &Path,
    applications_dir: &Path,
) -> Result<PathBuf, ProvisionError> {
    let name = bundle
        .file_name()
        .ok_or_else(|| ProvisionError::BundleMissing {
            bundle: bundle.display().to_string(),
            searched: bundle.to_path_buf(),
        })?;
    let target = applications_dir.join(name);
    let mut staging_name = name.to_os_string();
    staging_name.push(STAGING_SUFFIX);
    let staging = applications_dir.join(staging_name);

    fs::create_dir_all(applications_dir)
        .await
        .map_err(ProvisionError::io(applications_dir))?;
    remove_dir_if_exists(&staging).await?;
    copy_dir(bundle, &staging).await?;

    remove_dir_if_exists(&target).await?;
    fs::rename(&staging, &target)
        .await
        .map_err(ProvisionError::io(&target))?;
    info!("runtime_installed: {}", target.display());
    Ok(target)
}

async fn copy_dir(src: &Path, dst: &Path) -> Result<(), ProvisionError> {
    let mut stack = vec![(src.to_path_buf(), dst.to_path_buf())];

    while let Some((from_dir, to_dir)) = stack.pop() {
        fs::create_dir_all(&to_dir)
            .await
            .map_err(ProvisionError::io(&to_dir))?;
        let mut entries = fs::read_dir(&from_dir)
            .await
            .map_err(ProvisionError::io(&from_dir))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(ProvisionError::io(&from_dir))?
        {
            let from = entry.path();
            let to = to_dir.join(entry.file_name());
            let file_type = entry.file_type().await.map_err(ProvisionError::io(&from))?;

            if file_type.is_dir() {
                stack.push((from, to));
            } else if file_type.is_symlink() {
                copy_symlink(&from, &to).await?;
            } else {
                // Keeps permission bits, so executables stay executable.
                fs::copy(&from, &to).await.map_err(ProvisionError::io(&to))?;
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn copy_symlink(from: &Path, to: &Path) -> Result<(), ProvisionError> {
    let target = fs::read_link(from).await.map_err(ProvisionError::io(from))?;
    fs::symlink(&target, to).await.map_err(ProvisionError::io(to))
}

#[cfg(not(unix))]
async fn copy_symlink(from: &Path, to: &Path) -> Result<(), ProvisionError> {
    fs::copy(from, to)
        .await
        .map(|_| ())
        .map_err(ProvisionError::io(to))
}

async fn remove_dir_if_exists(path: &Path) -> Result<(), ProvisionError> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ProvisionError::io(path)(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[tokio::test]
    async fn finds_nested_bundle_and_skips_resource_forks() {
        let dir = TempDir::new().unwrap();
        write(&dir.path().join("__MACOSX/Runtime.app/junk"), "x");
        write(&dir.path().join("dist/inner/Runtime.app/Contents/Info.plist"), "plist");
        write(&dir.path().join("dist/Runtime.app.txt"), "not a dir");

        let found = find_bundle(dir.path(), "Runtime.app").await.unwrap();
        assert_eq!(found, Some(dir.path().join("dist/inner/Runtime.app")));
        assert_eq!(find_bundle(dir.path(), "Other.app").await.unwrap(), None);
    }

    #[tokio::test]
    async fn install_replaces_existing_copy() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("extract/Runtime.app");
        write(&bundle.join("Contents/Resources/server"), "new");
        write(&bundle.join("Contents/Info.plist"), "plist");

        let apps = dir.path().join("Applications");
        write(&apps.join("Runtime.app/stale.txt"), "old");

        let installed = install_bundle(&bundle, &apps).await.unwrap();
        assert_eq!(installed, apps.join("Runtime.app"));
        assert!(!installed.join("stale.txt").exists());
        assert_eq!(
            std::fs::read_to_string(installed.join("Contents/Resources/server")).unwrap(),
            "new"
        );
        assert!(!apps.join("Runtime.app.installing").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_and_permissions_survive_the_copy() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("Runtime.app");
        let server = bundle.join("Contents/Resources/server");
        write(&server, "#!/bin/sh\n");
        std::fs::set_permissions(&server, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::os::unix::fs::symlink("Resources/server", bundle.join("Contents/current")).unwrap();

        let apps = dir.path().join("apps");
        let installed = install_bundle(&bundle, &apps).await.unwrap();

        let copied = installed.join("Contents/Resources/server");
        let mode = std::fs::metadata(&copied).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
        assert_eq!(
            std::fs::read_link(installed.join("Contents/current")).unwrap(),
            PathBuf::from("Resources/server")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_extractor_reports_exit_status() {
        let dir = TempDir::new().unwrap();
        let layout = RuntimeLayout {
            extract_program: "sh".into(),
            extract_args: vec!["-c".into(), "echo broken archive >&2; exit 3".into()],
            ..RuntimeLayout::default()
        };
        let scratch = dir.path().join("scratch");
        write(&scratch.join("leftover"), "old");

        let err = extract_archive(&layout, &dir.path().join("a.zip"), &scratch)
            .await
            .unwrap_err();
        match err {
            ProvisionError::Extraction { status, stderr, .. } => {
                assert_eq!(status, Some(3));
                assert_eq!(stderr, "broken archive");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(scratch.exists());
        assert!(!scratch.join("leftover").exists());
    }
}
