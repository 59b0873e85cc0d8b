//! Build collaborator: turns generated assembly into a runnable executable.
//!
//! Every build happens in a fresh temporary directory owned by the returned
//! [`ExecutableArtifact`]. Dropping the artifact removes the directory, so
//! sources, objects and binaries never outlive the measurement that used them.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use tempfile::TempDir;
use tracing::debug;

use crate::error::{CalibrationError, Result};
use crate::process::run_with_timeout;
use crate::workload::TargetAbi;

const SOURCE_FILE: &str = "benchmark.s";
const OBJECT_FILE: &str = "benchmark.o";
const EXECUTABLE_FILE: &str = "benchmark";
const DARWIN_SDK_FALLBACK: &str = "/Library/Developer/CommandLineTools/SDKs/MacOSX.sdk";

/// Handle to an executable under measurement.
#[derive(Debug)]
pub struct ExecutableArtifact {
    path: PathBuf,
    // `None` for executables we do not own.
    workdir: Option<TempDir>,
}

impl ExecutableArtifact {
    /// Wrap an executable built elsewhere. Nothing is removed on drop.
    pub fn prebuilt(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            workdir: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether dropping this handle deletes the executable.
    pub fn is_owned(&self) -> bool {
        self.workdir.is_some()
    }
}

/// Turns source text into an executable.
pub trait Builder {
    fn build(&self, source: &str) -> Result<ExecutableArtifact>;
}

/// Builds an externally maintained kernel at a repetition count.
pub trait KernelBuilder {
    fn build_kernel(&self, name: &str, repetitions: u64) -> Result<ExecutableArtifact>;
}

/// Assembler + linker invoked as external processes.
#[derive(Clone, Debug)]
pub struct NativeToolchain {
    pub assembler: PathBuf,
    pub linker: PathBuf,
    pub link_args: Vec<String>,
    pub timeout: Duration,
    /// Parent of the per-build temporary directories; the system default when `None`.
    pub temp_root: Option<PathBuf>,
}

impl NativeToolchain {
    pub fn new(
        assembler: impl Into<PathBuf>,
        linker: impl Into<PathBuf>,
        link_args: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            assembler: assembler.into(),
            linker: linker.into(),
            link_args,
            timeout,
            temp_root: None,
        }
    }

    pub fn with_temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = Some(root.into());
        self
    }

    /// System `as` and `ld` with the link flags the ABI needs.
    pub fn for_abi(abi: TargetAbi, timeout: Duration) -> Self {
        let link_args = match abi {
            TargetAbi::Darwin => {
                let sdk = darwin_sdk_path();
                vec![
                    "-lSystem".to_string(),
                    "-L".to_string(),
                    format!("{sdk}/usr/lib"),
                    "-syslibroot".to_string(),
                    sdk,
                    "-e".to_string(),
                    abi.entry_symbol().to_string(),
                    "-arch".to_string(),
                    "arm64".to_string(),
                ]
            }
            TargetAbi::Linux => vec!["-e".to_string(), abi.entry_symbol().to_string()],
        };
        Self::new("as", "ld", link_args, timeout)
    }

    fn stage(&self, stage: &str, cmd: &mut Command, workdir: &Path) -> Result<()> {
        let log_path = workdir.join(format!("{stage}.log"));
        let log = File::create(&log_path)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            .current_dir(workdir);

        debug!(stage, "toolchain.stage");
        let status = match run_with_timeout(cmd, self.timeout, Duration::from_millis(5), stage) {
            Ok(status) => status,
            Err(CalibrationError::Timeout { limit, .. }) => {
                return Err(CalibrationError::Timeout {
                    what: format!("build ({stage})"),
                    limit,
                })
            }
            Err(e) => return Err(e),
        };

        if !status.success() {
            let stderr = fs::read_to_string(&log_path).unwrap_or_default();
            return Err(CalibrationError::BuildFailed {
                stage: stage.to_string(),
                stderr: stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

impl Builder for NativeToolchain {
    fn build(&self, source: &str) -> Result<ExecutableArtifact> {
        let mut dir_builder = tempfile::Builder::new();
        dir_builder.prefix("cpi-calibration-");
        let workdir = match &self.temp_root {
            Some(root) => dir_builder.tempdir_in(root)?,
            None => dir_builder.tempdir()?,
        };
        let dir = workdir.path();
        fs::write(dir.join(SOURCE_FILE), source)?;

        let mut assemble = Command::new(&self.assembler);
        assemble.arg("-o").arg(OBJECT_FILE).arg(SOURCE_FILE);
        self.stage("assemble", &mut assemble, dir)?;

        let mut link = Command::new(&self.linker);
        link.arg("-o")
            .arg(EXECUTABLE_FILE)
            .arg(OBJECT_FILE)
            .args(&self.link_args);
        self.stage("link", &mut link, dir)?;

        Ok(ExecutableArtifact {
            path: dir.join(EXECUTABLE_FILE),
            workdir: Some(workdir),
        })
    }
}

/// Runs `<script> <name> <repetitions>` from `workdir` and picks up the
/// executable named by `binary_pattern` (`{name}` and `{reps}` are substituted).
///
/// The script must be executable. Kernel binaries live in `workdir` and are
/// not removed after measurement.
#[derive(Clone, Debug)]
pub struct ScriptKernelBuilder {
    pub script: PathBuf,
    pub workdir: PathBuf,
    pub binary_pattern: String,
    pub timeout: Duration,
}

impl ScriptKernelBuilder {
    pub fn binary_path(&self, name: &str, repetitions: u64) -> PathBuf {
        let file = self
            .binary_pattern
            .replace("{name}", name)
            .replace("{reps}", &repetitions.to_string());
        self.workdir.join(file)
    }
}

impl KernelBuilder for ScriptKernelBuilder {
    fn build_kernel(&self, name: &str, repetitions: u64) -> Result<ExecutableArtifact> {
        let stage = format!("{name} r{repetitions}");
        let log = tempfile::NamedTempFile::new()?;
        let mut cmd = Command::new(&self.script);
        cmd.arg(name)
            .arg(repetitions.to_string())
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log.reopen()?));

        debug!(kernel = name, repetitions, "kernel.build");
        let status = match run_with_timeout(&mut cmd, self.timeout, Duration::from_millis(5), &stage) {
            Ok(status) => status,
            Err(CalibrationError::Timeout { limit, .. }) => {
                return Err(CalibrationError::Timeout {
                    what: format!("build ({stage})"),
                    limit,
                })
            }
            Err(e) => return Err(e),
        };

        if !status.success() {
            let stderr = fs::read_to_string(log.path()).unwrap_or_default();
            return Err(CalibrationError::BuildFailed {
                stage,
                stderr: stderr.trim().to_string(),
            });
        }

        let path = self.binary_path(name, repetitions);
        if !path.is_file() {
            return Err(CalibrationError::BuildFailed {
                stage,
                stderr: format!("{} was not produced", path.display()),
            });
        }
        Ok(ExecutableArtifact::prebuilt(path))
    }
}

fn darwin_sdk_path() -> String {
    Command::new("xcrun")
        .arg("--show-sdk-path")
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| DARWIN_SDK_FALLBACK.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prebuilt_is_not_owned() {
        let art = ExecutableArtifact::prebuilt("/usr/bin/true");
        assert!(!art.is_owned());
        assert_eq!(art.path(), Path::new("/usr/bin/true"));
    }

    #[test]
    fn linux_link_args_set_entry() {
        let tc = NativeToolchain::for_abi(TargetAbi::Linux, Duration::from_secs(5));
        assert_eq!(tc.link_args, vec!["-e".to_string(), "_start".to_string()]);
    }

    #[cfg(unix)]
    mod fake_toolchain {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::tempdir;

        fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
            let path = dir.join(name);
            fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            let mut perms = fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).unwrap();
            path
        }

        // Invoked as `<tool> -o <out> <in> ...`.
        const COPY_ASSEMBLER: &str = r#"cp "$3" "$2""#;
        const SCRIPT_LINKER: &str = r#"printf '#!/bin/sh\nexit 0\n' > "$2" && chmod +x "$2""#;

        #[test]
        fn artifact_removed_on_drop() {
            let tools = tempdir().unwrap();
            let tc = NativeToolchain::new(
                script(tools.path(), "as", COPY_ASSEMBLER),
                script(tools.path(), "ld", SCRIPT_LINKER),
                vec![],
                Duration::from_secs(10),
            );

            let art = tc.build("mov x0, #0\n").unwrap();
            assert!(art.is_owned());
            let exe = art.path().to_path_buf();
            let workdir = exe.parent().unwrap().to_path_buf();
            assert!(exe.exists());
            assert_eq!(
                fs::read_to_string(workdir.join(SOURCE_FILE)).unwrap(),
                "mov x0, #0\n"
            );

            drop(art);
            assert!(!workdir.exists());
        }

        fn is_empty_dir(dir: &Path) -> bool {
            fs::read_dir(dir).unwrap().next().is_none()
        }

        #[test]
        fn assembler_failure_carries_stderr() {
            let tools = tempdir().unwrap();
            let scratch = tempdir().unwrap();
            let tc = NativeToolchain::new(
                script(tools.path(), "as", "echo 'unknown mnemonic' >&2; exit 1"),
                script(tools.path(), "ld", SCRIPT_LINKER),
                vec![],
                Duration::from_secs(10),
            )
            .with_temp_root(scratch.path());

            let err = tc.build("bogus\n").unwrap_err();
            match err {
                CalibrationError::BuildFailed { stage, stderr } => {
                    assert_eq!(stage, "assemble");
                    assert_eq!(stderr, "unknown mnemonic");
                }
                other => panic!("unexpected error: {other}"),
            }
            assert!(is_empty_dir(scratch.path()));
        }

        #[test]
        fn slow_linker_times_out() {
            let tools = tempdir().unwrap();
            let scratch = tempdir().unwrap();
            let tc = NativeToolchain::new(
                script(tools.path(), "as", COPY_ASSEMBLER),
                script(tools.path(), "ld", "sleep 5"),
                vec![],
                Duration::from_millis(100),
            )
            .with_temp_root(scratch.path());

            let err = tc.build("x\n").unwrap_err();
            assert!(
                matches!(err, CalibrationError::Timeout { ref what, .. } if what == "build (link)")
            );
            assert!(is_empty_dir(scratch.path()));
        }

        #[test]
        fn successful_build_lands_in_temp_root() {
            let tools = tempdir().unwrap();
            let scratch = tempdir().unwrap();
            let tc = NativeToolchain::new(
                script(tools.path(), "as", COPY_ASSEMBLER),
                script(tools.path(), "ld", SCRIPT_LINKER),
                vec![],
                Duration::from_secs(10),
            )
            .with_temp_root(scratch.path());

            let art = tc.build("mov x0, #0\n").unwrap();
            assert!(art.path().starts_with(scratch.path()));
            assert!(!is_empty_dir(scratch.path()));
            drop(art);
            assert!(is_empty_dir(scratch.path()));
        }

        fn kernel_builder(workdir: &Path, body: &str, timeout: Duration) -> ScriptKernelBuilder {
            ScriptKernelBuilder {
                script: script(workdir, "build_native.sh", body),
                workdir: workdir.to_path_buf(),
                binary_pattern: "{name}_native_r{reps}".to_string(),
                timeout,
            }
        }

        #[test]
        fn kernel_script_receives_name_and_count() {
            let dir = tempdir().unwrap();
            let kb = kernel_builder(
                dir.path(),
                r#"printf '#!/bin/sh\nexit 0\n' > "$1_native_r$2" && chmod +x "$1_native_r$2""#,
                Duration::from_secs(10),
            );

            let art = kb.build_kernel("gemm", 50).unwrap();
            assert_eq!(art.path(), dir.path().join("gemm_native_r50"));
            assert!(!art.is_owned());
            assert!(art.path().is_file());
        }

        #[test]
        fn kernel_failures_name_the_size() {
            let dir = tempdir().unwrap();
            let failing = kernel_builder(
                dir.path(),
                "echo 'no such kernel' >&2; exit 2",
                Duration::from_secs(10),
            );
            match failing.build_kernel("lu", 10).unwrap_err() {
                CalibrationError::BuildFailed { stage, stderr } => {
                    assert_eq!(stage, "lu r10");
                    assert_eq!(stderr, "no such kernel");
                }
                other => panic!("unexpected error: {other}"),
            }

            let silent = kernel_builder(dir.path(), "exit 0", Duration::from_secs(10));
            assert!(matches!(
                silent.build_kernel("atax", 100),
                Err(CalibrationError::BuildFailed { ref stderr, .. }) if stderr.contains("atax_native_r100")
            ));

            let slow = kernel_builder(dir.path(), "sleep 5", Duration::from_millis(100));
            assert!(matches!(
                slow.build_kernel("mvt", 100),
                Err(CalibrationError::Timeout { ref what, .. }) if what == "build (mvt r100)"
            ));
        }
    }
}
