use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use vhdm_core::exec::{classify, CommandRunner, SystemRunner, ToolOutcome};
use vhdm_core::{AttachOutcome, DetachOutcome, Result, VhdAttacher, VhdError};

mod path;

pub use path::to_windows_path;

const WSL_INTEROP_MARKER: &str = "/proc/sys/fs/binfmt_misc/WSLInterop";
const SYSTEMD_BINFMT: &str = "/usr/lib/systemd/systemd-binfmt";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttachFailure {
    AlreadyAttached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetachFailure {
    NotAttached,
}

const ATTACH_SIGNATURES: &[(&str, AttachFailure)] = &[
    ("WSL_E_USER_VHD_ALREADY_ATTACHED", AttachFailure::AlreadyAttached),
    ("already attached", AttachFailure::AlreadyAttached),
    ("already mounted", AttachFailure::AlreadyAttached),
];

const DETACH_SIGNATURES: &[(&str, DetachFailure)] = &[
    ("ERROR_FILE_NOT_FOUND", DetachFailure::NotAttached),
    ("WSL_E_DISK_NOT_FOUND", DetachFailure::NotAttached),
    ("not attached", DetachFailure::NotAttached),
    ("not currently attached", DetachFailure::NotAttached),
];

/// Attaches and detaches VHDs through the host's `wsl.exe`.
pub struct WslAttacher {
    runner: Arc<dyn CommandRunner>,
    wsl_exe: PathBuf,
    interop_marker: PathBuf,
    interop_checked: OnceLock<()>,
}

impl WslAttacher {
    pub fn new(wsl_exe: impl Into<PathBuf>) -> Self {
        Self::with_runner(Arc::new(SystemRunner), wsl_exe)
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>, wsl_exe: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            wsl_exe: wsl_exe.into(),
            interop_marker: PathBuf::from(WSL_INTEROP_MARKER),
            interop_checked: OnceLock::new(),
        }
    }

    pub fn with_interop_marker(mut self, marker: impl Into<PathBuf>) -> Self {
        self.interop_marker = marker.into();
        self
    }

    /// Windows binaries only run from the guest once the interop binfmt
    /// handler is registered. Checked once per process; enabling is tried
    /// once and a failure is logged, not retried.
    pub fn ensure_interop(&self) {
        self.interop_checked.get_or_init(|| {
            if interop_enabled(&self.interop_marker) {
                return;
            }
            tracing::info!("WSL interop is not registered, running systemd-binfmt");
            match self.runner.run(SYSTEMD_BINFMT, &[], Some(Duration::from_secs(10))) {
                Ok(output) if output.success() => {
                    tracing::info!("WSL interop enabled");
                }
                Ok(output) => {
                    tracing::warn!(output = %output.combined(), "systemd-binfmt failed");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "could not run systemd-binfmt");
                }
            }
        });
    }

    fn wsl(&self, args: &[&str], timeout: Option<Duration>) -> Result<vhdm_core::exec::CommandOutput> {
        self.ensure_interop();
        let program = self.wsl_exe.display().to_string();
        self.runner.run(&program, args, timeout)
    }
}

fn interop_enabled(marker: &Path) -> bool {
    marker.exists() || marker.with_file_name("WSLInterop-late").exists()
}

impl VhdAttacher for WslAttacher {
    fn attach(&self, path: &str) -> Result<AttachOutcome> {
        let windows_path = to_windows_path(path);
        tracing::info!(path, windows_path = %windows_path, "attaching VHD");
        let output = self.wsl(&["--mount", "--vhd", &windows_path, "--bare"], None)?;
        match classify(output, ATTACH_SIGNATURES) {
            ToolOutcome::Success(_) => Ok(AttachOutcome::Attached),
            ToolOutcome::Known(AttachFailure::AlreadyAttached, _) => {
                tracing::info!(path, "VHD was already attached");
                Ok(AttachOutcome::AlreadyAttached)
            }
            ToolOutcome::TimedOut(output) | ToolOutcome::Failed(output) => {
                Err(output.into_error("wsl.exe --mount"))
            }
        }
    }

    fn detach(&self, path: &str, timeout: Duration) -> Result<DetachOutcome> {
        let windows_path = to_windows_path(path);
        tracing::info!(path, windows_path = %windows_path, ?timeout, "detaching VHD");
        let output = self.wsl(&["--unmount", &windows_path], Some(timeout))?;
        match classify(output, DETACH_SIGNATURES) {
            ToolOutcome::Success(_) => Ok(DetachOutcome::Detached),
            ToolOutcome::Known(DetachFailure::NotAttached, _) => {
                tracing::info!(path, "VHD was not attached");
                Ok(DetachOutcome::NotAttached)
            }
            ToolOutcome::TimedOut(_) => Err(VhdError::DetachTimeout {
                path: path.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
            ToolOutcome::Failed(output) => Err(output.into_error("wsl.exe --unmount")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use vhdm_core::exec::CommandOutput;

    struct Recorder {
        reply: CommandOutput,
        calls: Mutex<Vec<(String, Vec<String>, Option<Duration>)>>,
    }

    impl Recorder {
        fn replying(status: Option<i32>, stdout: &str, timed_out: bool) -> Arc<Self> {
            Arc::new(Self {
                reply: CommandOutput {
                    status,
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                    timed_out,
                },
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, Vec<String>, Option<Duration>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl CommandRunner for Recorder {
        fn run(&self, program: &str, args: &[&str], timeout: Option<Duration>) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push((
                program.to_string(),
                args.iter().map(|a| a.to_string()).collect(),
                timeout,
            ));
            Ok(self.reply.clone())
        }
    }

    fn attacher(runner: &Arc<Recorder>, marker_dir: &TempDir) -> WslAttacher {
        let marker = marker_dir.path().join("WSLInterop");
        std::fs::write(&marker, "enabled").unwrap();
        WslAttacher::with_runner(runner.clone(), "/mnt/c/Windows/System32/wsl.exe")
            .with_interop_marker(marker)
    }

    #[test]
    fn attach_passes_windows_path_bare() {
        let dir = TempDir::new().unwrap();
        let runner = Recorder::replying(Some(0), "", false);
        let outcome = attacher(&runner, &dir).attach("/mnt/c/VMs/data.vhdx").unwrap();
        assert_eq!(outcome, AttachOutcome::Attached);
        let calls = runner.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "/mnt/c/Windows/System32/wsl.exe");
        assert_eq!(calls[0].1, vec!["--mount", "--vhd", "C:\\VMs\\data.vhdx", "--bare"]);
    }

    #[test]
    fn attach_recognises_already_attached() {
        let dir = TempDir::new().unwrap();
        let runner = Recorder::replying(
            Some(-1),
            "The disk is already attached.\r\nError code: Wsl/Service/AttachDisk/WSL_E_USER_VHD_ALREADY_ATTACHED",
            false,
        );
        let outcome = attacher(&runner, &dir).attach("C:/VMs/data.vhdx").unwrap();
        assert_eq!(outcome, AttachOutcome::AlreadyAttached);
    }

    #[test]
    fn attach_hard_failure_carries_output() {
        let dir = TempDir::new().unwrap();
        let runner = Recorder::replying(Some(1), "The system cannot find the file specified.", false);
        let err = attacher(&runner, &dir).attach("C:/VMs/missing.vhdx").unwrap_err();
        match err {
            VhdError::ExternalTool { output, .. } => assert!(output.contains("cannot find")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn detach_distinguishes_not_attached_and_timeout() {
        let dir = TempDir::new().unwrap();
        let runner = Recorder::replying(Some(1), "Error code: Wsl/Service/DetachDisk/ERROR_FILE_NOT_FOUND", false);
        let outcome = attacher(&runner, &dir)
            .detach("C:/VMs/data.vhdx", Duration::from_secs(5))
            .unwrap();
        assert_eq!(outcome, DetachOutcome::NotAttached);
        assert_eq!(runner.calls()[0].2, Some(Duration::from_secs(5)));

        let runner = Recorder::replying(None, "", true);
        let err = attacher(&runner, &dir)
            .detach("C:/VMs/data.vhdx", Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, VhdError::DetachTimeout { timeout_secs: 5, .. }));
    }

    #[test]
    fn interop_is_enabled_at_most_once() {
        let dir = TempDir::new().unwrap();
        let runner = Recorder::replying(Some(0), "", false);
        let attacher = WslAttacher::with_runner(runner.clone(), "wsl.exe")
            .with_interop_marker(dir.path().join("WSLInterop"));
        attacher.attach("C:/a.vhdx").unwrap();
        attacher.attach("C:/b.vhdx").unwrap();
        let programs: Vec<String> = runner.calls().into_iter().map(|call| call.0).collect();
        assert_eq!(programs, vec![SYSTEMD_BINFMT, "wsl.exe", "wsl.exe"]);
    }
}
