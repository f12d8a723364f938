use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Mutex,
};

use ssmgr_process::{LaunchOptions, ServerConfig};
use tokio::{io::AsyncWriteExt, process::Child, process::Command};

pub(crate) const CONFIG_FILE: &str = "ss_server.json";
pub(crate) const PID_FILE: &str = "ss_server.pid";
pub(crate) const LOG_FILE: &str = "ss_server.log";

/// Per-port working directory under the data root.
pub(crate) fn server_dir(data_root: &Path, port: u16) -> PathBuf {
    data_root.join(port.to_string())
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the agent dies, take the proxy down with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

async fn write_config(path: &Path, config: &ServerConfig) -> std::io::Result<()> {
    let data = serde_json::to_vec_pretty(config).map_err(std::io::Error::other)?;
    let mut f = tokio::fs::File::create(path).await?;
    f.write_all(&data).await?;
    f.flush().await?;
    Ok(())
}

/// Removes a server directory. Failures are logged and returned but callers
/// treat them as non-fatal.
pub(crate) async fn remove_residue(dir: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            tracing::warn!(dir = %dir.display(), error = %e, "can not delete managed server path");
            Err(e)
        }
    }
}

/// The live side of one managed server: its directory, generated config,
/// log handle and child process.
#[derive(Debug)]
pub(crate) struct ProcessRuntime {
    dir: PathBuf,
    config_path: PathBuf,
    pid: Option<u32>,
    child: Mutex<Child>,
    log: Option<std::fs::File>,
}

impl ProcessRuntime {
    /// Writes the working directory artifacts and starts the child.
    ///
    /// On error the directory may be left behind; see [`remove_residue`].
    pub(crate) async fn launch(
        config: &ServerConfig,
        server_bin: &str,
        data_root: &Path,
        launch: &LaunchOptions,
    ) -> std::io::Result<Self> {
        let dir = server_dir(data_root, config.port);
        tokio::fs::create_dir_all(&dir).await?;

        let config_path = dir.join(CONFIG_FILE);
        write_config(&config_path, config).await?;

        let log = std::fs::File::create(dir.join(LOG_FILE))?;
        let args = config.command_args(Some(&config_path), launch);

        let mut cmd = Command::new(server_bin);
        cmd.args(&args)
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log.try_clone()?))
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    set_parent_death_signal()?;
                    Ok(())
                });
            }
        }

        tracing::debug!(
            port = config.port,
            exec = server_bin,
            args = %config.redacted_args(Some(&config_path), launch).join(" "),
            "launching ss-server"
        );

        let child = cmd.spawn()?;
        let pid = child.id();

        if let Some(pid) = pid
            && let Err(e) = tokio::fs::write(dir.join(PID_FILE), pid.to_string()).await
        {
            tracing::warn!(port = config.port, error = %e, "can not save pid file");
        }

        Ok(Self {
            dir,
            config_path,
            pid,
            child: Mutex::new(child),
            log: Some(log),
        })
    }

    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Non-blocking liveness check. Reaps the child if it has exited.
    pub(crate) fn is_alive(&self) -> bool {
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        matches!(child.try_wait(), Ok(None))
    }

    /// Kills the child, waits for it, closes the log and deletes the directory.
    pub(crate) async fn terminate(mut self) {
        let mut child = self.child.into_inner().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = child.start_kill() {
            // Already-exited children land here too.
            tracing::debug!(pid = ?self.pid, error = %e, "kill ss-server");
        }
        if let Err(e) = child.wait().await {
            tracing::warn!(pid = ?self.pid, error = %e, "wait for ss-server exit");
        }
        drop(self.log.take());
        let _ = remove_residue(&self.dir).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_dir_is_keyed_by_port() {
        let root = Path::new("/var/lib/ssmgr");
        assert_eq!(server_dir(root, 8388), PathBuf::from("/var/lib/ssmgr/8388"));
    }

    #[tokio::test]
    async fn remove_residue_ignores_missing_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope");
        assert!(remove_residue(&missing).await.is_ok());
    }

    #[tokio::test]
    async fn launch_fails_for_missing_binary() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ServerConfig::new("127.0.0.1", 18388, "password123", "aes-256-cfb", 60);
        let err = ProcessRuntime::launch(
            &config,
            "/nonexistent/ss-server",
            tmp.path(),
            &LaunchOptions::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
        // The config was written before the spawn attempt.
        assert!(tmp.path().join("18388").join(CONFIG_FILE).exists());
    }
}
