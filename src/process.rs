//! Child processes started by the orchestrator.

use std::ffi::OsStr;
use std::future::Future;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use fbp_channel::{NegotiationError, Negotiator, StartupInfo};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::FlowError;

/// What a process is to the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// Hosts channels; expected to run until the flow is torn down.
    Channel,
    /// Runs a node of the flow.
    Component,
}

/// A child process that is killed when dropped.
#[derive(Debug)]
pub struct ManagedProcess {
    name: String,
    role: ProcessRole,
    child: Child,
}

impl ManagedProcess {
    pub fn spawn<I, S>(name: impl Into<String>, program: impl AsRef<OsStr>, args: I) -> Result<Self, FlowError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null());
        Self::spawn_command(name, ProcessRole::Component, cmd)
    }

    pub fn spawn_command(
        name: impl Into<String>,
        role: ProcessRole,
        mut cmd: Command,
    ) -> Result<Self, FlowError> {
        let name = name.into();
        let child = cmd
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FlowError::ProcessStart {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        debug!(%name, ?role, pid = ?child.id(), "process started");
        Ok(Self { name, role, child })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn child_mut(&mut self) -> &mut Child {
        &mut self.child
    }

    /// Whether the process is still running.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Terminates the process. `true` only if it was running and is now gone.
    pub async fn stop(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(name = %self.name, %status, "process had already exited");
                false
            }
            Ok(None) => match self.child.kill().await {
                Ok(()) => {
                    debug!(name = %self.name, "process terminated");
                    true
                }
                Err(e) => {
                    warn!(name = %self.name, error = %e, "could not terminate process");
                    false
                }
            },
            Err(e) => {
                warn!(name = %self.name, error = %e, "could not query process");
                false
            }
        }
    }

    pub async fn wait(&mut self) -> Result<ExitStatus, FlowError> {
        Ok(self.child.wait().await?)
    }
}

/// Everything a flow run started; torn down together.
#[derive(Debug, Default)]
pub struct ProcessSet {
    processes: Vec<ManagedProcess>,
}

impl ProcessSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, process: ManagedProcess) {
        self.processes.push(process);
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Waits for the next process to exit and removes it from the set.
    ///
    /// `None` once the set is empty. Cancel safe: a dropped call loses no exit.
    pub async fn next_exit(&mut self) -> Option<(ManagedProcess, Result<ExitStatus, FlowError>)> {
        let (index, status) = {
            let mut exits: FuturesUnordered<_> = self
                .processes
                .iter_mut()
                .enumerate()
                .map(|(i, p)| async move { (i, p.child.wait().await) })
                .collect();
            exits.next().await?
        };
        let process = self.processes.swap_remove(index);
        Some((process, status.map_err(FlowError::from)))
    }

    /// Stops everything still running; returns how many were terminated.
    pub async fn stop_all(&mut self) -> usize {
        let mut stopped = 0;
        for mut process in self.processes.drain(..) {
            if process.stop().await {
                stopped += 1;
            }
        }
        if stopped > 0 {
            info!(stopped, "processes terminated");
        }
        stopped
    }
}

/// Channels one `fbp-channel` process should host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub name: String,
    /// Startup-info id the process reports under.
    pub id: String,
    pub no_of_channels: usize,
    pub buffer_size: usize,
}

/// How to start `fbp-channel` processes.
#[derive(Debug, Clone)]
pub struct ChannelLauncher {
    pub bin: PathBuf,
    pub host: String,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
}

impl ChannelLauncher {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("--host")
            .arg(&self.host)
            .arg("--log_level")
            .arg(&self.log_level)
            .stdin(Stdio::null());
        if let Some(dir) = &self.log_dir {
            cmd.arg("--log_dir").arg(dir);
        }
        cmd
    }

    /// Starts the bootstrap channel and reads its `readerSR=` / `writerSR=` lines.
    pub async fn start_bootstrap(
        &self,
        wait: Duration,
    ) -> Result<(ManagedProcess, String, String), FlowError> {
        let mut cmd = self.command();
        cmd.arg("--name").arg("bootstrap").arg("--output_srs").stdout(Stdio::piped());
        let mut process = ManagedProcess::spawn_command("bootstrap channel", ProcessRole::Channel, cmd)?;
        let start_failed = |reason: String| FlowError::ProcessStart {
            name: "bootstrap channel".into(),
            reason,
        };
        let stdout = process
            .child_mut()
            .stdout
            .take()
            .ok_or_else(|| start_failed("stdout not captured".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        let read_srs = async {
            let (mut reader_sr, mut writer_sr) = (None, None);
            while reader_sr.is_none() || writer_sr.is_none() {
                let Some(line) = lines.next_line().await? else {
                    break;
                };
                if let Some(sr) = line.trim().strip_prefix("readerSR=") {
                    reader_sr = Some(sr.to_string());
                } else if let Some(sr) = line.trim().strip_prefix("writerSR=") {
                    writer_sr = Some(sr.to_string());
                }
            }
            Ok::<_, std::io::Error>(reader_sr.zip(writer_sr))
        };
        let srs = timeout(wait, read_srs)
            .await
            .map_err(|_| start_failed("no sturdy refs before timeout".into()))??;
        let (reader_sr, writer_sr) =
            srs.ok_or_else(|| start_failed("exited before printing its sturdy refs".into()))?;

        // keep draining so the pipe never fills
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(%line, "bootstrap channel stdout");
            }
        });
        info!(%reader_sr, %writer_sr, "bootstrap channel started");
        Ok((process, reader_sr, writer_sr))
    }

    /// Starts a channel process that reports its startup infos under `request.id`.
    pub fn start(&self, request: &ChannelRequest, report_writer_sr: &str) -> Result<ManagedProcess, FlowError> {
        let mut cmd = self.command();
        cmd.arg("--name")
            .arg(&request.name)
            .arg("--startup_info_id")
            .arg(&request.id)
            .arg("--startup_info_writer_sr")
            .arg(report_writer_sr)
            .arg("--no_of_channels")
            .arg(request.no_of_channels.to_string())
            .arg("--buffer_size")
            .arg(request.buffer_size.to_string())
            .stdout(Stdio::null());
        ManagedProcess::spawn_command(format!("channel {}", request.name), ProcessRole::Channel, cmd)
    }

    /// Starts a channel process and asks `negotiator` for the startup infos
    /// it reports.
    ///
    /// The process comes back at once so it can be watched and stopped while
    /// the infos are still on their way.
    pub fn start_channels<'n>(
        &self,
        negotiator: &'n Negotiator,
        request: ChannelRequest,
        report_writer_sr: &str,
        wait: Duration,
    ) -> Result<
        (
            ManagedProcess,
            impl Future<Output = Result<Vec<StartupInfo>, NegotiationError>> + use<'n>,
        ),
        FlowError,
    > {
        let process = self.start(&request, report_writer_sr)?;
        let infos = async move {
            negotiator
                .request(&request.id, request.no_of_channels, wait)
                .await
        };
        Ok((process, infos))
    }
}
