use bstr::ByteSlice;
use std::fmt::Write;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{Duration, SystemTime};

use crate::Map;
use crate::alloc::backend::common::{
    ExternalHandler, check_command_output, create_command, create_submission_dir, run_command,
    submit_script,
};
use crate::alloc::backend::{
    BackendCapabilities, BackendHandler, BackendStatus, StatusMap, SubmissionOutcome, SubmitMode,
    SubmitSpec,
};
use crate::alloc::state::{JobState, RequestId};
use crate::common::error::GridAllocError;
use crate::manager::common::local_to_system_time;
use crate::manager::slurm::{format_slurm_duration, get_scontrol_items, parse_slurm_datetime};

pub struct SlurmHandler {
    handler: ExternalHandler,
}

impl SlurmHandler {
    pub fn new(working_root: PathBuf, name: Option<String>) -> Self {
        Self {
            handler: ExternalHandler::new(working_root, name),
        }
    }
}

impl BackendHandler for SlurmHandler {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            elastic_scaling: true,
            requires_channel: true,
        }
    }

    fn submit_allocation(
        &mut self,
        spec: SubmitSpec,
        _mode: SubmitMode,
    ) -> Pin<Box<dyn Future<Output = crate::Result<SubmissionOutcome>>>> {
        let working_root = self.handler.working_root.clone();
        let name = self.handler.name.clone();
        let submission_num = self.handler.create_submission_num();

        Box::pin(async move {
            let working_dir =
                create_submission_dir(working_root, name.as_ref(), submission_num)?;

            let script = build_slurm_submit_script(
                spec.units,
                spec.timelimit,
                &spec.name,
                &working_dir.join("stdout").display().to_string(),
                &working_dir.join("stderr").display().to_string(),
                &spec.additional_args.join(" "),
                &spec.command,
            );
            let id = submit_script(script, "sbatch", &working_dir, |output| {
                log::debug!("Sbatch output: {output}");
                output
                    .lines()
                    .map(|l| l.trim())
                    .find(|l| l.to_lowercase().starts_with("submitted batch job"))
                    .and_then(|l| l.split(' ').nth(3))
                    .map(|l| l.to_string())
                    .ok_or_else(|| {
                        GridAllocError::Submission(format!(
                            "Missing job id in sbatch output\n{output}"
                        ))
                    })
            })
            .await;

            Ok(SubmissionOutcome::new(id, working_dir))
        })
    }

    fn get_status_of_requests(
        &self,
        ids: &[RequestId],
    ) -> Pin<Box<dyn Future<Output = crate::Result<StatusMap>>>> {
        let ids: Vec<RequestId> = ids.to_vec();
        let workdir = self.handler.working_root.clone();

        Box::pin(async move {
            let mut result = Map::with_capacity(ids.len());
            for id in ids {
                let status = get_request_status(&id, &workdir).await;
                result.insert(id, status);
            }

            Ok(result)
        })
    }

    fn cancel_request(
        &self,
        id: &RequestId,
    ) -> Pin<Box<dyn Future<Output = crate::Result<()>>>> {
        let id = id.clone();
        let workdir = self.handler.working_root.clone();

        Box::pin(async move {
            let arguments = vec!["scancel", &id];
            log::debug!("Running Slurm command `{}`", arguments.join(" "));
            let mut command = create_command(arguments, &workdir);
            let output = run_command(&mut command, "scancel").await?;
            check_command_output(output, "scancel")?;
            Ok(())
        })
    }
}

async fn get_request_status(id: &str, workdir: &Path) -> crate::Result<BackendStatus> {
    let arguments = vec!["scontrol", "show", "job", id];
    log::debug!("Running Slurm command `{}`", arguments.join(" "));

    let mut command = create_command(arguments, workdir);
    let output = run_command(&mut command, "scontrol").await?;
    let output = check_command_output(output, "scontrol")?;

    let output = output
        .stdout
        .to_str()
        .map_err(|e| GridAllocError::GenericError(format!("Invalid UTF-8 scontrol output: {e:?}")))?;
    parse_slurm_status(get_scontrol_items(output))
}

fn parse_slurm_status(items: Map<&str, &str>) -> crate::Result<BackendStatus> {
    let parse_time = |key: &str| -> Option<SystemTime> {
        items
            .get(key)
            .and_then(|value| parse_slurm_datetime(value).ok())
            .map(local_to_system_time)
    };

    let status = items.get("JobState").copied().ok_or_else(|| {
        GridAllocError::GenericError("Missing key JobState in Slurm scontrol output".to_string())
    })?;
    let state = match status {
        "PENDING" | "CONFIGURING" => JobState::Pending,
        "RUNNING" | "COMPLETING" => JobState::Running,
        "COMPLETED" => JobState::Completed,
        "CANCELLED" | "PREEMPTED" => JobState::Cancelled,
        "FAILED" | "NODE_FAIL" | "BOOT_FAIL" | "OUT_OF_MEMORY" => JobState::Failed,
        "TIMEOUT" | "DEADLINE" => JobState::Timeout,
        _ => {
            return Err(GridAllocError::UnknownStatusToken {
                backend: "SLURM".to_string(),
                token: status.to_string(),
            });
        }
    };

    let mut result = BackendStatus::from(state);
    if state.is_terminal() {
        result.started_at = parse_time("StartTime");
        result.finished_at = parse_time("EndTime");
    }
    Ok(result)
}

fn build_slurm_submit_script(
    nodes: u64,
    timelimit: Duration,
    name: &str,
    stdout: &str,
    stderr: &str,
    sbatch_args: &str,
    worker_cmd: &str,
) -> String {
    let mut script = format!(
        r##"#!/bin/bash
#SBATCH --nodes={nodes}
#SBATCH --job-name={name}
#SBATCH --output={stdout}
#SBATCH --error={stderr}
#SBATCH --time={walltime}
"##,
        nodes = nodes,
        name = name,
        stdout = stdout,
        stderr = stderr,
        walltime = format_slurm_duration(&timelimit)
    );

    if !sbatch_args.is_empty() {
        writeln!(script, "#SBATCH {sbatch_args}").unwrap();
    }

    // Cluster-wide sbatch defaults (e.g. `--ntasks-per-node`) must not change
    // how many workers run, so multi-node requests pin both `--ntasks` and
    // `--nodes` and use `--overlap` to keep nested srun invocations able to
    // consume resources.
    let prefix = if nodes > 1 {
        format!("srun --overlap --ntasks={nodes} --nodes={nodes} ")
    } else {
        "".to_string()
    };
    write!(script, "\n{prefix}{worker_cmd}").unwrap();
    script
}

#[cfg(test)]
mod tests {
    use super::{build_slurm_submit_script, parse_slurm_status};
    use crate::alloc::state::JobState;
    use crate::manager::slurm::get_scontrol_items;
    use std::time::Duration;

    fn status_of(output: &str) -> crate::Result<super::BackendStatus> {
        parse_slurm_status(get_scontrol_items(output))
    }

    #[test]
    fn parse_active_states() {
        assert_eq!(
            status_of("JobState=PENDING Reason=None").unwrap().state,
            JobState::Pending
        );
        assert_eq!(
            status_of("JobState=RUNNING Reason=None").unwrap().state,
            JobState::Running
        );
    }

    #[test]
    fn parse_terminal_states() {
        let output = "JobState=COMPLETED Reason=None
   StartTime=2021-10-07T11:15:26 EndTime=2021-10-07T11:30:26";
        let status = status_of(output).unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert!(status.started_at.is_some());
        assert!(status.finished_at.is_some());

        assert_eq!(
            status_of("JobState=FAILED").unwrap().state,
            JobState::Failed
        );
        assert_eq!(
            status_of("JobState=TIMEOUT").unwrap().state,
            JobState::Timeout
        );
        assert_eq!(
            status_of("JobState=CANCELLED").unwrap().state,
            JobState::Cancelled
        );
    }

    #[test]
    fn terminal_status_tolerates_unparseable_times() {
        let status = status_of("JobState=CANCELLED StartTime=Unknown EndTime=Unknown").unwrap();
        assert_eq!(status.state, JobState::Cancelled);
        assert!(status.started_at.is_none());
        assert!(status.finished_at.is_none());
    }

    #[test]
    fn parse_rejects_unknown_state() {
        assert!(status_of("JobState=SPECIAL").is_err());
        assert!(status_of("Reason=None").is_err());
    }

    #[test]
    fn submit_script_directives() {
        let script = build_slurm_submit_script(
            1,
            Duration::from_secs(3600),
            "worker-1",
            "/tmp/stdout",
            "/tmp/stderr",
            "--partition=debug",
            "worker start",
        );
        assert!(script.contains("#SBATCH --nodes=1\n"));
        assert!(script.contains("#SBATCH --job-name=worker-1\n"));
        assert!(script.contains("#SBATCH --time=01:00:00\n"));
        assert!(script.contains("#SBATCH --partition=debug\n"));
        assert!(script.ends_with("\nworker start"));
    }

    #[test]
    fn multi_node_script_uses_srun() {
        let script = build_slurm_submit_script(
            3,
            Duration::from_secs(60),
            "worker",
            "/tmp/stdout",
            "/tmp/stderr",
            "",
            "worker start",
        );
        assert!(script.ends_with("srun --overlap --ntasks=3 --nodes=3 worker start"));
    }
}
