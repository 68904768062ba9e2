use std::fmt::Write;
use std::future::Future;
use std::path::PathBuf;
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
use crate::manager::pbs::{format_pbs_duration, parse_pbs_datetime};

pub struct PbsHandler {
    handler: ExternalHandler,
}

impl PbsHandler {
    pub fn new(working_root: PathBuf, name: Option<String>) -> Self {
        Self {
            handler: ExternalHandler::new(working_root, name),
        }
    }
}

impl BackendHandler for PbsHandler {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            elastic_scaling: true,
            requires_channel: true,
        }
    }

    fn submit_allocation(
        &mut self,
        spec: SubmitSpec,
        mode: SubmitMode,
    ) -> Pin<Box<dyn Future<Output = crate::Result<SubmissionOutcome>>>> {
        let working_root = self.handler.working_root.clone();
        let name = self.handler.name.clone();
        let submission_num = self.handler.create_submission_num();

        Box::pin(async move {
            let working_dir =
                create_submission_dir(working_root, name.as_ref(), submission_num)?;

            let script = build_pbs_submit_script(
                spec.units,
                spec.timelimit,
                &spec.name,
                &working_dir.join("stdout").display().to_string(),
                &working_dir.join("stderr").display().to_string(),
                &spec.additional_args.join(" "),
                &spec.command,
                mode,
            );
            let id =
                submit_script(script, "qsub", &working_dir, |output| Ok(output.to_string()))
                    .await;

            Ok(SubmissionOutcome::new(id, working_dir))
        })
    }

    fn get_status_of_requests(
        &self,
        ids: &[RequestId],
    ) -> Pin<Box<dyn Future<Output = crate::Result<StatusMap>>>> {
        let mut arguments = vec!["qstat"];
        for id in ids {
            arguments.extend_from_slice(&["-f", id]);
        }
        // -x will also display finished jobs
        arguments.extend_from_slice(&["-F", "json", "-x"]);

        log::debug!("Running PBS command `{}`", arguments.join(" "));

        let mut command = create_command(arguments, &self.handler.working_root);
        let ids: Vec<RequestId> = ids.to_vec();

        Box::pin(async move {
            let output = run_command(&mut command, "qstat").await?;
            let output = check_command_output(output, "qstat")?;

            log::trace!(
                "PBS qstat output\nStdout\n{}Stderr\n{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );

            let data: serde_json::Value = serde_json::from_slice(&output.stdout)
                .map_err(|e| GridAllocError::GenericError(format!("Cannot parse qstat JSON output: {e}")))?;

            let mut result = Map::with_capacity(ids.len());

            let jobs = &data["Jobs"];
            for id in ids {
                let job = &jobs[&id];
                if !job.is_null() {
                    let status = parse_pbs_status(job);
                    result.insert(id, status);
                }
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
            let arguments = vec!["qdel", &id];
            log::debug!("Running PBS command `{}`", arguments.join(" "));

            let mut command = create_command(arguments, &workdir);
            let output = run_command(&mut command, "qdel").await?;
            check_command_output(output, "qdel")?;
            Ok(())
        })
    }
}

fn parse_pbs_status(job: &serde_json::Value) -> crate::Result<BackendStatus> {
    let state = job["job_state"].as_str().ok_or_else(|| {
        GridAllocError::GenericError("Missing job_state key in PBS qstat output".to_string())
    })?;

    let parse_time = |key: &str| -> Option<SystemTime> {
        job[key]
            .as_str()
            .and_then(|value| parse_pbs_datetime(value).ok())
            .map(local_to_system_time)
    };

    let status = match state {
        "Q" | "H" | "W" => BackendStatus::from(JobState::Pending),
        "R" | "E" => BackendStatus::from(JobState::Running),
        "F" => {
            let exit_status = job["Exit_status"].as_i64();
            let state = if exit_status == Some(0) {
                JobState::Completed
            } else {
                JobState::Failed
            };
            let mut status = BackendStatus::from(state);
            status.started_at = parse_time("stime");
            status.finished_at = parse_time("mtime");
            status
        }
        token => {
            return Err(GridAllocError::UnknownStatusToken {
                backend: "PBS".to_string(),
                token: token.to_string(),
            });
        }
    };
    Ok(status)
}

#[allow(clippy::too_many_arguments)]
fn build_pbs_submit_script(
    nodes: u64,
    timelimit: Duration,
    name: &str,
    stdout: &str,
    stderr: &str,
    qsub_args: &str,
    worker_cmd: &str,
    mode: SubmitMode,
) -> String {
    let mut script = format!(
        r##"#!/bin/bash
#PBS -l select={nodes}
#PBS -N {name}
#PBS -o {stdout}
#PBS -e {stderr}
#PBS -l walltime={walltime}
"##,
        nodes = nodes,
        name = name,
        stdout = stdout,
        stderr = stderr,
        walltime = format_pbs_duration(&timelimit)
    );

    if !qsub_args.is_empty() {
        writeln!(script, "#PBS {qsub_args}").unwrap();
    }
    match mode {
        SubmitMode::DryRun => script.push_str("#PBS -h\n"),
        SubmitMode::Submit => {}
    }

    script.push('\n');

    if nodes > 1 {
        write!(script, "pbsdsh -- bash -l -c '{worker_cmd}'").unwrap();
    } else {
        script.push_str(worker_cmd);
    };
    script
}
