use bstr::ByteSlice;
use std::fmt::Write;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

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
use crate::manager::sge::{format_sge_duration, parse_qstat_table};

pub struct SgeHandler {
    handler: ExternalHandler,
}

impl SgeHandler {
    pub fn new(working_root: PathBuf, name: Option<String>) -> Self {
        Self {
            handler: ExternalHandler::new(working_root, name),
        }
    }
}

impl BackendHandler for SgeHandler {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            elastic_scaling: true,
            requires_channel: false,
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

            let script = build_sge_submit_script(
                spec.units,
                spec.timelimit,
                &spec.name,
                &working_dir.join("stdout").display().to_string(),
                &working_dir.join("stderr").display().to_string(),
                &spec.additional_args.join(" "),
                &spec.command,
                mode,
            );
            let id = submit_script(script, "qsub", &working_dir, |output| {
                log::debug!("Qsub output: {output}");
                parse_qsub_output(output)
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
            let arguments = vec!["qstat"];
            log::debug!("Running SGE command `{}`", arguments.join(" "));

            let mut command = create_command(arguments, &workdir);
            let output = run_command(&mut command, "qstat").await?;
            let output = check_command_output(output, "qstat")?;
            let output = output
                .stdout
                .to_str()
                .map_err(|e| {
                    GridAllocError::GenericError(format!("Invalid UTF-8 qstat output: {e:?}"))
                })?;

            let jobs = parse_qstat_table(output);

            let mut result = Map::with_capacity(ids.len());
            for id in ids {
                let status = match jobs.get(id.as_str()) {
                    Some(tokens) => aggregate_sge_states(tokens),
                    // SGE drops finished jobs from the qstat listing.
                    None => Ok(BackendStatus::from(JobState::Completed)),
                };
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
            let arguments = vec!["qdel", &id];
            log::debug!("Running SGE command `{}`", arguments.join(" "));
            let mut command = create_command(arguments, &workdir);
            let output = run_command(&mut command, "qdel").await?;
            check_command_output(output, "qdel")?;
            Ok(())
        })
    }
}

/// Translate one SGE state token into the canonical vocabulary.
///
/// The shutdown-transition tokens are reported by SGE execution daemons while
/// an allocation winds down; they all count as a completed request. Error
/// states (`Eqw` and friends) and deletion-in-progress states are reported
/// separately.
fn translate_sge_state(token: &str) -> crate::Result<JobState> {
    let state = match token {
        "qw" | "hqw" | "hRwq" => JobState::Pending,
        "r" | "t" | "Rr" | "Rt" => JobState::Running,
        "terminated" | "shutting-down" | "stopping" | "stopped" => JobState::Completed,
        "dr" | "dt" | "dRr" => JobState::Cancelled,
        token if token.contains('E') => JobState::Failed,
        _ => {
            return Err(GridAllocError::UnknownStatusToken {
                backend: "SGE".to_string(),
                token: token.to_string(),
            });
        }
    };
    Ok(state)
}

/// Combine the per-task state tokens of one (possibly array) job into a
/// single request state. An array job counts as running while any of its
/// tasks runs and as pending while any task is still queued.
fn aggregate_sge_states(tokens: &[&str]) -> crate::Result<BackendStatus> {
    let mut aggregated = JobState::Completed;
    for token in tokens {
        let state = translate_sge_state(token)?;
        aggregated = match (aggregated, state) {
            (_, JobState::Running) | (JobState::Running, _) => JobState::Running,
            (_, JobState::Pending) | (JobState::Pending, _) => JobState::Pending,
            (_, JobState::Failed) | (JobState::Failed, _) => JobState::Failed,
            (_, JobState::Cancelled) | (JobState::Cancelled, _) => JobState::Cancelled,
            (current, _) => current,
        };
    }
    Ok(BackendStatus::from(aggregated))
}

/// Extract the job id from qsub output, e.g.
/// `Your job 42 ("worker") has been submitted` or
/// `Your job-array 43.1-4:1 ("worker") has been submitted`.
fn parse_qsub_output(output: &str) -> crate::Result<RequestId> {
    output
        .lines()
        .map(|line| line.trim())
        .find(|line| line.to_lowercase().starts_with("your job"))
        .and_then(|line| line.split(' ').nth(2))
        .and_then(|id| id.split('.').next())
        .map(|id| id.to_string())
        .ok_or_else(|| {
            GridAllocError::Submission(format!("Missing job id in qsub output\n{output}"))
        })
}

#[allow(clippy::too_many_arguments)]
fn build_sge_submit_script(
    units: u64,
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
#$ -N {name}
#$ -o {stdout}
#$ -e {stderr}
#$ -l h_rt={walltime}
"##,
        name = name,
        stdout = stdout,
        stderr = stderr,
        walltime = format_sge_duration(&timelimit)
    );

    // One worker per array task keeps a multi-unit request under a single
    // job id.
    if units > 1 {
        writeln!(script, "#$ -t 1-{units}").unwrap();
    }
    if !qsub_args.is_empty() {
        writeln!(script, "#$ {qsub_args}").unwrap();
    }
    match mode {
        SubmitMode::DryRun => script.push_str("#$ -h\n"),
        SubmitMode::Submit => {}
    }

    write!(script, "\n{worker_cmd}").unwrap();
    script
}

#[cfg(test)]
mod tests {
    use super::{
        aggregate_sge_states, build_sge_submit_script, parse_qsub_output, translate_sge_state,
    };
    use crate::alloc::backend::SubmitMode;
    use crate::alloc::state::JobState;
    use std::time::Duration;

    #[test]
    fn translate_documented_vocabulary() {
        assert_eq!(translate_sge_state("qw").unwrap(), JobState::Pending);
        assert_eq!(translate_sge_state("r").unwrap(), JobState::Running);
        for token in ["terminated", "shutting-down", "stopping", "stopped"] {
            assert_eq!(translate_sge_state(token).unwrap(), JobState::Completed);
        }
    }

    #[test]
    fn translate_held_and_transferring() {
        assert_eq!(translate_sge_state("hqw").unwrap(), JobState::Pending);
        assert_eq!(translate_sge_state("t").unwrap(), JobState::Running);
    }

    #[test]
    fn translate_error_and_deletion_states() {
        assert_eq!(translate_sge_state("Eqw").unwrap(), JobState::Failed);
        assert_eq!(translate_sge_state("Ehqw").unwrap(), JobState::Failed);
        assert_eq!(translate_sge_state("dr").unwrap(), JobState::Cancelled);
        assert_eq!(translate_sge_state("dt").unwrap(), JobState::Cancelled);
    }

    #[test]
    fn translate_rejects_unknown_token() {
        let error = translate_sge_state("zz").unwrap_err();
        assert!(error.to_string().contains("zz"));
    }

    #[test]
    fn aggregate_prefers_active_states() {
        assert_eq!(
            aggregate_sge_states(&["qw", "r"]).unwrap().state,
            JobState::Running
        );
        assert_eq!(
            aggregate_sge_states(&["qw", "Eqw"]).unwrap().state,
            JobState::Pending
        );
        assert_eq!(
            aggregate_sge_states(&["terminated"]).unwrap().state,
            JobState::Completed
        );
    }

    #[test]
    fn parse_qsub_plain_and_array_output() {
        assert_eq!(
            parse_qsub_output(r#"Your job 42 ("worker") has been submitted"#).unwrap(),
            "42"
        );
        assert_eq!(
            parse_qsub_output(r#"Your job-array 43.1-4:1 ("worker") has been submitted"#).unwrap(),
            "43"
        );
        assert!(parse_qsub_output("qsub: something went wrong").is_err());
    }

    #[test]
    fn submit_script_directives() {
        let script = build_sge_submit_script(
            4,
            Duration::from_secs(3600),
            "worker-1",
            "/tmp/stdout",
            "/tmp/stderr",
            "-q all.q",
            "worker start",
            SubmitMode::Submit,
        );
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#$ -N worker-1\n"));
        assert!(script.contains("#$ -l h_rt=01:00:00\n"));
        assert!(script.contains("#$ -t 1-4\n"));
        assert!(script.contains("#$ -q all.q\n"));
        assert!(script.ends_with("\nworker start"));
    }

    #[test]
    fn dry_run_script_is_held() {
        let script = build_sge_submit_script(
            1,
            Duration::from_secs(60),
            "test",
            "/tmp/stdout",
            "/tmp/stderr",
            "",
            "worker start",
            SubmitMode::DryRun,
        );
        assert!(script.contains("#$ -h\n"));
        assert!(!script.contains("#$ -t"));
    }
}
