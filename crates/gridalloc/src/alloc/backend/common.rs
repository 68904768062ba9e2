use bstr::ByteSlice;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;

use crate::alloc::state::RequestId;
use crate::common::error::GridAllocError;

/// Name of a script that will be submitted to the scheduler.
const SUBMIT_SCRIPT_NAME: &str = "submit.sh";

/// Name of a file that will store the id of a submitted request.
const JOBID_FILE_NAME: &str = "jobid";

/// Shared construction-time state of the concrete backend handlers.
pub struct ExternalHandler {
    pub working_root: PathBuf,
    pub name: Option<String>,
    submission_counter: u64,
}

impl ExternalHandler {
    pub fn new(working_root: PathBuf, name: Option<String>) -> Self {
        Self {
            working_root,
            name,
            submission_counter: 0,
        }
    }

    pub fn create_submission_num(&mut self) -> u64 {
        self.submission_counter += 1;
        self.submission_counter
    }
}

/// Create the working directory for a single submission.
///
/// The directory keeps the submit script, the scheduler id and the
/// stdout/stderr of the request for debugging.
pub fn create_submission_dir(
    working_root: PathBuf,
    name: Option<&String>,
    submission_num: u64,
) -> Result<PathBuf, std::io::Error> {
    let mut dir = working_root;
    dir.push("alloc");
    dir.push(name.map(|name| name.as_str()).unwrap_or("default"));
    dir.push(format!("{submission_num:03}"));

    std::fs::create_dir_all(&dir)?;

    Ok(dir)
}

pub fn create_command(arguments: Vec<&str>, workdir: &Path) -> Command {
    let mut command = Command::new(arguments[0]);
    command.args(&arguments[1..]);
    command.current_dir(workdir);
    command
}

/// Run a scheduler command to completion and return its raw output.
///
/// A failure to spawn the command at all is a transport problem and is
/// reported as [`GridAllocError::Channel`], distinct from the command running
/// and reporting an error.
pub async fn run_command(command: &mut Command, program: &str) -> crate::Result<Output> {
    command
        .output()
        .await
        .map_err(|error| GridAllocError::Channel(format!("{program} could not be started: {error}")))
}

pub fn check_command_output(output: Output, program: &str) -> crate::Result<Output> {
    let status = output.status;
    if !status.success() {
        return Err(GridAllocError::CommandFailed {
            program: program.to_string(),
            code: status.code().unwrap_or(-1),
            stderr: output.stderr.to_str_lossy().trim().to_string(),
            stdout: output.stdout.to_str_lossy().trim().to_string(),
        });
    }
    Ok(output)
}

/// Submit a script into the scheduler and record debug information in the
/// given submission `directory`.
///
/// Scheduler rejections and unparseable submission output are reported as
/// [`GridAllocError::Submission`] with the raw diagnostic attached.
pub async fn submit_script<F>(
    script: String,
    program: &str,
    directory: &Path,
    get_job_id: F,
) -> crate::Result<RequestId>
where
    F: FnOnce(&str) -> crate::Result<RequestId>,
{
    let script_path = directory.join(SUBMIT_SCRIPT_NAME);
    std::fs::write(&script_path, script)?;
    let script_path = script_path.to_str().ok_or_else(|| {
        GridAllocError::GenericError(format!("Non UTF-8 script path {script_path:?}"))
    })?;

    let arguments = vec![program, script_path];
    log::debug!("Running command `{}`", arguments.join(" "));
    let mut command = create_command(arguments, directory);

    let output = run_command(&mut command, program).await?;
    let output = check_command_output(output, program).map_err(|error| match error {
        GridAllocError::CommandFailed {
            code,
            stderr,
            stdout,
            ..
        } => GridAllocError::Submission(format!(
            "{program} exited with code {code}\nStderr: {stderr}\nStdout: {stdout}"
        )),
        other => other,
    })?;
    let output = output
        .stdout
        .to_str()
        .map_err(|e| GridAllocError::Submission(format!("Invalid UTF-8 {program} output: {e:?}")))?
        .trim();

    let job_id = get_job_id(output)?;

    // Write the job id to the submission directory as a debug information
    std::fs::write(directory.join(JOBID_FILE_NAME), &job_id)?;

    Ok(job_id)
}

#[cfg(test)]
mod tests {
    use super::{check_command_output, create_submission_dir};
    use std::os::unix::process::ExitStatusExt;
    use std::process::{ExitStatus, Output};
    use tempfile::TempDir;

    #[test]
    fn submission_dir_is_numbered_per_site() {
        let root = TempDir::with_prefix("gridalloc").unwrap();
        let name = "cluster".to_string();
        let first = create_submission_dir(root.path().to_path_buf(), Some(&name), 1).unwrap();
        let second = create_submission_dir(root.path().to_path_buf(), Some(&name), 2).unwrap();
        assert!(first.ends_with("alloc/cluster/001"));
        assert!(second.ends_with("alloc/cluster/002"));
        assert!(first.is_dir());
        assert!(second.is_dir());
    }

    #[test]
    fn failed_command_attaches_diagnostics() {
        let output = Output {
            status: ExitStatus::from_raw(1 << 8),
            stdout: b"out".to_vec(),
            stderr: b"qsub: Unknown queue".to_vec(),
        };
        let error = check_command_output(output, "qsub").unwrap_err();
        let message = error.to_string();
        assert!(message.contains("qsub"));
        assert!(message.contains("exited with code 1"));
        assert!(message.contains("Unknown queue"));
    }
}
