use std::ffi::OsString;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;

use crate::command::diagnostic_excerpt;
use crate::compiler::render_arguments;
use crate::config::Config;
use crate::models::{Job, State};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("could not launch {program}: {source}")]
    EnvironmentUnavailable {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("transcoder exited with {status}")]
    ProcessingFailed { status: ExitStatus, diagnostic: String },

    #[error("transcoder reported success but wrote no output")]
    MissingOutput,

    #[error("transcoder did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("failed waiting for transcoder: {0}")]
    Io(#[from] io::Error),
}

impl JobError {
    pub fn is_environment(&self) -> bool {
        matches!(self, JobError::EnvironmentUnavailable { .. })
    }

    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            JobError::ProcessingFailed { diagnostic, .. } if !diagnostic.is_empty() => {
                Some(diagnostic)
            }
            _ => None,
        }
    }
}

/// Runs the transcoder once with `arguments` as discrete tokens, never through a shell.
///
/// The child is killed if this future is dropped, which covers both the timeout
/// and a client that goes away mid-request.
pub async fn run_ffmpeg(
    program: &str,
    arguments: &[OsString],
    output_path: &Path,
    timeout: Option<Duration>,
) -> Result<(), JobError> {
    let process = Command::new(program)
        .args(arguments)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| JobError::EnvironmentUnavailable {
            program: program.to_owned(),
            source,
        })?;

    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, process.wait_with_output())
            .await
            .map_err(|_| JobError::TimedOut(limit))??,
        None => process.wait_with_output().await?,
    };

    if !output.status.success() {
        return Err(JobError::ProcessingFailed {
            status: output.status,
            diagnostic: diagnostic_excerpt(&output.stderr),
        });
    }

    match tokio::fs::metadata(output_path).await {
        Ok(metadata) if metadata.is_file() => Ok(()),
        _ => Err(JobError::MissingOutput),
    }
}

fn log_failure(job: &Job, err: &JobError) {
    let id = job.id();
    let message = job.error_message.as_deref().unwrap_or_default();

    if err.is_environment() {
        log::error!("[{id}] processor: transcoder unavailable, check the installation: {message}");
        return;
    }

    match err.diagnostic() {
        Some(diagnostic) => log::error!("[{id}] processor: ended with error: {message}\n{diagnostic}"),
        None => log::error!("[{id}] processor: ended with error: {message}"),
    }
}

pub async fn process_job(job: &mut Job, config: &Config) -> Result<(), JobError> {
    let id = job.id();
    let arguments = render_arguments(&job.parameters, job.input.path(), job.output.path());

    job.state = State::Processing;

    log::info!("[{id}] processor: starting ffmpeg ({} bytes of input)", job.input_size);
    log::debug!("[{id}] processor: parameters {:?}", job.parameters);
    log::debug!("[{id}] processor: arguments {:?}", arguments);

    let result = run_ffmpeg(
        &config.ffmpeg_program,
        &arguments,
        job.output.path(),
        config.timeout.timeout_for(job.input_size),
    )
    .await;

    match &result {
        Ok(()) => job.state = State::Done,
        Err(err) => {
            job.state = State::Error;
            job.error_message = Some(err.to_string());
            log_failure(job, err);
        }
    }

    log::info!("[{id}] processor: finished as {:?}", job.state);

    result
}
