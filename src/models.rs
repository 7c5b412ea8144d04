use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::compiler::EffectParameters;

pub enum FileType {
    Input,
    Output,
}

/// Unique per job: creation time in milliseconds plus a random v4 uuid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobToken {
    pub id: Uuid,
    pub created_millis: u128,
}

impl JobToken {
    pub fn new() -> JobToken {
        let created_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();

        JobToken {
            id: Uuid::new_v4(),
            created_millis,
        }
    }
}

impl fmt::Display for JobToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.created_millis, self.id.simple())
    }
}

pub fn build_path(dir: &Path, token: &JobToken, file_type: FileType) -> PathBuf {
    match file_type {
        FileType::Input => dir.join(format!("upload-{token}")),
        FileType::Output => dir.join(format!("crushed-{token}.mp4")),
    }
}

/// Deletes a staged file. A file that is already gone counts as removed; other
/// failures are logged and swallowed.
pub fn remove_artifact(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => log::warn!("Failed to remove artifact {}: {}", path.display(), err),
    }
}

/// A staged file owned by one job, removed when the guard is dropped.
#[derive(Debug)]
pub struct Artifact {
    path: PathBuf,
}

impl Artifact {
    pub fn new(path: PathBuf) -> Artifact {
        Artifact { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Artifact {
    fn drop(&mut self) {
        remove_artifact(&self.path);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum State {
    Waiting,
    Processing,
    Done,
    Error,
}

#[derive(Debug)]
pub struct Job {
    pub token: JobToken,
    pub input: Artifact,
    pub output: Artifact,
    pub input_size: u64,
    pub parameters: EffectParameters,
    pub state: State,
    pub error_message: Option<String>,
}

impl Job {
    pub fn new(
        token: JobToken,
        input: Artifact,
        input_size: u64,
        output_dir: &Path,
        parameters: EffectParameters,
    ) -> Job {
        let output = Artifact::new(build_path(output_dir, &token, FileType::Output));

        Job {
            token,
            input,
            output,
            input_size,
            parameters,
            state: State::Waiting,
            error_message: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.token.id
    }

    /// Hands both guards to whoever delivers the output; they are deleted once that owner drops them.
    pub fn into_artifacts(self) -> (Artifact, Artifact) {
        (self.input, self.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_distinct() {
        let first = JobToken::new();
        let second = JobToken::new();

        assert_ne!(first, second);
        assert_ne!(first.to_string(), second.to_string());
    }

    #[test]
    fn paths_land_in_their_staging_dirs() {
        let token = JobToken::new();
        let input = build_path(Path::new("uploads"), &token, FileType::Input);
        let output = build_path(Path::new("outputs"), &token, FileType::Output);

        assert_eq!(input.parent(), Some(Path::new("uploads")));
        assert_eq!(output.parent(), Some(Path::new("outputs")));
        assert!(output.to_string_lossy().ends_with(".mp4"));
        assert!(output.to_string_lossy().contains(&token.to_string()));
    }

    #[test]
    fn artifact_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("staged");
        std::fs::write(&path, b"data").unwrap();

        drop(Artifact::new(path.clone()));

        assert!(!path.exists());
    }

    #[test]
    fn removing_twice_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("staged");
        std::fs::write(&path, b"data").unwrap();

        remove_artifact(&path);
        remove_artifact(&path);
        drop(Artifact::new(path.clone()));

        assert!(!path.exists());
    }

    #[test]
    fn job_output_shares_the_input_token() {
        let dir = tempfile::tempdir().unwrap();
        let token = JobToken::new();
        let input = Artifact::new(build_path(dir.path(), &token, FileType::Input));
        let job = Job::new(token.clone(), input, 0, dir.path(), EffectParameters::default());

        assert_eq!(job.state, State::Waiting);
        assert_eq!(job.id(), token.id);
        assert!(job.output.path().to_string_lossy().contains(&token.to_string()));
    }
}
