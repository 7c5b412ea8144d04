use std::process::{Output, Stdio};
use std::sync::OnceLock;

use regex::Regex;
use tokio::process::Command;

const EXCERPT_LINES: usize = 20;

fn io_err(message: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, message.to_string())
}

pub async fn run_command(
    executable: &str,
    arguments: &[&str],
    descriptor: &str,
) -> std::io::Result<Output> {
    let output = Command::new(executable)
        .args(arguments)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;

    if !output.status.success() {
        return match String::from_utf8(output.stderr) {
            Ok(text) => Err(io_err(&format!("{descriptor} failed\n\n{text}"))),
            Err(_) => Err(io_err(&format!(
                "{descriptor} failed and the output was not UTF-8"
            ))),
        };
    }

    Ok(output)
}

/// Whether the transcoder can be launched at all.
pub async fn check_available(executable: &str) -> std::io::Result<String> {
    let output = run_command(executable, &["-version"], executable).await?;
    let text = String::from_utf8_lossy(&output.stdout);

    Ok(text.lines().next().unwrap_or_default().to_owned())
}

fn noise_re() -> &'static Regex {
    static NOISE: OnceLock<Regex> = OnceLock::new();
    NOISE.get_or_init(|| {
        Regex::new(r"^\s*$|^\s*(frame=|size=|Press \[q\]|Last message repeated)").unwrap()
    })
}

/// The tail of the transcoder's stderr with progress chatter removed.
pub fn diagnostic_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text
        .lines()
        .map(|line| line.rsplit('\r').next().unwrap_or(line))
        .filter(|line| !noise_re().is_match(line))
        .collect();

    let start = lines.len().saturating_sub(EXCERPT_LINES);
    lines[start..].join("\n")
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excerpt_drops_progress_and_blank_lines() {
        let stderr = b"Input #0, mov\n\nframe=   10 fps=0.0 q=0.0 size=0kB\rframe=   20 fps=0.0\n\
            [h264 @ 0x1] error while decoding\nPress [q] to stop\nConversion failed!\n";

        assert_eq!(
            diagnostic_excerpt(stderr),
            "Input #0, mov\n[h264 @ 0x1] error while decoding\nConversion failed!"
        );
    }

    #[test]
    fn excerpt_keeps_only_the_tail() {
        let stderr: String = (0..50).map(|i| format!("line {i}\n")).collect();
        let excerpt = diagnostic_excerpt(stderr.as_bytes());

        assert_eq!(excerpt.lines().count(), EXCERPT_LINES);
        assert!(excerpt.starts_with("line 30"));
        assert!(excerpt.ends_with("line 49"));
    }

    #[test]
    fn excerpt_of_invalid_utf8_is_lossy() {
        assert_eq!(diagnostic_excerpt(b"bad \xff byte\n"), "bad \u{fffd} byte");
    }

    #[actix_web::test]
    async fn missing_executable_is_an_error() {
        assert!(check_available("framecrush-no-such-transcoder").await.is_err());
    }
}
