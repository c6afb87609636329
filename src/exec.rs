use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Instant;

use tracing::{debug, error, info};

use crate::env::Env;
use crate::error::{Error, IoContext, Result};

/// Runs a tool to completion and returns its stdout.
///
/// A nonzero exit becomes [`Error::Tool`] carrying the binary, argument
/// vector, exit status, and the combined stdout+stderr capture.
pub(crate) fn run_tool(env: &Env, bin: &Path, args: &[&str]) -> Result<String> {
    debug!(
        target: "avdpool",
        correlation_id = %env.correlation_id.as_deref().unwrap_or(""),
        "run_tool: executing {} {:?}",
        bin.display(),
        args
    );
    let started = Instant::now();
    let output = Command::new(bin)
        .args(args)
        .output()
        .io_context(|| format!("launching {} {:?}", bin.display(), args))?;
    let elapsed = started.elapsed();
    debug!(
        target: "avdpool",
        "run_tool: {} {:?} completed in {:?} with {}",
        bin.display(),
        args,
        elapsed,
        output.status
    );

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        let mut combined = stdout;
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        error!(
            target: "avdpool",
            "run_tool: {} {:?} failed with {} after {:?}",
            bin.display(),
            args,
            output.status,
            elapsed
        );
        return Err(Error::Tool {
            bin: bin.display().to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            status: output.status,
            output: combined,
        });
    }
    Ok(stdout)
}

/// Like [`run_tool`], but feeds `input` to the child's stdin first. Used
/// for tools that insist on an interactive answer.
pub(crate) fn run_tool_with_stdin(
    env: &Env,
    bin: &Path,
    args: &[&str],
    input: &str,
) -> Result<String> {
    debug!(
        target: "avdpool",
        correlation_id = %env.correlation_id.as_deref().unwrap_or(""),
        "run_tool_with_stdin: executing {} {:?}",
        bin.display(),
        args
    );
    let mut child = Command::new(bin)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .io_context(|| format!("launching {} {:?}", bin.display(), args))?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(input.as_bytes());
    }

    let output = child
        .wait_with_output()
        .io_context(|| format!("waiting for {} {:?}", bin.display(), args))?;
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        let mut combined = stdout;
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(Error::Tool {
            bin: bin.display().to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            status: output.status,
            output: combined,
        });
    }
    Ok(stdout)
}

/// Starts a child whose stdout and stderr are each teed into `log_file`
/// and forwarded line-by-line into the structured log stream.
///
/// The forwarder threads drain until the child closes its pipes; the
/// returned handle is never awaited here.
pub(crate) fn spawn_streamed(
    env: &Env,
    bin: &Path,
    args: &[String],
    envs: &[(&str, &str)],
    log_file: File,
) -> Result<Child> {
    let mut cmd = Command::new(bin);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in envs {
        cmd.env(key, value);
    }

    let mut child = cmd
        .spawn()
        .io_context(|| format!("launching {} {:?}", bin.display(), args))?;

    let command = bin.display().to_string();
    let rendered_args = args.join(" ");
    let correlation_id = env.correlation_id.clone().unwrap_or_default();

    if let Some(stdout) = child.stdout.take() {
        let file = log_file
            .try_clone()
            .io_context(|| "cloning log file for stdout".to_string())?;
        spawn_forwarder(
            stdout,
            file,
            command.clone(),
            rendered_args.clone(),
            correlation_id.clone(),
            "stdout",
        );
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_forwarder(
            stderr,
            log_file,
            command,
            rendered_args,
            correlation_id,
            "stderr",
        );
    }

    Ok(child)
}

fn spawn_forwarder<R: Read + Send + 'static>(
    stream: R,
    mut file: File,
    command: String,
    args: String,
    correlation_id: String,
    stream_name: &'static str,
) {
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            let _ = writeln!(file, "{line}");
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            info!(
                target: "avdpool",
                command = %command,
                args = %args,
                stream = stream_name,
                line = %trimmed,
                correlation_id = %correlation_id,
                "tool output"
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_env;
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn run_tool_returns_stdout() {
        let dir = TempDir::new().unwrap();
        let env = test_env(dir.path());
        let out = run_tool(&env, &PathBuf::from("/bin/sh"), &["-c", "echo hi"]).unwrap();
        assert_eq!(out, "hi\n");
    }

    #[test]
    fn run_tool_failure_carries_invocation_and_output() {
        let dir = TempDir::new().unwrap();
        let env = test_env(dir.path());
        let err = run_tool(
            &env,
            &PathBuf::from("/bin/sh"),
            &["-c", "echo boom >&2; exit 3"],
        )
        .unwrap_err();
        match err {
            Error::Tool {
                bin,
                args,
                status,
                output,
            } => {
                assert_eq!(bin, "/bin/sh");
                assert_eq!(args.len(), 2);
                assert_eq!(status.code(), Some(3));
                assert!(output.contains("boom"));
            }
            other => panic!("expected tool error, got {other:?}"),
        }
    }

    #[test]
    fn run_tool_with_stdin_feeds_the_child() {
        let dir = TempDir::new().unwrap();
        let env = test_env(dir.path());
        let out = run_tool_with_stdin(&env, &PathBuf::from("/bin/sh"), &["-c", "cat"], "no\n")
            .unwrap();
        assert_eq!(out, "no\n");
    }

    #[test]
    fn spawn_streamed_tees_lines_into_the_log_file() {
        let dir = TempDir::new().unwrap();
        let env = test_env(dir.path());
        let log_path = dir.path().join("tool.log");
        let log_file = File::create(&log_path).unwrap();

        let args = vec![
            "-c".to_string(),
            "echo first; echo second >&2".to_string(),
        ];
        let mut child =
            spawn_streamed(&env, &PathBuf::from("/bin/sh"), &args, &[], log_file).unwrap();
        child.wait().unwrap();

        // Forwarder threads may still be flushing after the child exits.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let content = fs::read_to_string(&log_path).unwrap();
            if content.contains("first") && content.contains("second") {
                break;
            }
            if Instant::now() >= deadline {
                panic!("log file never received both streams: {content:?}");
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
}
