//! Runs generated job scripts under the toolkit interpreter.
//!
//! The toolkit's own bash binary is used, not the system shell: the core
//! function library relies on bash syntax. Exit code 0 only means the
//! script ran to completion; per-feature failures surface through the
//! checksum lines, not the exit code.

use crate::job::{Job, RUN_SCRIPT};
use crate::runtime::RuntimeEnvironment;
use crate::shell::{RootShell, Stream};
use anyhow::Result;
use std::sync::Arc;

pub type JobLineSink = Arc<dyn Fn(&str) + Send + Sync>;

pub async fn run(
    shell: &RootShell,
    env: &RuntimeEnvironment,
    job: &Job,
    on_line: JobLineSink,
) -> Result<i32> {
    let script = job.run_script();
    if !shell.file_exists(&script).await {
        on_line(&format!(
            "ERROR: {RUN_SCRIPT} not found in {}",
            job.dir.display()
        ));
        return Ok(1);
    }

    on_line(&format!("executing job {}", job.id));

    let cmd = format!(
        "\"{}\" \"{}\"",
        env.toolkit_bash().display(),
        script.display()
    );

    let sink = Arc::clone(&on_line);
    let code = shell
        .exec_streamed(
            &cmd,
            Arc::new(move |stream, line| match stream {
                Stream::Stdout => sink(line),
                Stream::Stderr => sink(&format!("[ERR] {line}")),
            }),
        )
        .await?;

    if code == 0 {
        on_line("job completed successfully");
    } else {
        on_line(&format!("job failed with exit code {code}"));
    }

    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_run_script_fails_without_spawning() {
        let base = TempDir::new().unwrap();
        let env = RuntimeEnvironment::rooted(base.path());
        let shell = RootShell::direct();
        let job = Job::create(&shell, &env).await.unwrap();

        let lines: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = Arc::clone(&lines);

        let code = run(
            &shell,
            &env,
            &job,
            Arc::new(move |line| sink.lock().unwrap().push(line.to_owned())),
        )
        .await
        .unwrap();

        assert_eq!(code, 1);
        let lines = lines.lock().unwrap();
        assert!(lines.iter().any(|line| line.contains("run.sh not found")));
    }
}
