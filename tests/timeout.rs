//! Timeout Integration Tests
//!
//! Stage runs through the real process executor, including the grace-kill
//! timeout policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metapipe::adapters::{KillPolicy, ProcessExecutor};
use metapipe::core::{PipelineError, StageRunner};
use metapipe::domain::{Invocation, StageDescriptor, Step, ToolCommand};
use tempfile::TempDir;

fn shell_stage(script: &str, output: std::path::PathBuf) -> StageDescriptor {
    let mut stage = StageDescriptor::new("checkm", Step::QualityAssess, "CheckM");
    stage.outputs = vec![output];
    stage.invocations = vec![Invocation::Single(ToolCommand::new("sh").arg("-c").arg(script))];
    stage
}

#[tokio::test]
async fn test_real_process_output_is_verified() {
    let temp = TempDir::new().unwrap();
    let output = temp.path().join("report.tsv");
    let stage = shell_stage(&format!("printf 'bin.1\\t98.5\\n' > '{}'", output.display()), output.clone());

    let runner = StageRunner::new(Arc::new(ProcessExecutor::new()), None);
    let result = runner.run(&stage).await.unwrap();

    assert_eq!(result.exit_status, 0);
    assert!(result.outputs_produced.contains(&output));
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "bin.1\t98.5\n");
}

#[tokio::test]
async fn test_stage_timeout_kills_tool() {
    let temp = TempDir::new().unwrap();
    let mut stage = StageDescriptor::new("assemble", Step::Assemble, "MEGAHIT");
    stage.outputs = vec![temp.path().join("final.contigs.fa")];
    stage.invocations = vec![Invocation::Single(ToolCommand::new("sleep").arg("30"))];

    let policy = KillPolicy {
        timeout: Duration::from_millis(200),
        grace: Duration::from_millis(200),
    };
    let runner = StageRunner::new(Arc::new(ProcessExecutor::new()), Some(policy));

    let started = Instant::now();
    let err = runner.run(&stage).await.unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(10));
    match err {
        PipelineError::ToolExecution { ref detail, .. } => assert!(detail.contains("timed out")),
        other => panic!("expected tool failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stderr_tail_reaches_error() {
    let temp = TempDir::new().unwrap();
    let stage = shell_stage("echo 'Error: no bins found' >&2; exit 2", temp.path().join("x"));

    let runner = StageRunner::new(Arc::new(ProcessExecutor::new()), None);
    let err = runner.run(&stage).await.unwrap_err();

    assert!(matches!(err, PipelineError::ToolExecution { exit_code: Some(2), .. }));
    assert!(err.to_string().contains("no bins found"));
}
