//! Compile-then-execute orchestration producing one transcript per request.

use std::{path::Path, time::Duration};

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::{
    process::{CommandRunner, DEFAULT_TIMEOUT},
    toolchain::Registry,
};

pub const COMPILATION: &str = "COMPILATION";
pub const EXECUTION: &str = "EXECUTION";

const COMPILE_FAILED: &str = "Compilation failed!";
const EXECUTE_FAILED: &str = "Compilation successful, but execution failed!";
const SUCCEEDED: &str = "Compilation and execution successful!";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineResult {
    pub overall_success: bool,
    pub transcript: String,
}

impl PipelineResult {
    fn failure(transcript: String) -> Self {
        Self { overall_success: false, transcript }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StepTimeouts {
    pub compile: Duration,
    pub execute: Duration,
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self { compile: DEFAULT_TIMEOUT, execute: DEFAULT_TIMEOUT }
    }
}

/// `=== {STEP} OUTPUT ===` sections, in the order the steps ran.
#[derive(Debug, Default)]
struct Sections(Vec<String>);

impl Sections {
    fn push(&mut self, step: &str, output: &str) {
        if !output.trim().is_empty() {
            self.0.push(format!("=== {step} OUTPUT ===\n{output}"));
        }
    }

    fn joined(&self) -> String {
        self.0.join("\n\n")
    }
}

pub struct Pipeline<R> {
    registry: Registry,
    runner: R,
    timeouts: StepTimeouts,
}

impl<R: CommandRunner> Pipeline<R> {
    pub fn new(registry: Registry, runner: R, timeouts: StepTimeouts) -> Self {
        Self { registry, runner, timeouts }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// `Err` only when a command line cannot be built for `source`;
    /// every tool outcome is reported through the transcript.
    pub async fn handle(&self, source: &Path, extension: &str) -> Result<PipelineResult> {
        let Some(toolchain) = self.registry.lookup(extension) else {
            warn!(extension, "unsupported file type");
            return Ok(PipelineResult::failure(format!(
                "Unsupported file type: {extension}. Please configure the script."
            )));
        };
        debug!(path = %source.display(), extension, "resolved toolchain");

        let mut sections = Sections::default();

        let compile = toolchain.compile_command(source)?;
        let compiled = self.runner.run(&compile, COMPILATION, self.timeouts.compile).await;
        sections.push(COMPILATION, &compiled.combined_output);

        if !compiled.success {
            info!("compilation failed");
            let transcript = if compiled.combined_output.is_empty() {
                COMPILE_FAILED.to_string()
            } else {
                format!("{COMPILE_FAILED}\n{}", compiled.combined_output)
            };
            return Ok(PipelineResult::failure(transcript));
        }

        if let Some(execute) = toolchain.execute_command(source) {
            let execute = execute?;
            let executed = self.runner.run(&execute, EXECUTION, self.timeouts.execute).await;
            sections.push(EXECUTION, &executed.combined_output);

            if !executed.success {
                info!("execution failed");
                return Ok(PipelineResult::failure(format!(
                    "{EXECUTE_FAILED}\n{}",
                    sections.joined()
                )));
            }
        }

        info!("compilation and execution succeeded");
        let transcript = if sections.0.is_empty() {
            SUCCEEDED.to_string()
        } else {
            format!("{SUCCEEDED}\n\n{}", sections.joined())
        };
        Ok(PipelineResult { overall_success: true, transcript })
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        process::{CommandResult, RunFailure},
        toolchain::ToolchainEntry,
    };

    /// Replays scripted results and records every call.
    #[derive(Default)]
    struct SpyRunner {
        script: Mutex<VecDeque<CommandResult>>,
        calls: Mutex<Vec<(Vec<String>, String)>>,
    }

    impl SpyRunner {
        fn scripted(results: impl IntoIterator<Item = CommandResult>) -> Self {
            Self { script: Mutex::new(results.into_iter().collect()), ..Default::default() }
        }

        fn labels(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|(_, l)| l.clone()).collect()
        }
    }

    #[async_trait]
    impl CommandRunner for SpyRunner {
        async fn run(&self, argv: &[String], label: &str, _timeout: Duration) -> CommandResult {
            self.calls.lock().unwrap().push((argv.to_vec(), label.to_string()));
            self.script.lock().unwrap().pop_front().expect("unscripted call")
        }
    }

    fn ok(out: &str) -> CommandResult {
        CommandResult::succeeded(out.to_string())
    }

    fn exit1(out: &str) -> CommandResult {
        CommandResult::failed(RunFailure::Exited { code: Some(1) }, out.to_string())
    }

    fn pipeline(spy: SpyRunner) -> Pipeline<SpyRunner> {
        Pipeline::new(Registry::builtin(), spy, StepTimeouts::default())
    }

    async fn run(spy: SpyRunner, ext: &str) -> (PipelineResult, Vec<String>) {
        let pipeline = pipeline(spy);
        let result = pipeline.handle(Path::new("/tmp/job/Main.kt"), ext).await.unwrap();
        (result, pipeline.runner().labels())
    }

    #[tokio::test]
    async fn unsupported_extension_spawns_nothing() {
        let (result, labels) = run(SpyRunner::default(), ".txt").await;
        assert!(!result.overall_success);
        assert_eq!(result.transcript, "Unsupported file type: .txt. Please configure the script.");
        assert!(labels.is_empty());
    }

    #[tokio::test]
    async fn compile_failure_stops_before_execution() {
        let spy = SpyRunner::scripted([exit1("Main.kt:2:5: error: expecting ')'")]);
        let (result, labels) = run(spy, ".kt").await;
        assert!(!result.overall_success);
        assert_eq!(result.transcript, "Compilation failed!\nMain.kt:2:5: error: expecting ')'");
        assert_eq!(labels, ["COMPILATION"]);
    }

    #[tokio::test]
    async fn silent_compile_failure_is_just_the_verdict() {
        let (result, _) = run(SpyRunner::scripted([exit1("")]), ".kt").await;
        assert_eq!(result.transcript, "Compilation failed!");
    }

    #[tokio::test]
    async fn execution_failure_carries_all_sections() {
        let spy = SpyRunner::scripted([ok("warning: unused"), exit1("Exception in thread main")]);
        let (result, labels) = run(spy, ".kt").await;
        assert!(!result.overall_success);
        assert_eq!(
            result.transcript,
            "Compilation successful, but execution failed!\n\
             === COMPILATION OUTPUT ===\nwarning: unused\n\n\
             === EXECUTION OUTPUT ===\nException in thread main"
        );
        assert_eq!(labels, ["COMPILATION", "EXECUTION"]);
    }

    #[tokio::test]
    async fn success_lists_only_non_empty_sections() {
        let (result, _) = run(SpyRunner::scripted([ok(""), ok("hello\n")]), ".kt").await;
        assert!(result.overall_success);
        assert_eq!(
            result.transcript,
            "Compilation and execution successful!\n\n=== EXECUTION OUTPUT ===\nhello\n"
        );
    }

    #[tokio::test]
    async fn success_without_output_is_just_the_verdict() {
        let (result, _) = run(SpyRunner::scripted([ok("  \n"), ok("")]), ".py").await;
        assert!(result.overall_success);
        assert_eq!(result.transcript, "Compilation and execution successful!");
    }

    #[tokio::test]
    async fn commands_come_from_the_registry() {
        let pipeline = pipeline(SpyRunner::scripted([ok(""), ok("")]));
        pipeline.handle(Path::new("/tmp/job/a.py"), ".py").await.unwrap();
        let calls = pipeline.runner().calls.lock().unwrap();
        assert_eq!(calls[0].0, ["python3", "-m", "py_compile", "/tmp/job/a.py"]);
        assert_eq!(calls[1].0, ["python3", "/tmp/job/a.py"]);
    }

    #[tokio::test]
    async fn check_only_toolchain_succeeds_after_compile() {
        let registry = Registry::new([ToolchainEntry {
            extension: ".chk",
            compile: |p| Ok(vec!["check".into(), p.display().to_string()]),
            execute: None,
            description: "check only",
        }]);
        let pipeline = Pipeline::new(registry, SpyRunner::scripted([ok("ok")]), StepTimeouts::default());
        let result = pipeline.handle(Path::new("a.chk"), ".chk").await.unwrap();
        assert!(result.overall_success);
        assert_eq!(
            result.transcript,
            "Compilation and execution successful!\n\n=== COMPILATION OUTPUT ===\nok"
        );
        assert_eq!(pipeline.runner().labels(), ["COMPILATION"]);
    }
}
