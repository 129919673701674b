//! Top-level sequencing of static and dynamic analysis.
//!
//! The orchestrator copies the sample into the working directory, picks
//! the sandbox architecture from its ELF header, drives one
//! [`DetonationPipeline`] through startup/run/shutdown, and assembles
//! the final [`Report`]. A Ctrl-C during the detonation is caught,
//! shutdown still runs, and the interruption is re-raised to the caller.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::analysis::{dns, syscalls};
use crate::arch::{detect_elf_arch, Arch};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::pipeline::{DetonationPipeline, DetonationResult};
use crate::report::{trace_pid, DynamicReport, Report};
use crate::static_analysis::StaticAnalyzer;

/// Which analysis stages to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisMode {
    Full,
    Static,
    Dynamic,
}

/// Drives the analysis of one sample end to end.
pub struct Orchestrator {
    config: Config,
    working_dir: PathBuf,
    output_dir: PathBuf,
}

impl Orchestrator {
    /// Build an orchestrator, creating the working and output
    /// directories if needed.
    pub fn new(config: Config) -> Result<Self> {
        let working_dir = match &config.general.working_dir {
            Some(dir) => dir.clone(),
            None => default_working_dir()?,
        };
        std::fs::create_dir_all(&working_dir)?;

        let output_dir = match &config.general.output_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?.join("output"),
        };
        std::fs::create_dir_all(&output_dir)?;

        Ok(Self {
            config,
            working_dir,
            output_dir,
        })
    }

    /// Run the requested stages against `sample` and assemble the report.
    pub async fn run(&self, sample: &Path, mode: AnalysisMode) -> Result<Report> {
        let sample = sample
            .canonicalize()
            .map_err(|e| Error::Config(format!("{}: {e}", sample.display())))?;
        let name = sample
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Config(format!("unusable sample name: {}", sample.display())))?
            .to_string();

        let mut report = Report::new(&name);

        if mode != AnalysisMode::Dynamic {
            info!("running static analysis");
            let analyzer = StaticAnalyzer::new(&self.config.static_analysis.hash_type);
            report.static_analysis = Some(analyzer.analyze(&sample)?);
        }

        if mode != AnalysisMode::Static {
            let result = self.run_dynamic(&sample, &name).await?;
            report.dynamic = Some(self.assemble_dynamic(result));
        }

        Ok(report)
    }

    /// Detonate the sample and return the collected artifacts.
    ///
    /// The detonation runs with the working directory as the process
    /// current directory so retrieved artifacts land there; the
    /// invocation directory is restored on every exit path so a later
    /// sample given as a relative path still resolves correctly.
    pub async fn run_dynamic(&self, sample: &Path, name: &str) -> Result<DetonationResult> {
        let data = std::fs::read(sample)?;
        let arch = detect_elf_arch(&data)?;
        info!(%arch, "sample architecture detected");

        std::fs::copy(sample, self.working_dir.join(name))?;

        let invocation_dir = std::env::current_dir()?;
        std::env::set_current_dir(&self.working_dir)?;

        let result = self.detonate(name, arch).await;

        if let Err(e) = std::env::set_current_dir(&invocation_dir) {
            warn!(
                "could not restore invocation directory {}: {e}",
                invocation_dir.display()
            );
        }

        result
    }

    async fn detonate(&self, name: &str, arch: Arch) -> Result<DetonationResult> {
        let mut pipeline = DetonationPipeline::new(&self.config, arch)?;

        let result = tokio::select! {
            res = async {
                pipeline.startup().await?;
                pipeline.run(name).await
            } => res,
            _ = tokio::signal::ctrl_c() => {
                warn!("received Ctrl-C, aborting detonation");
                Err(Error::Interrupted)
            }
        };

        // Shutdown is the error-path handler too; a startup that failed
        // has already released its resources and this is a no-op then.
        pipeline.shutdown().await;

        result
    }

    // Parse the retrieved artifacts into the dynamic report section.
    fn assemble_dynamic(&self, result: DetonationResult) -> DynamicReport {
        let mut syscalls_by_pid = BTreeMap::new();
        for trace in &result.syscalls {
            let pid = trace_pid(trace).unwrap_or("0").to_string();
            match syscalls::parse_trace_file(&self.working_dir.join(trace)) {
                Ok(calls) => {
                    syscalls_by_pid.insert(pid, calls);
                }
                Err(e) => warn!(trace, "could not parse syscall trace: {e}"),
            }
        }

        let dns_requests = dns::parse_dns_log(&result.dns_log);

        DynamicReport {
            detonation: result,
            dns_requests,
            syscalls_by_pid,
        }
    }

    /// Write the report JSON into the output directory and return its
    /// path.
    pub fn write_report(&self, report: &Report) -> Result<PathBuf> {
        let path = self.output_dir.join(format!("{}.report.json", report.sample));
        std::fs::write(&path, report.to_json()?)?;
        Ok(path)
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }
}

fn default_working_dir() -> Result<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
        return Ok(PathBuf::from(xdg).join("cinderbox"));
    }
    let home = std::env::var("HOME")
        .map_err(|_| Error::Config("cannot pick a working directory: HOME not set".into()))?;
    Ok(PathBuf::from(home).join(".cache/cinderbox"))
}
