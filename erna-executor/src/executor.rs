//! Running one job on a compute node.

use flate2::{write::GzEncoder, Compression};
use md5::{Digest, Md5};
use std::{
    env, fs, io,
    time::{Duration, Instant},
};
use tokio::process::Command;

use erna_common::{
    cluster::vars,
    prelude::*,
    status::{StatusReport, StatusReporter},
    tracing,
};

/// How much of the walltime we leave unused, so we can report back before
/// the scheduler kills us.
pub const SAFETY_MARGIN: Duration = Duration::from_secs(5 * 60);

/// The JVM options we run the tool with.
const JVM_OPTIONS: &[&str] = &[
    "-XX:MaxHeapSize=1024m",
    "-XX:InitialHeapSize=512m",
    "-XX:CompressedClassSpaceSize=64m",
    "-XX:MaxMetaspaceSize=128m",
];

/// Everything the submitter told us about our job.
#[derive(Clone, Debug, PartialEq)]
pub struct JobParams {
    /// The job we're running.
    pub job_id: i32,
    /// The jar to run.
    pub jar: PathBuf,
    /// The XML to run it with.
    pub xml: PathBuf,
    /// The raw data file to process.
    pub input: PathBuf,
    /// The DRS file to calibrate with.
    pub drs: PathBuf,
    /// The auxiliary data of the night.
    pub aux_dir: PathBuf,
    /// Where the output goes.
    pub output_dir: PathBuf,
    /// The output file name without extension.
    pub output_basename: String,
    /// Our walltime, as requested from the scheduler.
    pub walltime: Duration,
    /// Where the job monitor is listening.
    pub monitor_host: String,
    /// The port of the job monitor.
    pub monitor_port: u16,
    /// The java binary.
    pub java_bin: PathBuf,
    /// Extra `-D<key>=<value>` properties for the tool.
    pub tool_properties: Vec<(String, String)>,
}

impl JobParams {
    /// Read our parameters from the environment.
    pub fn from_env() -> Result<JobParams> {
        JobParams::from_vars(env::vars().collect())
    }

    /// Read our parameters from `vars`.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<JobParams> {
        let get = |name: &str| -> Result<&str> {
            vars.get(name)
                .map(|value| value.as_str())
                .ok_or_else(|| format_err!("environment variable {} is not set", name))
        };
        let parse_err = |name: &str| format!("could not parse {}", name);

        let walltime_minutes = get(vars::WALLTIME)?
            .parse::<u64>()
            .with_context(|| parse_err(vars::WALLTIME))?;
        let mut tool_properties = vars
            .iter()
            .filter_map(|(key, value)| {
                let key = key.strip_prefix(vars::TOOL_PROPERTY_PREFIX)?;
                Some((key.to_owned(), value.clone()))
            })
            .collect::<Vec<_>>();
        tool_properties.sort();

        Ok(JobParams {
            job_id: get(vars::JOB_ID)?
                .parse()
                .with_context(|| parse_err(vars::JOB_ID))?,
            jar: PathBuf::from(get(vars::JARFILE)?),
            xml: PathBuf::from(get(vars::XMLFILE)?),
            input: PathBuf::from(get(vars::INPUTFILE)?),
            drs: PathBuf::from(get(vars::DRSFILE)?),
            aux_dir: PathBuf::from(get(vars::AUXDIR)?),
            output_dir: PathBuf::from(get(vars::OUTPUTDIR)?),
            output_basename: get(vars::OUTPUT_BASENAME)?.to_owned(),
            walltime: Duration::from_secs(walltime_minutes * 60),
            monitor_host: get(vars::SUBMITTER_HOST)?.to_owned(),
            monitor_port: get(vars::SUBMITTER_PORT)?
                .parse()
                .with_context(|| parse_err(vars::SUBMITTER_PORT))?,
            java_bin: PathBuf::from(vars.get(vars::JAVA_BIN).map_or("java", |java| java.as_str())),
            tool_properties,
        })
    }

    /// The final location of our output.
    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.json.gz", self.output_basename))
    }
}

/// How to start the processing tool. The jar, the XML and the `-D`
/// properties are appended to `prefix_args`.
#[derive(Clone, Debug)]
pub struct ToolInvocation {
    /// The program to run.
    pub program: PathBuf,
    /// Arguments to put before the jar.
    pub prefix_args: Vec<String>,
}

impl ToolInvocation {
    /// Run the jar with `java_bin`.
    pub fn java(java_bin: PathBuf) -> Self {
        let mut prefix_args = JVM_OPTIONS.iter().map(|opt| opt.to_string()).collect::<Vec<_>>();
        prefix_args.push("-jar".to_owned());
        ToolInvocation {
            program: java_bin,
            prefix_args,
        }
    }

    /// Build the command processing `params`, writing to `output`.
    fn command(&self, params: &JobParams, output: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.prefix_args)
            .arg(&params.jar)
            .arg(&params.xml)
            .arg(format!("-Dinfile=file:{}", params.input.display()))
            .arg(format!("-Ddrsfile=file:{}", params.drs.display()))
            .arg(format!("-Daux_dir=file:{}", params.aux_dir.display()))
            .arg(format!("-Doutput=file:{}", output.display()));
        for (key, value) in &params.tool_properties {
            cmd.arg(format!("-D{}={}", key, value));
        }
        cmd
    }
}

/// Runs a job and reports on it.
pub struct Executor<R> {
    reporter: R,
    tool: ToolInvocation,
    started: Instant,
    safety_margin: Duration,
}

impl<R: StatusReporter> Executor<R> {
    /// Create an executor for a process started at `started`.
    pub fn new(reporter: R, tool: ToolInvocation, started: Instant) -> Self {
        Executor {
            reporter,
            tool,
            started,
            safety_margin: SAFETY_MARGIN,
        }
    }

    /// Leave `safety_margin` of the walltime unused.
    #[cfg(test)]
    pub fn with_safety_margin(mut self, safety_margin: Duration) -> Self {
        self.safety_margin = safety_margin;
        self
    }

    /// Run the job described by `params` from start to finish, and return
    /// the status we reported. Errors mean we couldn't report.
    #[tracing::instrument(skip_all, fields(job_id = params.job_id))]
    pub async fn run(&self, params: &JobParams) -> Result<ProcessingState> {
        self.reporter
            .report(&StatusReport::new(params.job_id, ProcessingState::Running))
            .await?;
        let report = self.execute(params).await;
        info!("job {} finished as {}", params.job_id, report.status);
        self.reporter.report(&report).await?;
        Ok(report.status)
    }

    /// Do the actual work.
    async fn execute(&self, params: &JobParams) -> StatusReport {
        let failed = |status: ProcessingState| StatusReport::new(params.job_id, status);

        for input in [&params.input, &params.drs] {
            if !input.is_file() {
                error!("input file {} does not exist", input.display());
                return failed(ProcessingState::InputFileMissing);
            }
        }

        let budget = match self.time_budget(params.walltime) {
            Some(budget) => budget,
            None => {
                error!("no time left to run the tool");
                return failed(ProcessingState::WalltimeExceeded);
            }
        };

        let tmp = match tempfile::tempdir() {
            Ok(tmp) => tmp,
            Err(err) => {
                error!("could not create temporary directory: {}", err);
                return failed(ProcessingState::Failed);
            }
        };
        let tool_output = tmp.path().join(format!("{}.json", params.output_basename));

        let mut cmd = self.tool.command(params, &tool_output);
        cmd.current_dir(tmp.path()).kill_on_drop(true);
        debug!("running {:?} with a time budget of {:?}", cmd, budget);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                error!("could not start {}: {}", self.tool.program.display(), err);
                return failed(ProcessingState::Failed);
            }
        };

        let waited = tokio::time::timeout(budget, child.wait()).await;
        match waited {
            Err(_) => {
                warn!("tool ran out of time after {:?}, killing it", budget);
                if let Err(err) = child.kill().await {
                    warn!("could not kill tool: {}", err);
                }
                failed(ProcessingState::WalltimeExceeded)
            }
            Ok(Err(err)) => {
                error!("error waiting for tool: {}", err);
                failed(ProcessingState::Failed)
            }
            Ok(Ok(status)) if !status.success() => {
                error!("tool failed with {}", status);
                failed(ProcessingState::Failed)
            }
            Ok(Ok(_)) => {
                let tmp_dir = tmp.path().to_owned();
                let output_path = params.output_path();
                let relocated =
                    tokio::task::spawn_blocking(move || relocate_output(&tmp_dir, &output_path))
                        .await;
                match relocated {
                    Ok(Ok((path, checksum))) => StatusReport::success(
                        params.job_id,
                        path.display().to_string(),
                        checksum,
                    ),
                    Ok(Err(err)) => {
                        error!("could not store output: {}", err.display_causes());
                        failed(ProcessingState::Failed)
                    }
                    Err(err) => {
                        error!("output relocation panicked: {}", err);
                        failed(ProcessingState::Failed)
                    }
                }
            }
        }
    }

    /// The time left for the tool: the walltime minus what we've used so
    /// far and our safety margin.
    fn time_budget(&self, walltime: Duration) -> Option<Duration> {
        walltime
            .checked_sub(self.started.elapsed())?
            .checked_sub(self.safety_margin)
            .filter(|budget| !budget.is_zero())
    }
}

/// Find the tool's output in `tmp_dir`, compress it to `output_path`, and
/// return the final path and its MD5 checksum.
fn relocate_output(tmp_dir: &Path, output_path: &Path) -> Result<(PathBuf, String)> {
    let pattern = glob::Pattern::escape(&tmp_dir.display().to_string()) + "/*.json";
    let mut outputs = glob::glob(&pattern)
        .with_context(|| format!("could not list {}", tmp_dir.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("could not list {}", tmp_dir.display()))?;
    let tool_output = match outputs.len() {
        0 => return Err(format_err!("tool produced no output in {}", tmp_dir.display())),
        1 => outputs.remove(0),
        n => return Err(format_err!("tool produced {} outputs, expected one", n)),
    };

    let output_dir = output_path
        .parent()
        .ok_or_else(|| format_err!("{} has no parent directory", output_path.display()))?;
    fs::create_dir_all(output_dir)
        .with_context(|| format!("could not create {}", output_dir.display()))?;

    let mut input = File::open(&tool_output)
        .with_context(|| format!("could not open {}", tool_output.display()))?;
    let tmp = tempfile::NamedTempFile::new_in(output_dir)
        .with_context(|| format!("could not create temporary file in {}", output_dir.display()))?;
    let mut encoder = GzEncoder::new(tmp, Compression::default());
    io::copy(&mut input, &mut encoder)
        .with_context(|| format!("could not compress {}", tool_output.display()))?;
    let tmp = encoder
        .finish()
        .with_context(|| format!("could not compress {}", tool_output.display()))?;
    tmp.persist(output_path)
        .with_context(|| format!("could not move output to {}", output_path.display()))?;

    let checksum = md5_file(output_path)?;
    info!("stored output at {} (md5 {})", output_path.display(), checksum);
    Ok((output_path.to_owned(), checksum))
}

/// The hex MD5 checksum of the file at `path`.
fn md5_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("could not open {}", path.display()))?;
    let mut hasher = Md5::new();
    io::copy(&mut file, &mut hasher).with_context(|| format!("could not read {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}
