//! Our configuration file.

use std::{env, net::IpAddr, time::Duration};

use crate::paths::Layout;
use crate::prelude::*;

/// The environment variable pointing at our config file.
pub const CONFIG_ENV_VAR: &str = "ERNA_CONFIG";

/// The config file we look for in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "erna.yaml";

/// Everything we read from `erna.yaml`.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where to find the job store. `DATABASE_URL` takes precedence.
    #[serde(default)]
    pub database_url: Option<String>,
    /// Settings for the job submitter.
    #[serde(default)]
    pub submitter: SubmitterConfig,
    /// Settings for the job monitor.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// How to talk to the cluster scheduler.
    pub cluster: ClusterConfig,
    /// Where our files live.
    pub paths: Layout,
    /// What to do with our cluster jobs when the orchestrator stops.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

impl Config {
    /// Load our config from `path`, or from `$ERNA_CONFIG`, or from
    /// `./erna.yaml`, whichever we find first.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let path = match path {
            Some(path) => path.to_owned(),
            None => match env::var_os(CONFIG_ENV_VAR) {
                Some(path) => PathBuf::from(path),
                None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                    PathBuf::from(DEFAULT_CONFIG_FILE)
                }
                None => {
                    return Err(format_err!(
                        "no config file given, {} is not set and there is no ./{}",
                        CONFIG_ENV_VAR,
                        DEFAULT_CONFIG_FILE,
                    ))
                }
            },
        };
        debug!("loading config from {}", path.display());
        let yaml = std::fs::read_to_string(&path)
            .with_context(|| format!("could not read {}", path.display()))?;
        Config::from_yaml(&yaml).with_context(|| format!("could not parse {}", path.display()))
    }

    /// Parse a config from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Config> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// The database URL to use.
    pub fn database_url(&self) -> Result<String> {
        crate::db::database_url(self.database_url.as_deref())
    }

    /// Open the job store.
    pub fn open_store(&self) -> Result<Store> {
        Store::open(&self.database_url()?)
    }
}

/// Settings for the job submitter.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SubmitterConfig {
    /// How long to sleep between two polls.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// How many of our jobs may wait in the cluster queue at once.
    pub max_queued_jobs: usize,
    /// How long to keep retrying a job's status change when the store is
    /// busy.
    #[serde(with = "humantime_serde")]
    pub retry_max_elapsed: Duration,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        SubmitterConfig {
            interval: Duration::from_secs(30),
            max_queued_jobs: 100,
            retry_max_elapsed: Duration::from_secs(10),
        }
    }
}

/// Settings for the job monitor.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// The host name executors use to reach us.
    pub host: String,
    /// The address we listen on.
    pub bind: IpAddr,
    /// The port we listen on.
    pub port: u16,
    /// How long to keep retrying a status update when the store is busy.
    #[serde(with = "humantime_serde")]
    pub retry_max_elapsed: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            host: "localhost".to_owned(),
            bind: IpAddr::from([0, 0, 0, 0]),
            port: 12700,
            retry_max_elapsed: Duration::from_secs(10),
        }
    }
}

/// Which cluster scheduler we submit to.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// SLURM: `sbatch`, `squeue` and `scancel`.
    Slurm,
    /// Grid Engine: `qsub`, `qstat` and `qdel`.
    GridEngine,
    /// Run executors as child processes of the orchestrator.
    Local,
}

/// How to talk to the cluster scheduler.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Which scheduler to use.
    pub backend: Backend,
    /// The queue or partition to submit to.
    #[serde(default)]
    pub queue: Option<String>,
    /// Where the scheduler should send mail.
    #[serde(default)]
    pub mail_address: Option<String>,
    /// When the scheduler should send mail.
    #[serde(default = "default_mail_type")]
    pub mail_type: String,
    /// The node executor binary, as seen from the compute nodes.
    #[serde(default = "default_executable")]
    pub executable: PathBuf,
    /// Our jobs are called `<job_prefix>_<job id>`.
    #[serde(default = "default_job_prefix")]
    pub job_prefix: String,
    /// The user whose jobs we list. Defaults to `$USER`.
    #[serde(default)]
    pub user: Option<String>,
    /// Extra arguments passed to the submit command.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Extra environment variables for the executor, such as `JAVA_BIN` or
    /// `facttools_*` properties.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// How many executors the `local` backend runs at once. Defaults to the
    /// number of CPUs.
    #[serde(default)]
    pub local_slots: Option<usize>,
}

impl ClusterConfig {
    /// The user whose jobs we list.
    pub fn user(&self) -> Result<String> {
        match &self.user {
            Some(user) => Ok(user.clone()),
            None => env::var("USER").context("cluster.user is not configured and USER is not set"),
        }
    }
}

fn default_mail_type() -> String {
    "FAIL".to_owned()
}

fn default_executable() -> PathBuf {
    PathBuf::from("erna-executor")
}

fn default_job_prefix() -> String {
    "erna".to_owned()
}

/// What to do with our cluster jobs when the orchestrator stops.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShutdownConfig {
    /// Cancel running jobs too, instead of waiting for them to finish.
    pub cancel_running: bool,
    /// How often to ask the cluster whether our running jobs are done.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        ShutdownConfig {
            cancel_running: false,
            poll_interval: Duration::from_secs(60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = Config::from_yaml(
            r#"
cluster:
  backend: slurm
paths:
  raw_dir: /fact/raw
  aux_dir: /fact/aux
  erna_dir: /fact/erna
"#,
        )
        .unwrap();
        assert_eq!(config.cluster.backend, Backend::Slurm);
        assert_eq!(config.cluster.job_prefix, "erna");
        assert_eq!(config.cluster.mail_type, "FAIL");
        assert_eq!(config.submitter.interval, Duration::from_secs(30));
        assert_eq!(config.submitter.retry_max_elapsed, Duration::from_secs(10));
        assert_eq!(config.cluster.local_slots, None);
        assert_eq!(config.monitor.port, 12700);
        assert!(!config.shutdown.cancel_running);
        assert_eq!(config.paths.erna_dir, PathBuf::from("/fact/erna"));
    }

    #[test]
    fn durations_are_human_readable() {
        let config = Config::from_yaml(
            r#"
database_url: /var/lib/erna/erna.sqlite
submitter:
  interval: 2m
  max_queued_jobs: 5
monitor:
  host: isdc-nx
  retry_max_elapsed: 500ms
cluster:
  backend: grid_engine
  queue: fact_short
  mail_address: ops@example.org
  env:
    facttools_infile_key: value
shutdown:
  cancel_running: true
  poll_interval: 10s
paths:
  raw_dir: /fact/raw
  aux_dir: /fact/aux
  erna_dir: /fact/erna
"#,
        )
        .unwrap();
        assert_eq!(config.submitter.interval, Duration::from_secs(120));
        assert_eq!(config.submitter.max_queued_jobs, 5);
        assert_eq!(config.monitor.retry_max_elapsed, Duration::from_millis(500));
        assert_eq!(config.monitor.host, "isdc-nx");
        assert_eq!(config.cluster.backend, Backend::GridEngine);
        assert_eq!(config.cluster.queue.as_deref(), Some("fact_short"));
        assert_eq!(config.cluster.env["facttools_infile_key"], "value");
        assert_eq!(config.shutdown.poll_interval, Duration::from_secs(10));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result = Config::from_yaml(
            r#"
cluster:
  backend: slurm
  partition: long
paths:
  raw_dir: /fact/raw
  aux_dir: /fact/aux
  erna_dir: /fact/erna
"#,
        );
        assert!(result.is_err());
    }
}
