use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::config::helpers::{optional_env, parse_bool_env, parse_optional_env, parse_pairs};
use crate::environment::{
    AppSpec, EnvironmentPlan, NullSink, OutputSink, ReadinessProbe, ServiceSpec, StdioSink,
    TracingSink,
};
use crate::error::ConfigError;

/// Where pull/build progress and drained container logs go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputMode {
    /// Host stdout/stderr.
    #[default]
    Stdio,
    /// `tracing` events.
    Log,
    /// Discarded.
    Quiet,
}

impl OutputMode {
    pub fn sink(&self) -> Arc<dyn OutputSink> {
        match self {
            Self::Stdio => Arc::new(StdioSink),
            Self::Log => Arc::new(TracingSink),
            Self::Quiet => Arc::new(NullSink),
        }
    }
}

impl std::fmt::Display for OutputMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdio => write!(f, "stdio"),
            Self::Log => write!(f, "log"),
            Self::Quiet => write!(f, "quiet"),
        }
    }
}

impl std::str::FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stdio" | "stdout" => Ok(Self::Stdio),
            "log" | "tracing" => Ok(Self::Log),
            "quiet" | "none" => Ok(Self::Quiet),
            _ => Err(format!(
                "invalid output mode '{}', expected 'stdio', 'log' or 'quiet'",
                s
            )),
        }
    }
}

/// Integration environment configuration.
///
/// Defaults describe a SQL Server dependency and an application built from
/// the current directory.
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// Network both containers join.
    pub network: String,

    // -- Dependency --
    pub db_name: String,
    pub db_image: String,
    pub db_port: u16,
    pub db_password: SecretString,

    // -- Application --
    pub app_name: String,
    pub app_tag: String,
    pub app_source: PathBuf,
    pub app_port: u16,
    /// Extra variables for the application container.
    pub app_env: Vec<(String, String)>,
    pub health_path: String,

    // -- Lifecycle --
    pub ready_attempts: u32,
    pub ready_interval_ms: u64,
    pub stop_timeout_secs: u64,
    /// Keep stopped containers after teardown (for debugging).
    pub keep_containers: bool,
    pub output: OutputMode,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            network: "stock-engine-integration".to_string(),
            db_name: "sql-server".to_string(),
            db_image: "mcr.microsoft.com/azure-sql-edge".to_string(),
            db_port: 1433,
            db_password: SecretString::from("yourStrong!Password"),
            app_name: "app-container".to_string(),
            app_tag: "app-container".to_string(),
            app_source: PathBuf::from("."),
            app_port: 10000,
            app_env: Vec::new(),
            health_path: "/health".to_string(),
            ready_attempts: 60,
            ready_interval_ms: 500,
            stop_timeout_secs: 30,
            keep_containers: false,
            output: OutputMode::default(),
        }
    }
}

impl EnvironmentConfig {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let app_name = optional_env("TESTBED_APP_NAME")?.unwrap_or(defaults.app_name);
        let app_tag = optional_env("TESTBED_APP_TAG")?.unwrap_or_else(|| app_name.clone());

        let app_env = match optional_env("TESTBED_APP_ENV")? {
            Some(raw) => parse_pairs("TESTBED_APP_ENV", &raw)?,
            None => defaults.app_env,
        };

        let output = if let Some(mode) = optional_env("TESTBED_OUTPUT")? {
            mode.parse().map_err(|e| ConfigError::InvalidValue {
                key: "TESTBED_OUTPUT".to_string(),
                message: e,
            })?
        } else {
            defaults.output
        };

        let db_port = parse_optional_env("TESTBED_DB_PORT", defaults.db_port)?;
        let app_port = parse_optional_env("TESTBED_APP_PORT", defaults.app_port)?;
        if db_port == app_port {
            return Err(ConfigError::InvalidValue {
                key: "TESTBED_APP_PORT".to_string(),
                message: format!("port {} is already used by the dependency", app_port),
            });
        }

        Ok(Self {
            network: optional_env("TESTBED_NETWORK")?.unwrap_or(defaults.network),
            db_name: optional_env("TESTBED_DB_NAME")?.unwrap_or(defaults.db_name),
            db_image: optional_env("TESTBED_DB_IMAGE")?.unwrap_or(defaults.db_image),
            db_port,
            db_password: optional_env("TESTBED_DB_PASSWORD")?
                .map(SecretString::from)
                .unwrap_or(defaults.db_password),
            app_name,
            app_tag,
            app_source: optional_env("TESTBED_APP_SOURCE")?
                .map(PathBuf::from)
                .unwrap_or(defaults.app_source),
            app_port,
            app_env,
            health_path: optional_env("TESTBED_HEALTH_PATH")?.unwrap_or(defaults.health_path),
            ready_attempts: parse_optional_env("TESTBED_READY_ATTEMPTS", defaults.ready_attempts)?,
            ready_interval_ms: parse_optional_env(
                "TESTBED_READY_INTERVAL_MS",
                defaults.ready_interval_ms,
            )?,
            stop_timeout_secs: parse_optional_env(
                "TESTBED_STOP_TIMEOUT_SECS",
                defaults.stop_timeout_secs,
            )?,
            keep_containers: parse_bool_env("TESTBED_KEEP_CONTAINERS", defaults.keep_containers)?,
            output,
        })
    }

    /// Connection string the application uses to reach the dependency by hostname.
    pub fn connection_string(&self) -> SecretString {
        SecretString::from(format!(
            "Server={};User Id=sa;Password={};pooling=true;Encrypt=True;TrustServerCertificate=True;",
            self.db_name,
            self.db_password.expose_secret()
        ))
    }

    /// Dependency readiness check: a SQL Server login when the `mssql`
    /// feature is on, otherwise a TCP connect.
    pub fn dependency_probe(&self) -> Arc<dyn ReadinessProbe> {
        #[cfg(feature = "mssql")]
        {
            Arc::new(crate::environment::MssqlProbe::localhost(
                self.db_port,
                "sa",
                self.db_password.clone(),
            ))
        }
        #[cfg(not(feature = "mssql"))]
        {
            Arc::new(crate::environment::TcpProbe::localhost(self.db_port))
        }
    }

    /// Build the environment plan these settings describe.
    pub fn to_plan(&self) -> EnvironmentPlan {
        let dependency_env = BTreeMap::from([
            ("ACCEPT_EULA".to_string(), "Y".to_string()),
            (
                "MSSQL_SA_PASSWORD".to_string(),
                self.db_password.expose_secret().to_string(),
            ),
        ]);

        let mut app_env: BTreeMap<String, String> = self.app_env.iter().cloned().collect();
        app_env.insert(
            "SQL_CONNECTIONSTRING".to_string(),
            self.connection_string().expose_secret().to_string(),
        );

        let mut plan = EnvironmentPlan::new(
            self.network.clone(),
            ServiceSpec {
                name: self.db_name.clone(),
                image: self.db_image.clone(),
                port: self.db_port,
                env: dependency_env,
            },
            AppSpec {
                name: self.app_name.clone(),
                tag: self.app_tag.clone(),
                source_dir: self.app_source.clone(),
                port: self.app_port,
                env: app_env,
                health_path: self.health_path.clone(),
            },
        );
        plan.max_attempts = self.ready_attempts;
        plan.poll_interval = Duration::from_millis(self.ready_interval_ms);
        plan.stop_timeout = Duration::from_secs(self.stop_timeout_secs);
        plan.keep_on_teardown = self.keep_containers;
        plan
    }
}
