use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "dpo",
    version,
    about = "Provisions and operates per-customer EKS dataplanes from DataPlane resources"
)]
pub struct Config {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Log format: json or pretty
    #[arg(long, env = "LOG_FORMAT", default_value = "json", global = true)]
    pub log_format: String,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Port serving /healthz and /readyz
    #[arg(long, env = "HEALTH_PORT", default_value = "8080")]
    pub health_port: u16,

    /// Port serving /metrics
    #[arg(long, env = "METRICS_PORT", default_value = "8081")]
    pub metrics_port: u16,

    /// Requeue delay after an error or between teardown steps
    #[arg(long, env = "SHORT_REQUEUE_SECONDS", default_value = "10")]
    pub short_requeue_seconds: u64,

    /// Requeue delay while converging and in steady state
    #[arg(long, env = "LONG_REQUEUE_SECONDS", default_value = "30")]
    pub long_requeue_seconds: u64,

    /// Deadline for a single cloud provider call
    #[arg(long, env = "PROVIDER_TIMEOUT_SECONDS", default_value = "120")]
    pub provider_timeout_seconds: u64,

    /// Deadline for a whole reconcile pass
    #[arg(long, env = "RECONCILE_TIMEOUT_SECONDS", default_value = "900")]
    pub reconcile_timeout_seconds: u64,

    /// Helm binary used to deploy workload charts
    #[arg(long, env = "HELM_BINARY", default_value = "helm")]
    pub helm_binary: String,

    /// Availability zones (and subnets) a self-provisioned network spans
    #[arg(long, env = "REQUIRED_AZS", default_value = "4")]
    pub required_azs: usize,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the controllers (default)
    Run,
    /// Print the CRD manifests as YAML
    Crd,
}

/// Timing and sizing knobs shared by every reconcile pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileSettings {
    pub short_requeue: Duration,
    pub long_requeue: Duration,
    pub reconcile_timeout: Duration,
    pub required_azs: usize,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            short_requeue: Duration::from_secs(10),
            long_requeue: Duration::from_secs(30),
            reconcile_timeout: Duration::from_secs(900),
            required_azs: 4,
        }
    }
}

impl Config {
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }

    pub const fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_seconds)
    }

    pub const fn settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            short_requeue: Duration::from_secs(self.short_requeue_seconds),
            long_requeue: Duration::from_secs(self.long_requeue_seconds),
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout_seconds),
            required_azs: self.required_azs,
        }
    }

    pub fn display(&self) {
        tracing::info!(
            health_port = self.health_port,
            metrics_port = self.metrics_port,
            short_requeue_seconds = self.short_requeue_seconds,
            long_requeue_seconds = self.long_requeue_seconds,
            provider_timeout_seconds = self.provider_timeout_seconds,
            reconcile_timeout_seconds = self.reconcile_timeout_seconds,
            helm_binary = %self.helm_binary,
            required_azs = self.required_azs,
            log_format = %self.log_format,
            log_level = %self.log_level,
            "Configuration initialized"
        );

        if self.short_requeue_seconds > self.long_requeue_seconds {
            tracing::warn!("Short requeue interval is longer than the long requeue interval");
        }
    }
}
