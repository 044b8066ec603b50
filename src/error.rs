use miette::Diagnostic;
use std::io;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Service not found: {0}")]
    #[diagnostic(
        code(devwatch::service::not_found),
        help("Check that the service directory contains a devwatch.yaml")
    )]
    ServiceNotFound(String),

    #[error("Service '{0}' failed to install: {1}")]
    #[diagnostic(
        code(devwatch::service::install_failed),
        help("Run the install command manually inside the service directory to see the full output")
    )]
    InstallFailed(String, String),

    #[error("Service '{service}' failed to spawn: {source}")]
    #[diagnostic(
        code(devwatch::service::spawn_failed),
        help("Check that the run command exists and is executable")
    )]
    SpawnFailed {
        service: String,
        #[source]
        source: io::Error,
    },

    #[error("Service '{service}' could not be killed: {reason}")]
    #[diagnostic(code(devwatch::service::kill_failed))]
    KillFailed { service: String, reason: String },

    #[error("Watcher error for '{service}': {reason}")]
    #[diagnostic(
        code(devwatch::watch::error),
        help("The affected service has been stopped; fix the watched paths and restart")
    )]
    Watch { service: String, reason: String },

    #[error("Code generation failed for '{0}': {1}")]
    Generate(String, String),

    #[error("Action {action} is not allowed while {state}")]
    #[diagnostic(code(devwatch::supervisor::invalid_action))]
    InvalidAction { state: String, action: String },
}

pub type Result<T> = std::result::Result<T, Error>;
