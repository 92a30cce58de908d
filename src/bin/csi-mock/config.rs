use anyhow::Context;
use clap::ArgMatches;
use csi_idempotency::{
    endpoint::{csi_endpoint, parse_attribute_map, parse_endpoint, Endpoint, EndpointError},
    IdempotencyOptions,
};
use once_cell::sync::OnceCell;
use std::{collections::HashMap, time::Duration};

/// Endpoint served when neither `--endpoint` nor `CSI_ENDPOINT` names one.
const DEFAULT_ENDPOINT: &str = "unix:///var/tmp/csi-mock.sock";

static CONFIG: OnceCell<MockConfig> = OnceCell::new();

/// Global configuration of the csi-mock server.
pub(crate) struct MockConfig {
    /// Endpoint the server listens on.
    endpoint: Endpoint,
    /// Bounded wait for a volume's serial-access lock.
    acquisition_timeout: Duration,
    /// Reject operations on volumes that do not exist.
    require_volume: bool,
    /// Node id reported and used for publications.
    node_id: String,
    /// Attributes stamped onto every created volume.
    attributes: HashMap<String, String>,
    /// Default tracing level.
    log_level: String,
}

impl MockConfig {
    /// Initialize the global config instance. Must be called prior to using
    /// the config.
    pub(crate) fn initialize(args: &ArgMatches) -> anyhow::Result<()> {
        assert!(
            CONFIG.get().is_none(),
            "csi-mock config already initialized"
        );

        // The flag wins over the CSI_ENDPOINT environment variable.
        let endpoint = match args.get_one::<String>("endpoint") {
            Some(endpoint) => parse_endpoint(endpoint)?,
            None => match csi_endpoint() {
                Ok(endpoint) => endpoint,
                Err(EndpointError::MissingEndpoint) => parse_endpoint(DEFAULT_ENDPOINT)?,
                Err(error) => return Err(error.into()),
            },
        };

        let acquisition_timeout = args
            .get_one::<String>("timeout")
            .context("timeout must be specified")?
            .parse::<humantime::Duration>()?;

        let node_id = args
            .get_one::<String>("node-id")
            .context("node id must be specified")?;

        let log_level = args
            .get_one::<String>("log-level")
            .context("log level must be specified")?;

        let require_volume = args.get_flag("require-volume");

        let attributes = match args.get_one::<String>("attributes") {
            Some(line) => parse_attribute_map(line),
            None => HashMap::new(),
        };

        CONFIG.get_or_init(|| Self {
            endpoint,
            acquisition_timeout: acquisition_timeout.into(),
            require_volume,
            node_id: node_id.into(),
            attributes,
            log_level: log_level.into(),
        });
        Ok(())
    }

    /// Get the global config instance.
    pub(crate) fn get() -> &'static MockConfig {
        CONFIG.get().expect("csi-mock config is not initialized")
    }

    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub(crate) fn node_id(&self) -> &str {
        &self.node_id
    }

    pub(crate) fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    pub(crate) fn log_level(&self) -> &str {
        &self.log_level
    }

    /// The layer options selected on the command line.
    pub(crate) fn idempotency_options(&self) -> IdempotencyOptions {
        IdempotencyOptions::new()
            .with_timeout(self.acquisition_timeout)
            .with_require_volume(self.require_volume)
    }
}
