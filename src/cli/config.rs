//! Conversion of parsed CLI arguments into library configuration

use crate::cli::main_impl::{Cli, CliBackend};
use crate::{
    config::{parse_hex_color, CompositeRequest, ExecutionProvider, OutputMode, RemovalConfig},
    models::{ModelContract, ModelSpec},
    processor::BackendType,
    services::ImageIOService,
};
use anyhow::{Context, Result};
use instant::Duration;
use std::sync::Arc;

/// Input size of the model the mock backend pretends to be
const MOCK_MODEL_SIZE: u32 = 320;

/// Everything `main` needs to build a controller and a request
#[derive(Debug)]
pub(crate) struct CliSettings {
    pub(crate) model_spec: ModelSpec,
    pub(crate) backend_type: BackendType,
    pub(crate) removal_config: RemovalConfig,
    pub(crate) request: CompositeRequest,
}

pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    pub(crate) fn from_cli(cli: &Cli) -> Result<CliSettings> {
        let backend_type = match cli.backend {
            CliBackend::Onnx => BackendType::Onnx,
            CliBackend::Tract => BackendType::Tract,
            CliBackend::Mock => BackendType::Mock,
        };

        let execution_provider: ExecutionProvider = cli
            .execution_provider
            .parse()
            .context("Invalid execution provider")?;

        let mut builder = RemovalConfig::builder()
            .execution_provider(execution_provider)
            .num_threads(cli.threads)
            .default_threshold(cli.threshold)
            .default_feather_radius(cli.feather)
            .debug(cli.verbose >= 2);
        if let Some(timeout_ms) = cli.timeout_ms {
            builder = builder.inference_timeout(Duration::from_millis(timeout_ms));
        }
        let removal_config = builder.build().context("Invalid configuration")?;

        let model_spec = Self::model_spec(cli, backend_type)?;
        let request = Self::request(cli, &removal_config)?;

        Ok(CliSettings {
            model_spec,
            backend_type,
            removal_config,
            request,
        })
    }

    fn model_spec(cli: &Cli, backend_type: BackendType) -> Result<ModelSpec> {
        let contract = cli
            .contract
            .as_ref()
            .map(|path| {
                ModelContract::from_json_file(path)
                    .with_context(|| format!("Failed to read contract {}", path.display()))
            })
            .transpose()?;

        let spec = match (&cli.model, backend_type) {
            (Some(path), _) => ModelSpec::external(path),
            (None, BackendType::Mock) => ModelSpec::in_memory(
                Arc::from(b"mock".as_slice()),
                ModelContract::binary("mock", MOCK_MODEL_SIZE),
            ),
            (None, _) => anyhow::bail!("--model is required for the {backend_type} backend"),
        };

        Ok(match contract {
            Some(contract) => spec.with_contract(contract),
            None => spec,
        })
    }

    fn request(cli: &Cli, config: &RemovalConfig) -> Result<CompositeRequest> {
        let mode = match (&cli.color, &cli.background_image) {
            (Some(color), None) => OutputMode::SolidColor(parse_hex_color(color)?),
            (None, Some(path)) => OutputMode::ReplacementImage(
                ImageIOService::load_image(path)
                    .with_context(|| format!("Failed to load background {}", path.display()))?,
            ),
            (None, None) => OutputMode::Transparent,
            (Some(_), Some(_)) => {
                anyhow::bail!("--color and --background-image are mutually exclusive")
            },
        };
        let request = config.request(mode);
        request.validate().context("Invalid compositing options")?;
        Ok(request)
    }
}
