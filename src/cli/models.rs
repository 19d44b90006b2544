use anyhow::{Context, Result};

use crate::agent::{ChatTransport, HttpTransport, ProviderConfig, ProviderRegistry, ProviderSpec};
use crate::config::Config;

pub async fn run(config: Config) -> Result<()> {
    let kind = config.provider_kind()?;
    let spec = ProviderRegistry::builtin()
        .get(kind)
        .with_context(|| format!("No provider registered for {}", kind))?;
    let provider_config = config.provider_config(spec.as_ref());

    let models = list_models(spec.as_ref(), &provider_config, &HttpTransport::default()).await?;

    println!("{} models at {}:", kind, provider_config.base_url);
    for model in models {
        let marker = if model == provider_config.model { "*" } else { " " };
        println!(" {} {}", marker, model);
    }
    Ok(())
}

pub async fn list_models(
    spec: &dyn ProviderSpec,
    config: &ProviderConfig,
    transport: &dyn ChatTransport,
) -> Result<Vec<String>> {
    let request = spec.models_request(config);
    let body = transport
        .fetch_json(&request)
        .await
        .with_context(|| format!("Failed to list models from {}", request.url))?;
    Ok(spec.parse_models(&body))
}
