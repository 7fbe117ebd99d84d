use anyhow::Context;
use std::sync::Arc;
use stratus_orchestrator::api::{self, AppState};
use stratus_orchestrator::provider_manager::ProviderManager;
use stratus_orchestrator::settings::Settings;
use stratus_orchestrator::{InstanceStateStore, Provisioner};
use stratus_providers::retry::{RandomJitter, RetryPolicy};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env()?;
    let provider = ProviderManager::get_provider(&settings.provider)?.with_context(|| {
        format!(
            "provider '{}' is not available in this build (enable its provider-* feature)",
            settings.provider
        )
    })?;

    let policy = Arc::new(RetryPolicy::new(
        settings.max_retries,
        Arc::new(RandomJitter::new()),
    ));
    let store = Arc::new(InstanceStateStore::new());
    let mut provisioner = Provisioner::new(provider, policy, store);
    if let Some(timeout) = settings.provision_timeout {
        provisioner = provisioner.with_deadline(timeout);
    }

    let app = api::router(Arc::new(AppState { provisioner }));
    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("binding {}", settings.bind_addr))?;
    tracing::info!(
        addr = %settings.bind_addr,
        provider = %settings.provider,
        max_retries = settings.max_retries,
        "orchestrator listening"
    );
    axum::serve(listener, app).await?;
    Ok(())
}
