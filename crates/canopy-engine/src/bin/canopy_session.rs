use anyhow::Context;
use canopy_engine::{SearchSession, SessionConfig};
use canopy_optimizer::Scope;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .context("usage: canopy-session <scope.json>")?;
    let body = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("reading {path}"))?;
    let spec: serde_json::Value =
        serde_json::from_str(&body).with_context(|| format!("parsing {path}"))?;
    let scope = Scope::from_json(&spec)?;

    let name = std::path::Path::new(&path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "canopy".to_string());
    let config = SessionConfig::from_env()?.with_name(name);
    let mut session = SearchSession::new(config, &scope)?;

    for handle in session.group().handles() {
        let model = handle.lock();
        let paths: Vec<&str> = model.domains().iter().map(|d| d.path.as_str()).collect();
        info!(
            model = %model.id(),
            domains = model.len(),
            complexity = model.complexity(),
            paths = ?paths,
            "Model"
        );
    }

    if session.config().store_path.is_some() {
        session.checkpoint().await?;
    }
    Ok(())
}
