pub mod agent;
#[cfg(feature = "desktop")]
pub mod desktop;
pub mod errors;
pub mod learning;
pub mod settings;
pub mod templates;
pub mod utils;
pub mod vision;

#[cfg(feature = "desktop")]
pub async fn run() -> anyhow::Result<()> {
    use std::sync::Arc;

    use anyhow::Context;

    use agent::{Agent, AgentController, Collaborators, LogPrompt};
    use desktop::{EnigoInjector, RdevInput, XcapForeground, XcapScreen};
    use settings::SettingsStore;
    use templates::{TemplateStore, Tier};
    use vision::FingerprintEngine;

    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    log::info!("clickwise starting up...");

    let root = std::env::current_dir().context("failed to resolve the working directory")?;
    let settings = SettingsStore::open(root.join("config.json"))?;
    let fingerprints = FingerprintEngine::from_settings(&settings.snapshot());
    let store = TemplateStore::open(root.join("templates"), fingerprints)
        .context("failed to open the template store")?;

    let library = store.library();
    log::info!(
        "Loaded {} priority, {} learned and {} no_click template(s) from {}",
        library.tier(Tier::Priority).len(),
        library.tier(Tier::Learned).len(),
        library.tier(Tier::NoClick).len(),
        store.root().display()
    );

    let io = Collaborators {
        screen: Arc::new(XcapScreen::new().context("failed to open the primary monitor")?),
        injector: Arc::new(EnigoInjector),
        foreground: Arc::new(XcapForeground::new()),
        prompt: Arc::new(LogPrompt),
    };

    let mut controller = AgentController::new();
    controller.start(Agent::new(settings, store, io), &mut RdevInput)?;

    let exit = tokio::select! {
        exit = controller.wait() => exit?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl+C received, stopping");
            controller.stop().await?
        }
    };

    if let Some(exit) = exit {
        log::info!("clickwise exited ({:?})", exit.reason);
    }
    Ok(())
}
