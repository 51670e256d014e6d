use anyhow::Result;
use audiobook_pipeline::core::config::Config;
use audiobook_pipeline::core::io::NativeStorage;
use audiobook_pipeline::services::engine::registry::EngineRegistry;
use audiobook_pipeline::services::workflow::{RunOutcome, WorkflowManager};
use inquire::{Confirm, Text};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    // 1. Load Config
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yml".to_string());
    let config = match Config::load(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            eprintln!("Please ensure '{}' exists and defines at least one engine.", path);
            return Err(e);
        }
    };

    // 2. Initialize Engines
    let registry = EngineRegistry::from_config(&config)?;

    // 3. Initialize Workflow
    let mut manager =
        WorkflowManager::new(config, registry, Arc::new(NativeStorage::new())).await?;

    let cancel = manager.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, finishing in-flight chunks...");
            cancel.cancel();
        }
    });

    // 4. Run until done, asking at each hard gate
    loop {
        match manager.run().await? {
            RunOutcome::Completed => break,
            RunOutcome::AwaitingApproval(node) => {
                let detail = manager
                    .status()
                    .node(node)
                    .detail
                    .clone()
                    .unwrap_or_default();
                println!("Gate '{}': {}", node, detail);

                let approved = Confirm::new(&format!("Approve '{}' and continue?", node))
                    .with_default(true)
                    .prompt()?;
                if approved {
                    manager.approve_gate(node).await?;
                } else {
                    let reason = Text::new("Reason for rejection:").prompt()?;
                    manager.reject_gate(node, &reason).await?;
                }
            }
        }
    }

    println!("Audiobook ready.");
    Ok(())
}
