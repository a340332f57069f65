use anyhow::{Context, Result};
use dialoguer::FuzzySelect;
use dialoguer::theme::ColorfulTheme;

use crate::tunnel::ServiceSpec;

/// Show a fuzzy picker over services and return the chosen one's name.
pub fn pick_service(prompt: &str, services: &[ServiceSpec]) -> Result<String> {
    if services.is_empty() {
        anyhow::bail!("no services configured");
    }

    let items: Vec<String> = services
        .iter()
        .map(|s| format!("{} ({} → {})", s.name, s.inbound(), s.outbound()))
        .collect();

    let idx = FuzzySelect::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .items(&items)
        .interact()
        .context("selection cancelled")?;
    Ok(services[idx].name.clone())
}
