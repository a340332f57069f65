use anyhow::Result;
use colored::Colorize;
use dialoguer::Input;
use dialoguer::theme::ColorfulTheme;

use crate::health;
use crate::tunnel::{RemoteEndpoint, ServiceSpec};

fn non_empty(input: &String) -> Result<(), &'static str> {
    if input.trim().is_empty() {
        Err("must not be empty")
    } else {
        Ok(())
    }
}

fn non_zero(input: &u16) -> Result<(), &'static str> {
    if *input == 0 {
        Err("port must be between 1 and 65535")
    } else {
        Ok(())
    }
}

/// Ask for a service definition. `current` pre-fills every field when editing;
/// `taken` holds names already used by other services.
pub fn prompt_service(current: Option<&ServiceSpec>, taken: &[String]) -> Result<ServiceSpec> {
    let theme = ColorfulTheme::default();

    let mut name = Input::<String>::with_theme(&theme).with_prompt("Service name");
    if let Some(c) = current {
        name = name.default(c.name.clone());
    }
    let name = name
        .validate_with(|input: &String| -> Result<(), String> {
            non_empty(input).map_err(str::to_string)?;
            if taken.iter().any(|t| t == input.trim()) {
                return Err(format!("'{}' already exists", input.trim()));
            }
            Ok(())
        })
        .interact_text()?
        .trim()
        .to_string();

    let mut local_port = Input::<u16>::with_theme(&theme).with_prompt("Local port");
    if let Some(c) = current {
        local_port = local_port.default(c.local_port);
    }
    let local_port = local_port.validate_with(non_zero).interact_text()?;

    let unchanged_port = current.is_some_and(|c| c.local_port == local_port);
    if !unchanged_port && !health::is_port_free(local_port) {
        println!(
            "  {} localhost:{} is in use right now; the tunnel will keep retrying until it is free",
            "⚠".yellow(),
            local_port
        );
    }

    let mut remote_host = Input::<String>::with_theme(&theme).with_prompt("Remote host");
    if let Some(c) = current {
        remote_host = remote_host.default(c.remote_host.clone());
    }
    let remote_host = remote_host
        .validate_with(non_empty)
        .interact_text()?
        .trim()
        .to_string();

    let mut remote_port = Input::<u16>::with_theme(&theme).with_prompt("Remote port");
    if let Some(c) = current {
        remote_port = remote_port.default(c.remote_port);
    } else {
        remote_port = remote_port.default(local_port);
    }
    let remote_port = remote_port.validate_with(non_zero).interact_text()?;

    Ok(ServiceSpec {
        name,
        local_port,
        remote_host,
        remote_port,
    })
}

/// Ask for the SSH gateway, defaulting to the current values.
pub fn prompt_endpoint(current: &RemoteEndpoint) -> Result<RemoteEndpoint> {
    let theme = ColorfulTheme::default();

    let mut host = Input::<String>::with_theme(&theme).with_prompt("SSH host");
    if !current.host.is_empty() {
        host = host.default(current.host.clone());
    }
    let host = host.validate_with(non_empty).interact_text()?.trim().to_string();

    let port = Input::<u16>::with_theme(&theme)
        .with_prompt("SSH port")
        .default(current.port)
        .validate_with(non_zero)
        .interact_text()?;

    let default_user = if current.user.is_empty() {
        whoami::username()
    } else {
        current.user.clone()
    };
    let user = Input::<String>::with_theme(&theme)
        .with_prompt("SSH username")
        .default(default_user)
        .validate_with(non_empty)
        .interact_text()?
        .trim()
        .to_string();

    let default_key = if current.key_path.is_empty() {
        "~/.ssh/id_ed25519".to_string()
    } else {
        current.key_path.clone()
    };
    let key_path = Input::<String>::with_theme(&theme)
        .with_prompt("SSH private key path")
        .default(default_key)
        .validate_with(non_empty)
        .interact_text()?
        .trim()
        .to_string();

    let endpoint = RemoteEndpoint {
        host,
        port,
        user,
        key_path,
    };
    if !endpoint.key_file().exists() {
        println!(
            "  {} {} does not exist",
            "⚠".yellow(),
            endpoint.key_file().display()
        );
    }
    Ok(endpoint)
}
