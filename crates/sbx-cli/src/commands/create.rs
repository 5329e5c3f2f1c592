use std::sync::Arc;
use std::time::Duration;

use sbx_infra::clock::TokioClock;
use sbx_store::SessionStore;
use tracing::info;

use crate::cli::CreateArgs;
use crate::error::{CliError, exit};
use crate::names;
use crate::provision::{ProvisionRequest, Provisioner};
use crate::state::AppState;

pub async fn run(state: &AppState, args: CreateArgs) -> Result<i32, CliError> {
    let provider_name = args.provider.unwrap_or(state.config.default_provider);
    let provider = state.providers.get(provider_name)?.clone();
    let name = pick_name(&state.store, args.name)?;
    let settings = state.config.providers.get(&provider_name);

    let req = ProvisionRequest {
        name,
        ssh_public_key: state.config.ssh_key.public_key()?,
        ssh_user: state.config.ssh_user.clone(),
        region: args
            .region
            .or_else(|| settings.and_then(|s| s.region.clone())),
        instance_type: args
            .instance_type
            .or_else(|| settings.and_then(|s| s.instance_type.clone())),
        image: args.image.or_else(|| settings.and_then(|s| s.image.clone())),
        repo: args.repo,
        template: args.template,
        lifetime: args.timeout.map(|m| Duration::from_secs(m.saturating_mul(60))),
        wait_timeout: Duration::from_secs(
            args.wait_timeout.unwrap_or(state.config.wait_timeout_secs),
        ),
        console: args.console,
    };

    eprintln!("creating {} on {provider_name}...", req.name);
    let connector = state.connector();
    let provisioner = Provisioner::new(
        provider,
        &state.store,
        &state.templates,
        &connector,
        Arc::new(TokioClock),
    );
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let done = provisioner.run(&req, &mut stdout, &mut stderr).await?;

    info!(session = %done.session.id, "sandbox ready");
    match done.console {
        Some(outcome) => Ok(super::console::report_exit(&done.session.id, outcome)),
        None => {
            let address = done.session.address.as_deref().unwrap_or("-");
            println!("{} is running at {address}", done.session.id);
            println!("  connect: sbx console {}", done.session.id);
            Ok(exit::SUCCESS)
        }
    }
}

/// Validate an explicit name, or generate one no local session uses.
fn pick_name(store: &SessionStore, requested: Option<String>) -> Result<String, CliError> {
    let existing = store.list()?;
    let taken = |name: &str| existing.iter().any(|s| s.matches_id(name));

    match requested {
        Some(name) => {
            if !names::validate(&name) {
                return Err(CliError::Invalid(format!(
                    "invalid sandbox name '{name}': use letters, digits and inner hyphens (max 63)"
                )));
            }
            if taken(&name) {
                return Err(sbx_store::Error::Duplicate(name).into());
            }
            Ok(name)
        }
        None => Ok(names::generate_unique(taken)),
    }
}
