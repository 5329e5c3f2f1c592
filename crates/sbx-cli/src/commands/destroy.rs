use sbx_infra::ProviderRegistry;
use sbx_store::{Session, SessionStore};
use tracing::info;

use crate::error::{CliError, exit};
use crate::state::AppState;

pub async fn run(state: &AppState, name: &str) -> Result<i32, CliError> {
    let session = destroy(&state.store, &state.providers, name).await?;
    println!("destroyed {}", session.id);
    Ok(exit::SUCCESS)
}

/// Delete the VM, then forget the session. A failed delete keeps the record
/// so the operator can retry.
async fn destroy(
    store: &SessionStore,
    providers: &ProviderRegistry,
    name: &str,
) -> Result<Session, CliError> {
    let session = store.get(name)?;
    let provider = providers.get(session.provider)?;
    provider.delete(&session.provider_id).await?;
    info!(session = %session.id, vm_id = %session.provider_id, "vm deleted");
    Ok(store.remove(&session.id)?)
}
