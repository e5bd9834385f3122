use server_api::{JwtAuthority, RelayConfig, RelayContext};
use storage::Storage;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) relay: RelayContext,
    pub(crate) storage: Storage,
    pub(crate) jwt: JwtAuthority,
}

impl AppState {
    pub(crate) fn new(storage: Storage, jwt: JwtAuthority, config: RelayConfig) -> Self {
        Self {
            relay: RelayContext::with_storage(storage.clone(), jwt.clone(), config),
            storage,
            jwt,
        }
    }
}
