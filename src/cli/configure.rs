//! Logic for the `configure` subcommand.

use crate::config;
use crate::control_plane;
use crate::identity::{self, AgentIdentity, IdentityStore, NoopSealer, Position};
use anyhow::{Context, Result};
use clap::Args;

/// First-time registration with the control plane.
#[derive(Debug, Args)]
pub(crate) struct Cmd {
    /// Room label for this endpoint.
    #[arg(long)]
    room: Option<String>,

    /// Grid column within the room.
    #[arg(long, default_value_t = 0)]
    x: i32,

    /// Grid row within the room.
    #[arg(long, default_value_t = 0)]
    y: i32,

    /// Control-plane room identifier.
    #[arg(long)]
    room_id: Option<String>,
}

impl Cmd {
    /// Register this endpoint and persist the returned identity.
    pub(crate) fn run(self) -> Result<()> {
        let settings = config::Settings::assemble()?;
        let fingerprint = identity::hardware_fingerprint()?;

        let requested_position = self.room.map(|room| Position {
            room,
            x: self.x,
            y: self.y,
            room_id: self.room_id.unwrap_or_default(),
        });

        let client = control_plane::ClientBuilder::new(settings.api_url.as_str())
            .build()
            .context("failed to build control-plane client")?;
        let runtime = tokio::runtime::Runtime::new()?;
        let response = runtime
            .block_on(client.identify(&fingerprint, requested_position.as_ref()))
            .context("registration with the control plane failed")?;

        let store = IdentityStore::open(&settings.data_dir, Box::new(NoopSealer::default()));
        let agent_identity = AgentIdentity {
            agent_id: response.agent_id.clone(),
            encrypted_token: store.seal_token(&response.token)?,
            position: response.position,
        };
        store
            .save(&agent_identity)
            .context("failed to persist agent identity")?;

        println!("registered as agent '{}'", response.agent_id);
        Ok(())
    }
}
