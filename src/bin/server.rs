use std::net::TcpListener;
use std::sync::Arc;

use anyhow::Context;
use rand::{rngs::StdRng, SeedableRng};
use tracing::info;

use code_duel::prelude::*;

fn main() -> anyhow::Result<()> {
    let mut config = Configuration::from_env();
    // the bind address can also be given as the only argument
    if let Some(bind) = std::env::args().nth(1) {
        config = config.with_bind(bind);
    }
    init_logger(&config)?;

    let constraints = ConstraintsBuilder::from_env().build()?;
    info!(?constraints);
    let workers = constraints.workers();
    let verifier = Verifier::new(&config, constraints)?;
    let catalog = TaskCatalog::builtin()?;
    let lobby = Lobby::new(catalog, Arc::new(verifier), workers, StdRng::from_os_rng())?;

    let listener = TcpListener::bind(config.bind())
        .with_context(|| format!("could not listen on {}", config.bind()))?;
    serve(listener, lobby)
}
