use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use ember_e2ee::{
    DecryptContext, EngineConfig, FileStateStore, MemoryDirectory, MemoryStateStore,
    SessionEngine, StateStore,
};
use serde::Deserialize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Settings file passed with `--config`.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct SimConfig {
    log_filter: String,
    messages: usize,
    /// Keep the recipient's state in an encrypted file here instead of memory.
    state_dir: Option<PathBuf>,
    engine: EngineConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".to_string(),
            messages: 3,
            state_dir: None,
            engine: EngineConfig::default(),
        }
    }
}

/// Command-line arguments for the simulator.
struct Args {
    config_path: Option<PathBuf>,
    messages: Option<usize>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;
    let mut messages = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config_path = args.next().map(PathBuf::from),
            "--messages" => {
                let value = args.next().context("--messages needs a value")?;
                messages = Some(value.parse().context("--messages must be a number")?);
            }
            other => bail!("unknown argument: {other}"),
        }
    }

    Ok(Args {
        config_path,
        messages,
    })
}

fn load_config(args: &Args) -> anyhow::Result<SimConfig> {
    let mut config = match &args.config_path {
        Some(path) if path.exists() => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<SimConfig>(&json)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        _ => SimConfig::default(),
    };
    if let Some(messages) = args.messages {
        config.messages = messages;
    }
    config.engine.validate()?;
    Ok(config)
}

fn recipient_storage(config: &SimConfig, label: &str) -> anyhow::Result<Arc<dyn StateStore>> {
    let Some(dir) = &config.state_dir else {
        let store: Arc<dyn StateStore> = MemoryStateStore::new();
        return Ok(store);
    };
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(format!("{label}.state"));
    // Fresh key per run; a real client takes this from the platform keychain.
    let store: Arc<dyn StateStore> =
        Arc::new(FileStateStore::new(path, rand::random::<[u8; 32]>()));
    Ok(store)
}

fn run(config: &SimConfig) -> anyhow::Result<()> {
    let directory = MemoryDirectory::new();

    let alice = SessionEngine::provision(
        "alice",
        "laptop",
        config.engine.clone(),
        directory.client("alice", "laptop"),
        MemoryStateStore::new(),
    )?;
    let bob = SessionEngine::provision(
        "bob",
        "phone",
        config.engine.clone(),
        directory.client("bob", "phone"),
        recipient_storage(config, "bob-phone")?,
    )?;
    let from_alice = DecryptContext::from_sender("alice", "laptop");

    for i in 0..config.messages {
        let message_id = format!("msg-{i}");
        let text = format!("hello bob #{i}");
        let outcome = alice.encrypt_for_peer("bob", &message_id, text.as_bytes())?;
        let opened = bob.decrypt_envelope_detailed(&outcome.envelope, false, Some(&from_alice))?;
        let echoed = alice.decrypt_envelope(&outcome.envelope, true, None)?;
        if opened.plaintext != text.as_bytes() || echoed != text.as_bytes() {
            bail!("round trip mismatch for {message_id}");
        }
        tracing::info!(
            message_id = %message_id,
            key_ref = %outcome.envelope.key_ref,
            source = ?opened.source,
            "delivered"
        );
    }

    let added = bob.replenish_prekeys()?;
    tracing::info!(added, directory_stock = directory.available_prekeys("bob"), "bob replenished");

    bob.rotate_signed_prekey()?;
    drop(bob);

    // Reinstall: new identity under the same device id.
    let bob = SessionEngine::provision(
        "bob",
        "phone",
        config.engine.clone(),
        directory.client("bob", "phone"),
        recipient_storage(config, "bob-phone-reinstalled")?,
    )?;
    let outcome = alice.encrypt_for_peer("bob", "msg-reinstalled", b"hello-new-device")?;
    let opened = bob.decrypt_envelope(&outcome.envelope, false, Some(&from_alice))?;
    tracing::info!(
        trust_change = ?outcome.trust_change,
        plaintext = %String::from_utf8_lossy(&opened),
        "message to reinstalled device"
    );

    if let Some(fingerprint) = alice.fingerprint("bob") {
        tracing::info!(
            device = %fingerprint.device_id,
            identity = %fingerprint.identity_hex(),
            "alice's fingerprint for bob"
        );
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = parse_args()?;
    let config = load_config(&args)?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(
        messages = config.messages,
        algorithm = %config.engine.algorithm,
        "ember-sim starting"
    );
    if let Err(e) = run(&config) {
        tracing::error!(error = format!("{e:#}"), "simulation failed");
        return Err(e);
    }
    tracing::info!("ember-sim finished");
    Ok(())
}
