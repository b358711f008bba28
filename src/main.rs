use anyhow::Context;
use binpatch::{LogReporter, PatchConfig, PatchOrchestrator, Reporter, Silent};
use clap::Parser;
use log::LevelFilter;
use snapper::Snapper;
use snapshots::native::NativeSnapshotter;
use std::path::PathBuf;
use std::sync::Arc;

mod api;
mod server;
mod snapper;

/// Diagnostics of the patch passes are only emitted when this variable is set.
const DIAGNOSTICS_ENV: &str = "SNAPPER_DIAGNOSTICS";

/// Arguments of the snapshotter daemon.
///
/// Example :
///
/// `snapper /run/snapper.sock /var/lib/snapper --patch-config patch.json`
#[derive(Parser, Debug)]
#[clap(version, author, about = "A containerd proxy snapshotter patching binaries at mount time")]
struct SnapperOpts {
    /// The Unix socket the snapshots service listens on.
    address: PathBuf,
    /// The root directory of the snapshot store.
    root: PathBuf,
    /// A JSON file describing the binaries to patch. Without it, mounts are left alone.
    #[clap(long)]
    patch_config: Option<PathBuf>,
    /// If set, only errors are logged.
    #[clap(long, short)]
    quiet: bool,
}

async fn run(opts: SnapperOpts) -> anyhow::Result<()> {
    let native = NativeSnapshotter::new(&opts.root)
        .with_context(|| format!("creating snapshotter in {}", opts.root.display()))?;
    let mut snapper = Snapper::new(&opts.root, native);

    if let Some(path) = &opts.patch_config {
        let plan = PatchConfig::load(path)
            .and_then(PatchConfig::into_plan)
            .with_context(|| format!("loading patch configuration {}", path.display()))?;

        let reporter: Arc<dyn Reporter> = if std::env::var_os(DIAGNOSTICS_ENV).is_some() {
            Arc::new(LogReporter)
        } else {
            Arc::new(Silent)
        };

        log::info!(
            "patching {} binaries with {} directives on mount",
            plan.binary,
            plan.directives.len()
        );
        snapper = snapper.with_orchestrator(PatchOrchestrator::new(plan, reporter));
    }

    server::serve(&opts.address, Arc::new(snapper)).await
}

#[tokio::main]
async fn main() {
    let opts = SnapperOpts::parse();

    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if opts.quiet {
        logger.filter_level(LevelFilter::Error);
    }
    logger.init();

    if let Err(e) = run(opts).await {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}
