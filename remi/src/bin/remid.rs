use anyhow::Context;
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "remid",
    version,
    about = "Migration daemon - hosts REMI providers that receive filesets from remote peers",
    long_about = "`remid` hosts one or more REMI migration providers on a single listen \
address. Peers address a provider by its 16-bit id, and every fileset class accepted by the \
daemon must be registered up front with --class.

EXAMPLES:
    # Accept filesets of class \"kv_store\" on provider 1
    remid --listen 0.0.0.0:8440 --provider-id 1 --class kv_store -v

    # Serialize writes landing on a rotating disk
    remid --listen 0.0.0.0:8440 --class archive --device /mnt/cold:hdd"
)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8440")]
    listen: String,

    /// Provider id to register (repeatable)
    #[arg(long = "provider-id", default_values_t = vec![0u16])]
    provider_ids: Vec<u16>,

    /// Migration class to accept on every provider (repeatable)
    #[arg(long = "class")]
    classes: Vec<String>,

    /// Device table entry as MOUNT:KIND where KIND is mem, hdd or ssd (repeatable)
    #[arg(long = "device", value_name = "MOUNT:KIND")]
    devices: Vec<String>,

    /// Number of concurrent asynchronous I/O operations, 0 disables the I/O provider
    #[arg(long, default_value = "0")]
    io_depth: usize,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn logging_class(name: &str) -> remi::MigrationClass {
    let before_name = name.to_string();
    let after_name = name.to_string();
    remi::MigrationClass::new()
        .on_before(move |fileset| {
            tracing::info!(class = %before_name, root = %fileset.root(), "migration starting");
            0
        })
        .on_after(move |fileset| {
            tracing::info!(
                class = %after_name,
                root = %fileset.root(),
                files = fileset.files().count(),
                "migration complete"
            );
            0
        })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);
    for entry in &args.devices {
        let (mount, kind) = entry
            .rsplit_once(':')
            .with_context(|| format!("device entry {entry:?} is not MOUNT:KIND"))?;
        let kind = kind
            .parse()
            .with_context(|| format!("invalid device kind in {entry:?}"))?;
        common::device::set_device(mount, kind)
            .with_context(|| format!("failed registering device {entry:?}"))?;
    }
    let service = remi::Service::bind(&args.listen)
        .await
        .with_context(|| format!("failed binding {}", args.listen))?;
    println!("remid listening on {}", service.local_addr());
    for provider_id in &args.provider_ids {
        let provider = service
            .register_provider(*provider_id)
            .with_context(|| format!("failed registering provider {provider_id}"))?;
        if args.io_depth > 0 {
            provider.set_io_provider(Some(common::IoProvider::new(args.io_depth)?));
        }
        for class in &args.classes {
            provider
                .register_migration_class(class, common::PROVIDER_ID_ANY, logging_class(class))
                .with_context(|| format!("failed registering class {class:?}"))?;
        }
    }
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
        _ = service.wait() => {}
    }
    service.shutdown().await;
    Ok(())
}
