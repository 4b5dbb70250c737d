use std::sync::Arc;

use is_terminal::IsTerminal;
use kube::runtime::events::Recorder;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use controller::*;

fn main() {
    use clap::{Arg, ArgAction, Command, ValueHint, crate_authors, crate_name, crate_version};
    use std::process;
    let cmd = Command::new(crate_name!())
        .version(crate_version!())
        .author(crate_authors!())
        .about("deployer controller for component-version manifests")
        .subcommand_required(true)
        .subcommands([Command::new("run").about("run controllers").args([
            Arg::new("introspection_address")
                .long("introspection-bind-address")
                .help("address to bind for the HTTP introspection server")
                .default_value("[::]:8089"),
            Arg::new("plugin_socket")
                .long("plugin-socket")
                .env("PLUGIN_MANAGER_SOCKET")
                .help("unix socket of the plugin manager")
                .value_hint(ValueHint::FilePath)
                .default_value("/run/deployer/plugin.sock"),
            Arg::new("resolver_workers")
                .long("resolver-workers")
                .help("number of concurrent resolution workers")
                .default_value("4"),
            Arg::new("resolver_queue_depth")
                .long("resolver-queue-depth")
                .help("bounded resolution queue size")
                .default_value("64"),
            Arg::new("cache_capacity")
                .long("cache-capacity")
                .help("descriptor cache capacity")
                .default_value("128"),
            Arg::new("cache_ttl")
                .long("cache-ttl-seconds")
                .help("descriptor cache TTL in seconds, 0 disables expiry")
                .default_value("0"),
            Arg::new("apply_concurrency")
                .long("apply-concurrency")
                .help("concurrent SSA operations per reconcile")
                .default_value("4"),
            Arg::new("controllers")
                .action(ArgAction::Append)
                .default_values(["deployer"]),
        ])]);

    if let Err(e) = match cmd.get_matches().subcommand() {
        Some(("run", m)) => match Args::try_from(m) {
            Ok(args) => startup(args),
            Err(e) => Err(e),
        },
        _ => unreachable!(),
    } {
        eprintln!("{e}");
        process::exit(1);
    }
}

struct Args {
    introspection_address: std::net::SocketAddr,
    plugin_socket: String,
    resolver_workers: usize,
    resolver_queue_depth: usize,
    cache_capacity: usize,
    cache_ttl: u64,
    apply_concurrency: usize,
    controllers: Vec<String>,
}

impl TryFrom<&clap::ArgMatches> for Args {
    type Error = Error;

    fn try_from(m: &clap::ArgMatches) -> Result<Self> {
        fn num(m: &clap::ArgMatches, key: &str) -> Result<usize> {
            m.get_one::<String>(key)
                .expect("defaulted arg")
                .parse()
                .map_err(|err| Error::Other(anyhow::anyhow!("bad value for {key}: {err}")))
        }
        Ok(Self {
            introspection_address: m
                .get_one::<String>("introspection_address")
                .expect("defaulted arg")
                .parse()?,
            plugin_socket: m
                .get_one::<String>("plugin_socket")
                .expect("defaulted arg")
                .clone(),
            resolver_workers: num(m, "resolver_workers")?,
            resolver_queue_depth: num(m, "resolver_queue_depth")?,
            cache_capacity: num(m, "cache_capacity")?,
            cache_ttl: u64::try_from(num(m, "cache_ttl")?)
                .map_err(|err| Error::Other(anyhow::anyhow!("bad value for cache_ttl: {err}")))?,
            apply_concurrency: num(m, "apply_concurrency")?,
            controllers: m
                .get_many::<String>("controllers")
                .expect("defaulted arg")
                .map(Clone::clone)
                .collect(),
        })
    }
}

fn startup(args: Args) -> controller::Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::{runtime, signal};
    use tracing_subscriber::{filter::EnvFilter, prelude::*};

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let collector = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(if std::io::stdout().is_terminal() {
            Some(tracing_subscriber::fmt::layer())
        } else {
            None
        })
        .with(if std::io::stdout().is_terminal() {
            None
        } else {
            Some(tracing_subscriber::fmt::layer().json())
        });
    tracing::subscriber::set_global_default(collector)?;
    let prom = PrometheusBuilder::new().with_http_listener(args.introspection_address);

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let token = CancellationToken::new();
    rt.handle().spawn(async move {
        if let Err(e) = prom.install() {
            error!("error setting up prometheus endpoint: {e}");
        }
    });
    let ctlstop = token.clone();
    rt.handle().spawn(async move {
        if let Err(err) = signal::ctrl_c().await {
            error!("error reading SIGTERM: {err}");
        }
        token.cancel();
    });
    rt.block_on(run(args, ctlstop))
}

async fn run(args: Args, token: CancellationToken) -> controller::Result<()> {
    use tokio::task;

    use controller::plugin::PluginClient;
    use controller::resolve::{Resolver, ResolverOptions};
    use controller::watches::WatchRegistry;

    let config = kube::Config::infer().await?;
    let client = kube::client::ClientBuilder::try_from(config.clone())?.build();
    let discovery = kube::Discovery::new(client.clone()).run().await?;

    let metrics = controller::metrics::Metrics::default();
    let (triggers_tx, triggers_rx) = mpsc::channel(256);
    let resolver = Resolver::spawn(
        client.clone(),
        PluginClient::new(&args.plugin_socket),
        ResolverOptions {
            workers: args.resolver_workers,
            queue_depth: args.resolver_queue_depth,
            cache_capacity: args.cache_capacity,
            cache_ttl: std::time::Duration::from_secs(args.cache_ttl),
        },
        triggers_tx.clone(),
        metrics.resolve.clone(),
        token.clone(),
    );
    let watches = WatchRegistry::new(client.clone(), triggers_tx);

    info!(socket = args.plugin_socket, "plugin manager configured");
    info!("setup done, starting controllers");
    let ctx = Arc::new(Context {
        client: client.clone(),
        recorder: Recorder::new(client, REPORTER.clone()),
        resolver,
        watches,
        discovery: Arc::new(discovery),
        metrics,
        apply_concurrency: args.apply_concurrency,
    });

    let mut triggers_rx = Some(triggers_rx);
    let mut ctrls = task::JoinSet::new();
    for name in &args.controllers {
        let fut = match name.to_lowercase().as_str() {
            "deployer" | "deployers" => {
                let Some(rx) = triggers_rx.take() else {
                    warn!(name, "duplicate controller name, skipping");
                    continue;
                };
                deployers::controller(token.clone(), ctx.clone(), rx)?
            }
            other => {
                warn!(name = other, "unrecognized controller name, skipping");
                continue;
            }
        };
        ctrls.spawn(fut);
    }
    while let Some(res) = ctrls.join_next().await {
        match res {
            Err(e) => error!("error starting controller: {e}"),
            Ok(res) => {
                if let Err(e) = res {
                    error!("error from controller: {e}");
                    token.cancel();
                }
            }
        };
    }
    Ok(())
}
