use std::rc::Rc;

use clap::{CommandFactory, FromArgMatches};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::LocalSet;

use gridmanager::GM_VERSION;
use gridmanager::common::cli::{CommonOpts, RootOptions, RunOpts, SubCommand, TransferdOpts};
use gridmanager::common::setup::setup_logging;
use gridmanager::manager::{create_manager_service, process_transports};
use gridmanager::queue::{FileJobQueue, JobConstraint, queue_ref};
use gridmanager::staging::ProcessScheduler;
use gridmanager::transferd::{TransferDaemonConfigBuilder, run_transfer_daemon};

async fn command_run(common: CommonOpts, opts: RunOpts) -> anyhow::Result<()> {
    let config = common.load_config()?;
    let queue = queue_ref(FileJobQueue::open(&opts.queue_file)?);
    let scheduler = Rc::new(ProcessScheduler::new(config.scratch_dir.clone()));
    log::info!(
        "Grid manager {GM_VERSION} is managing jobs of {}",
        opts.queue_file.display()
    );
    let (service, process) =
        create_manager_service(config, queue, process_transports(), scheduler)?;

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let signals = async {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Received SIGINT, attempting to stop");
                    break;
                }
                _ = terminate.recv() => {
                    log::info!("Received SIGTERM, attempting to stop");
                    break;
                }
                _ = hangup.recv() => {
                    log::info!("Received SIGHUP, reloading configuration");
                    match common.load_config() {
                        Ok(config) => {
                            if let Err(error) = service.reconfig(config).await {
                                log::error!("{error:?}");
                            }
                        }
                        Err(error) => log::error!("Cannot load configuration: {error}"),
                    }
                }
            }
        }
        service.quit();
    };
    tokio::join!(process, signals);
    Ok(())
}

async fn command_transferd(common: CommonOpts, opts: TransferdOpts) -> anyhow::Result<()> {
    let config = common.load_config()?;
    let constraint = config
        .constraint
        .as_deref()
        .map(JobConstraint::parse)
        .transpose()?;
    let daemon_config = TransferDaemonConfigBuilder::default()
        .port(opts.port)
        .key_file(opts.key_file)
        .sandbox_root(config.scratch_dir.join("sandboxes"))
        .max_transfers(opts.max_transfers)
        .constraint(constraint)
        .build()?;
    tokio::select! {
        result = run_transfer_daemon(daemon_config) => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received SIGINT, stopping transfer daemon");
            Ok(())
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> gridmanager::Result<()> {
    let matches = RootOptions::command().get_matches();
    let RootOptions { common, subcmd } = match RootOptions::from_arg_matches(&matches) {
        Ok(opts) => opts,
        Err(error) => error.exit(),
    };

    setup_logging(common.debug);

    let local_set = LocalSet::new();
    let result = local_set
        .run_until(async move {
            match subcmd {
                SubCommand::Run(opts) => command_run(common, opts).await,
                SubCommand::Transferd(opts) => command_transferd(common, opts).await,
            }
        })
        .await;

    if let Err(error) = result {
        log::error!("{error:?}");
        std::process::exit(1);
    }
    Ok(())
}
