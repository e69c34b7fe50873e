//! Nocturn pipeline-operations daemon.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use nocturn_core::config::AppConfig;
use nocturn_ops::cycle::proc_date_today;
use nocturn_ops::selector::{EpochFilter, select_coadd_inputs};
use nocturn_ops::{OpsContext, OpsError, PipelineCycle};
use std::sync::Arc;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Nocturn - pipeline operations control plane
#[derive(Parser, Debug)]
#[command(name = "nocturnd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "NOCTURN_CONFIG",
        default_value = "config/nocturn.toml"
    )]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daily cycle: continuously, or one-shot for a given date.
    Run {
        /// One-shot processing date (YYYYMMDD). Continuous loop if omitted.
        #[arg(long)]
        date: Option<String>,
        /// Start of the observation window (RFC 3339).
        #[arg(long, env = "STARTDATETIME")]
        start: String,
        /// End of the observation window (RFC 3339).
        #[arg(long, env = "ENDDATETIME")]
        end: String,
    },
    /// Show one job's registry record.
    Job {
        #[arg(long)]
        jid: i64,
    },
    /// Run the overlap selector for a sky tile and print the ranked inputs.
    Field {
        #[arg(long)]
        field_id: i64,
        #[arg(long)]
        fid: i16,
        /// Keep inputs strictly earlier than this epoch (mjd).
        #[arg(long, conflicts_with_all = ["mjd_start", "mjd_end"])]
        mjd_before: Option<f64>,
        /// Reference-window mode: inclusive lower epoch bound (mjd).
        #[arg(long, requires = "mjd_end")]
        mjd_start: Option<f64>,
        /// Reference-window mode: inclusive upper epoch bound (mjd).
        #[arg(long, requires = "mjd_start")]
        mjd_end: Option<f64>,
    },
}

fn main() {
    let exit_code = match run() {
        Ok(()) => 0,
        Err(err) => {
            let code = err
                .downcast_ref::<OpsError>()
                .map(OpsError::exit_code)
                .unwrap_or(nocturn_core::exitcode::CONFIG_ERROR);
            if code == nocturn_core::exitcode::INTERRUPTED {
                tracing::info!("Terminated by operator");
            } else {
                tracing::error!(error = %err, exit_code = code, "Terminating on error");
            }
            code
        }
    };
    std::process::exit(exit_code);
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nocturn=info,nocturnd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config: AppConfig = Figment::new()
        .merge(Toml::file(&args.config))
        .merge(Env::prefixed("NOCTURN_").split("__"))
        .extract()
        .with_context(|| format!("loading configuration from {}", args.config))?;

    let batch = nocturn_batch::from_config(&config.batch)
        .await
        .context("constructing batch client")?;
    let ctx = Arc::new(
        OpsContext::from_config(config, batch)
            .await
            .context("assembling operations context")?,
    );

    // A signal requests a cooperative stop; the loop finishes its current
    // stage and exits between iterations.
    let stop_ctx = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, will stop after the current stage");
            stop_ctx.request_stop();
        }
    });

    match args.command {
        Command::Run { date, start, end } => {
            let window = (
                OffsetDateTime::parse(&start, &Rfc3339)
                    .with_context(|| format!("invalid start datetime: {start}"))?,
                OffsetDateTime::parse(&end, &Rfc3339)
                    .with_context(|| format!("invalid end datetime: {end}"))?,
            );

            let cycle = PipelineCycle::new(ctx);
            match date {
                Some(date) => {
                    let report = cycle.run_for_date(&date, window).await?;
                    tracing::info!(?report, date, "One-shot cycle finished");
                }
                None => {
                    cycle.run_loop(window).await?;
                }
            }
        }
        Command::Job { jid } => {
            let job = ctx
                .registry
                .get_job(jid)
                .await
                .map_err(OpsError::from)?
                .ok_or_else(|| OpsError::Config(format!("no such job: {jid}")))?;
            println!(
                "jid={} ppid={} status={} outcome={} exit_code={} external_id={} proc_date={}",
                job.jid,
                job.ppid,
                job.status,
                job.outcome.as_deref().unwrap_or("-"),
                job.exit_code.map_or("-".to_string(), |c| c.to_string()),
                job.external_id.as_deref().unwrap_or("-"),
                job.proc_date,
            );
        }
        Command::Field {
            field_id,
            fid,
            mjd_before,
            mjd_start,
            mjd_end,
        } => {
            let epoch = match (mjd_before, mjd_start, mjd_end) {
                (Some(before), None, None) => EpochFilter::Before(before),
                (None, Some(start), Some(end)) => EpochFilter::Window { start, end },
                (None, None, None) => {
                    // Everything observed so far.
                    EpochFilter::Before(f64::MAX)
                }
                _ => unreachable!("clap enforces mode exclusivity"),
            };

            let inputs = select_coadd_inputs(
                ctx.registry.as_ref(),
                &ctx.tessellation,
                field_id,
                fid,
                epoch,
                None,
                ctx.config.selector.cone_radius_deg,
            )
            .await?;

            println!("{} coaddition inputs for field {field_id} fid {fid}:", inputs.len());
            for input in inputs {
                println!(
                    "rid={} expid={} chipid={} mjdobs={:.5} sep={:.4} deg {}",
                    input.rid,
                    input.expid,
                    input.chipid,
                    input.mjdobs,
                    input.separation_deg,
                    input.filename,
                );
            }
        }
    }

    tracing::info!(proc_date = %proc_date_today(), "nocturnd exiting normally");
    Ok(())
}
