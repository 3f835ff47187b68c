use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use cq_common::config::DEFAULT_GLOBAL_SHUTDOWN_FLAG;
use cq_common::{ClientId, RowBatch, SideStream};
use cq_execution::LexiconClassifier;
use cq_worker::{ClientResults, LocalCluster, Shutdown, TopologySpec};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: cq-local --movies <csv> [--ratings <csv>] [--credits <csv>] \
[--client <id>]... [--filters N] [--joiners N] [--aggregators N] [--pnl N] \
[--batch-rows N] [--state-dir DIR] [--timeout-secs N]";

fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

struct Args {
    movies: PathBuf,
    ratings: Option<PathBuf>,
    credits: Option<PathBuf>,
    clients: Vec<String>,
    spec: TopologySpec,
    batch_rows: usize,
    state_dir: PathBuf,
    timeout: Duration,
}

fn parse_num<T: std::str::FromStr>(flag: &str, raw: Option<String>) -> Result<T, String> {
    let raw = raw.ok_or_else(|| format!("{flag} needs a value"))?;
    raw.parse::<T>()
        .map_err(|_| format!("{flag}: '{raw}' is not a valid number"))
}

fn parse_args(mut raw: impl Iterator<Item = String>) -> Result<Args, String> {
    let mut movies = None;
    let mut ratings = None;
    let mut credits = None;
    let mut clients = Vec::new();
    let mut spec = TopologySpec::from_env().map_err(|e| e.to_string())?;
    let mut batch_rows = 500;
    let mut state_dir = PathBuf::from(env_or_default("CQ_STATE_DIR", "/tmp/cq-local"));
    let mut timeout = Duration::from_secs(300);

    while let Some(flag) = raw.next() {
        match flag.as_str() {
            "--movies" => movies = raw.next().map(PathBuf::from),
            "--ratings" => ratings = raw.next().map(PathBuf::from),
            "--credits" => credits = raw.next().map(PathBuf::from),
            "--client" => clients.push(raw.next().ok_or("--client needs a value")?),
            "--filters" => spec.filters = parse_num(&flag, raw.next())?,
            "--joiners" => spec.joiners = parse_num(&flag, raw.next())?,
            "--aggregators" => spec.aggregators = parse_num(&flag, raw.next())?,
            "--pnl" => spec.pnl = parse_num(&flag, raw.next())?,
            "--batch-rows" => batch_rows = parse_num(&flag, raw.next())?,
            "--state-dir" => {
                state_dir = raw.next().map(PathBuf::from).ok_or("--state-dir needs a value")?
            }
            "--timeout-secs" => timeout = Duration::from_secs(parse_num(&flag, raw.next())?),
            "-h" | "--help" => return Err(USAGE.to_string()),
            other => return Err(format!("unknown argument '{other}'\n{USAGE}")),
        }
    }
    if clients.is_empty() {
        let session = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        clients.push(format!("client-{session}"));
    }
    Ok(Args {
        movies: movies.ok_or_else(|| format!("--movies is required\n{USAGE}"))?,
        ratings,
        credits,
        clients,
        spec,
        batch_rows: batch_rows.max(1),
        state_dir,
        timeout,
    })
}

fn load(path: Option<&Path>) -> Result<RowBatch, Box<dyn std::error::Error>> {
    match path {
        Some(p) => Ok(RowBatch::from_csv(&std::fs::read_to_string(p)?)?),
        None => Ok(RowBatch::default()),
    }
}

async fn drive(
    cluster: &mut LocalCluster,
    args: &Args,
    movies: &RowBatch,
    ratings: &RowBatch,
    credits: &RowBatch,
) -> cq_common::Result<Vec<(ClientId, ClientResults)>> {
    let clients = args.clients.iter().map(ClientId::new).collect::<Vec<_>>();
    for client in &clients {
        for chunk in movies.chunks(args.batch_rows) {
            cluster.submit_movies(client, &chunk).await?;
        }
        for chunk in ratings.chunks(args.batch_rows) {
            cluster.submit_side(client, SideStream::Ratings, &chunk).await?;
        }
        for chunk in credits.chunks(args.batch_rows) {
            cluster.submit_side(client, SideStream::Credits, &chunk).await?;
        }
        cluster.finish_client(client).await?;
        info!(client = %client, "client submitted");
    }
    let mut out = Vec::with_capacity(clients.len());
    for client in clients {
        let results = cluster.collect(&client, args.timeout).await?;
        out.push((client, results));
    }
    Ok(out)
}

fn print_results(client: &ClientId, results: &ClientResults) -> cq_common::Result<()> {
    for query in cq_common::QueryId::ALL {
        println!("== client {client} / {} ==", query.header_name());
        print!("{}", results.query(query).to_csv()?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = match parse_args(env::args().skip(1)) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    #[cfg(feature = "metrics-http")]
    if let Ok(raw) = env::var("CQ_METRICS_ADDR") {
        let addr: std::net::SocketAddr = raw.parse()?;
        tokio::spawn(async move {
            if let Err(err) = cq_common::run_metrics_exporter(addr).await {
                warn!(error = %err, "metrics exporter stopped");
            }
        });
    }

    let movies = load(Some(&args.movies))?;
    let ratings = load(args.ratings.as_deref())?;
    let credits = load(args.credits.as_deref())?;
    let flag = PathBuf::from(env_or_default("CQ_GLOBAL_SHUTDOWN_FLAG", DEFAULT_GLOBAL_SHUTDOWN_FLAG));
    std::fs::create_dir_all(&args.state_dir)?;

    let mut cluster = LocalCluster::start(
        &args.spec,
        &args.state_dir,
        Arc::new(LexiconClassifier::default()),
    )
    .await?;
    info!(
        nodes = cluster.topology().nodes.len(),
        clients = args.clients.len(),
        movies = movies.len(),
        ratings = ratings.len(),
        credits = credits.len(),
        "cq-local started"
    );

    let outcome = tokio::select! {
        res = drive(&mut cluster, &args, &movies, &ratings, &credits) => Some(res),
        _ = tokio::signal::ctrl_c() => None,
    };
    let mode = Shutdown::from_flag(&flag);
    match outcome {
        Some(Ok(all)) => {
            for (client, results) in &all {
                print_results(client, results)?;
            }
            cluster.shutdown(mode).await?;
        }
        Some(Err(err)) => {
            warn!(error = %err, "run failed");
            cluster.shutdown(mode).await?;
            return Err(err.into());
        }
        None => {
            info!(mode = ?mode, "interrupted, shutting down");
            cluster.shutdown(mode).await?;
        }
    }
    Ok(())
}
