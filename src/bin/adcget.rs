//! adcget: fetch one file from an ADC hub, or over plain HTTP(S).
//!
//! Usable as a Portage fetch command:
//! `FETCHCOMMAND="adcget --output \"\${DISTDIR}/\${FILE}\" \"\${URI}\""`

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tokio::io::AsyncWriteExt;
use tracing::{debug, Level};
use url::Url;

use adc_client::utils::logging::init_logging;
use adc_client::utils::tth::ENCODED_LEN;
use adc_client::{
    AdcConfig, DownloadConfig, DownloadDispatcher, HubEndpoint, HubSession, Identifier, Search,
    TigerTreeHash,
};

/// Hash of empty content, used as the "no hash given" default.
const EMPTY_TTH: &str = "LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ";

const MAGNET_TIGER: &str = "urn:tree:tiger:";

/// Download files from ADC hubs as well as plain http and https services
#[derive(Parser, Debug)]
#[command(name = "adcget")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Search for a given Tiger tree hash
    #[arg(long, default_value = EMPTY_TTH)]
    tth: String,

    /// Write the download to this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// How long to wait for a verified transfer (e.g. 8s, 500ms, 2m)
    #[arg(long, default_value = "8s", value_parser = parse_duration)]
    timeout: Duration,

    /// Ask peers for compressed transfers
    #[arg(long)]
    compress: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Nick to use on the hub
    #[arg(long)]
    nick: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// adc://, adcs://, magnet:, http:// or https:// URL
    url: String,
}

fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration {text:?}"))?;
    let seconds = match unit {
        "ms" => value / 1000.0,
        "" | "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        other => return Err(format!("unknown duration unit {other:?}")),
    };
    Duration::try_from_secs_f64(seconds).map_err(|e| e.to_string())
}

/// What a URL (or magnet link) asks for.
struct Request {
    url: Url,
    tth: Option<TigerTreeHash>,
    output: Option<PathBuf>,
}

fn resolve(cli: &Cli) -> anyhow::Result<Request> {
    let url = Url::parse(&cli.url).with_context(|| format!("URL error: {}", cli.url))?;
    let mut tth = match cli.tth.as_str() {
        EMPTY_TTH => None,
        text => Some(text.parse::<TigerTreeHash>().context("invalid TTH")?),
    };
    let mut output = cli.output.clone();

    if url.scheme() != "magnet" {
        return Ok(Request { url, tth, output });
    }

    let mut hub = None;
    for (key, value) in url.query_pairs() {
        match &*key {
            "dn" if output.is_none() => output = Some(PathBuf::from(value.into_owned())),
            "xt" => {
                let start = value
                    .find(MAGNET_TIGER)
                    .ok_or_else(|| anyhow!("tiger tree hash not specified in magnet link"))?
                    + MAGNET_TIGER.len();
                let hash = value
                    .get(start..start + ENCODED_LEN)
                    .ok_or_else(|| anyhow!("truncated tiger tree hash in magnet link"))?;
                tth = Some(hash.parse().context("invalid TTH in magnet link")?);
            }
            "xs" if hub.is_none() => {
                hub = Some(Url::parse(&value).context("error parsing magnet xs URL")?)
            }
            _ => {}
        }
    }
    let url = hub.ok_or_else(|| anyhow!("hub URL not encoded in magnet link, cannot continue"))?;
    Ok(Request { url, tth, output })
}

fn load_config(cli: &Cli) -> anyhow::Result<AdcConfig> {
    let mut config = match &cli.config {
        Some(path) => AdcConfig::from_file(path)?,
        None => AdcConfig::default(),
    };
    config.apply_env();
    if let Some(nick) = &cli.nick {
        config.hub.nick = nick.clone();
    }
    if cli.compress {
        config.download.compress = true;
    }
    if cli.verbose {
        config.logging.log_level = Level::DEBUG;
    }
    config.validate_strict()?;
    Ok(config)
}

async fn adc_download(
    config: &AdcConfig,
    request: Request,
    timeout: Duration,
) -> anyhow::Result<Option<u64>> {
    let endpoint = HubEndpoint::from_url(&request.url)?;
    let mut rng = StdRng::from_os_rng();
    let mut search = Search::new(&mut rng);

    let download = match request.tth {
        Some(tth) => {
            let output = request
                .output
                .ok_or_else(|| anyhow!("no output file specified"))?;
            search.add_tth(tth);
            DownloadConfig::new(output).with_hash(tth)
        }
        None => {
            let name = endpoint
                .file_name()
                .ok_or_else(|| anyhow!("URL names no file and no TTH was given"))?
                .to_string();
            search.add_include(name.as_str());
            let output = request.output.unwrap_or_else(|| PathBuf::from(&name));
            DownloadConfig::new(output).with_file_name(name)
        }
    }
    .with_settings(&config.download);
    let target = download.output.display().to_string();

    let mut seed = [0u8; 24];
    rng.fill_bytes(&mut seed);
    let pid = Identifier::private(seed.to_vec());

    let session = HubSession::connect(pid, &endpoint, &config.hub, rng)
        .await
        .context("could not connect")?;

    let mut dispatcher =
        DownloadDispatcher::new(download, session.connector(&config.download)).await?;
    search.set_result_channel(dispatcher.result_channel());
    let done = dispatcher
        .final_channel()
        .ok_or_else(|| anyhow!("final channel already taken"))?;

    session.search(search).await?;
    tokio::spawn(dispatcher.run(timeout));

    let size = done.await.context("dispatcher stopped without an outcome")?;
    session.close().await;
    if size == 0 {
        eprintln!("failed to find {target}");
        return Ok(None);
    }
    Ok(Some(size))
}

async fn http_download(request: Request) -> anyhow::Result<Option<u64>> {
    let output = match request.output {
        Some(output) => output,
        None => request
            .url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|name| !name.is_empty())
            .map(PathBuf::from)
            .ok_or_else(|| anyhow!("no output file specified"))?,
    };

    let mut response = reqwest::get(request.url.clone())
        .await?
        .error_for_status()?;
    let mut file = tokio::fs::File::create(&output)
        .await
        .with_context(|| format!("cannot create {}", output.display()))?;

    let mut size = 0u64;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        size += chunk.len() as u64;
    }
    file.flush().await?;
    debug!(bytes = size, url = %request.url, "http download complete");
    Ok(Some(size))
}

async fn run(cli: Cli) -> anyhow::Result<Option<u64>> {
    let config = load_config(&cli)?;
    init_logging(&config.logging)?;

    let request = resolve(&cli)?;
    match request.url.scheme() {
        "adc" | "adcs" => adc_download(&config, request, cli.timeout).await,
        "http" | "https" => http_download(request).await,
        other => bail!("unsupported or unknown URL scheme: {other}"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let start = Instant::now();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(Some(size)) => {
            println!("Downloaded {size} bytes in {:.2?}", start.elapsed());
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
