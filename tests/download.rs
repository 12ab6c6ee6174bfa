//! Download dispatcher tests with scripted peers.
//!
//! Peers live on in-memory duplex streams behind a test connector, so these
//! exercise result selection, verification, fallback and the output file
//! without a hub.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use adc_client::core::codec::AdcCodec;
use adc_client::service::peer::{PeerConnection, PeerOptions};
use adc_client::transport::BoxedStream;
use adc_client::{
    DownloadConfig, DownloadDispatcher, Identifier, Message, MessageType, PeerConnector,
    ProtocolError, Result, SearchResult, TigerTreeHash,
};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use futures::{SinkExt, StreamExt};
use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
use tokio_util::codec::Framed;

/// How a scripted peer answers `CGET`.
#[derive(Clone)]
enum Peer {
    Serve(Vec<u8>),
    /// Advertises `ZLIG` and compresses when asked to
    Zlib(Vec<u8>),
    /// Also answers `tthl` with leaves of the given segment size
    Leaves(Vec<u8>, usize),
    Refuse,
    /// Announces the right length, sends the wrong bytes
    Garbage(Vec<u8>),
    /// Announces the full length and hangs up after this many bytes
    Short(Vec<u8>, usize),
}

#[derive(Default)]
struct Stats {
    opened: AtomicUsize,
    compressed: AtomicUsize,
    leaves: AtomicUsize,
}

struct Scripted {
    peers: HashMap<String, Peer>,
    stats: Arc<Stats>,
    options: PeerOptions,
}

impl Scripted {
    fn new(peers: impl IntoIterator<Item = (&'static str, Peer)>) -> (Self, Arc<Stats>) {
        let stats = Arc::new(Stats::default());
        let connector = Self {
            peers: peers
                .into_iter()
                .map(|(sid, peer)| (sid.to_string(), peer))
                .collect(),
            stats: stats.clone(),
            options: PeerOptions {
                idle_timeout: Duration::from_secs(2),
                ..PeerOptions::default()
            },
        };
        (connector, stats)
    }
}

impl PeerConnector for Scripted {
    async fn open(&self, result: &SearchResult) -> Result<PeerConnection> {
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        let peer = self
            .peers
            .get(result.source.as_str())
            .cloned()
            .ok_or_else(|| ProtocolError::ConnectionError("no such peer".into()))?;

        let (ours, theirs) = duplex(16 * 1024);
        tokio::spawn(serve(theirs, peer, self.stats.clone()));
        let stream: BoxedStream = Box::new(ours);
        PeerConnection::handshake(stream, &Identifier::from_raw(vec![1u8; 24]), "tok", &self.options)
            .await
    }
}

/// Gives up on every peer, slowly.
struct Stalling {
    delay: Duration,
    opened: Arc<AtomicUsize>,
}

impl PeerConnector for Stalling {
    async fn open(&self, _result: &SearchResult) -> Result<PeerConnection> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Err(ProtocolError::Timeout)
    }
}

fn line(text: &str) -> Message {
    Message::parse(text).expect("valid test line")
}

fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn leaves_of(content: &[u8], segment: usize) -> Vec<u8> {
    content
        .chunks(segment)
        .flat_map(|chunk| TigerTreeHash::of(chunk).as_bytes().to_vec())
        .collect()
}

async fn serve(io: DuplexStream, peer: Peer, stats: Arc<Stats>) {
    let mut wire = Framed::new(io, AdcCodec::default());
    let Some(Ok(_sup)) = wire.next().await else { return };
    let sup = match peer {
        Peer::Zlib(_) => "CSUP ADBASE ADTIGR ADZLIG",
        _ => "CSUP ADBASE ADTIGR",
    };
    if wire.send(line(sup)).await.is_err() {
        return;
    }
    let inf = format!("CINF ID{}", Identifier::from_raw(vec![3u8; 24]));
    if wire.send(line(&inf)).await.is_err() {
        return;
    }
    let Some(Ok(_inf)) = wire.next().await else { return };

    while let Some(Ok(get)) = wire.next().await {
        let kind = get.param(0).unwrap_or_default().to_string();
        let ident = get.param(1).unwrap_or_default().to_string();
        let zl1 = get.params().iter().any(|p| p == "ZL1");

        let (body, cut) = match (&peer, kind.as_str()) {
            (Peer::Leaves(content, segment), "tthl") => {
                stats.leaves.fetch_add(1, Ordering::SeqCst);
                (leaves_of(content, *segment), None)
            }
            (Peer::Refuse, _) | (_, "tthl") => {
                let _ = wire.send(line("CSTA 151 File\\snot\\savailable")).await;
                continue;
            }
            (Peer::Serve(content) | Peer::Zlib(content) | Peer::Leaves(content, _), _) => {
                (content.clone(), None)
            }
            (Peer::Garbage(content), _) => (content.iter().map(|b| b ^ 0xff).collect(), None),
            (Peer::Short(content, sent), _) => (content.clone(), Some(*sent)),
        };

        let len = body.len().to_string();
        let mut params = vec![kind, ident, "0".to_string(), len];
        let payload = if zl1 {
            stats.compressed.fetch_add(1, Ordering::SeqCst);
            params.push("ZL1".to_string());
            zlib(&body)
        } else {
            body
        };
        if wire
            .send(Message::new(MessageType::Client, "SND", params))
            .await
            .is_err()
        {
            return;
        }
        let payload = match cut {
            Some(sent) => &payload[..sent],
            None => &payload[..],
        };
        if wire.get_mut().write_all(payload).await.is_err() {
            return;
        }
        let _ = wire.get_mut().flush().await;
        if cut.is_some() {
            return;
        }
    }
}

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 131 % 253) as u8).collect()
}

fn offer(sid: &str, name: &str, size: usize, tth: Option<TigerTreeHash>) -> SearchResult {
    SearchResult {
        file_name: name.to_string(),
        size: size as u64,
        source: Identifier::session(sid).unwrap(),
        client_id: None,
        tth,
        slots: Some(1),
        token: Some("tok".to_string()),
    }
}

/// Feed `results`, close the channel and run to completion.
async fn download<C: PeerConnector>(
    config: DownloadConfig,
    connector: C,
    results: Vec<SearchResult>,
    timeout: Duration,
) -> u64 {
    let mut dispatcher = DownloadDispatcher::new(config, connector).await.unwrap();
    let done = dispatcher.final_channel().unwrap();
    let tx = dispatcher.result_channel();
    let feeder = tokio::spawn(async move {
        for result in results {
            if tx.send(result).await.is_err() {
                break;
            }
        }
    });

    let size = dispatcher.run(timeout).await;
    feeder.await.unwrap();
    assert_eq!(done.await.unwrap(), size, "final channel must agree with run");
    size
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).unwrap().len()
}

#[tokio::test]
async fn test_first_verified_peer_wins() {
    let data = content(5000);
    let tth = TigerTreeHash::of(&data);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.bin");

    let (connector, stats) = Scripted::new([
        ("AAAA", Peer::Refuse),
        ("AAAB", Peer::Garbage(data.clone())),
        ("AAAC", Peer::Serve(data.clone())),
        ("AAAD", Peer::Serve(data.clone())),
    ]);
    let results = ["AAAA", "AAAB", "AAAC", "AAAD"]
        .iter()
        .map(|sid| offer(sid, "/share/out.bin", data.len(), Some(tth)))
        .collect();

    let size = download(
        DownloadConfig::new(&path).with_hash(tth),
        connector,
        results,
        Duration::from_secs(5),
    )
    .await;

    assert_eq!(size, 5000);
    assert_eq!(std::fs::read(&path).unwrap(), data);
    assert_eq!(stats.opened.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_match_followed_by_noise() {
    let data = content(1024);
    let tth = TigerTreeHash::of(&data);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.bin");

    for noise in [0usize, 1, 40] {
        let (connector, stats) = Scripted::new([("AAAA", Peer::Serve(data.clone()))]);
        let mut results = vec![offer("AAAA", "/share/out.bin", data.len(), Some(tth))];
        results.extend(
            (0..noise).map(|_| offer("AAAA", "/share/other", 5, Some(TigerTreeHash::of(b"other")))),
        );

        let size = download(
            DownloadConfig::new(&path).with_hash(tth),
            connector,
            results,
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(size, 1024, "with {noise} trailing results");
        assert_eq!(std::fs::read(&path).unwrap(), data);
        assert_eq!(stats.opened.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn test_mismatched_bytes_wait_for_deadline() {
    let data = content(1024);
    let tth = TigerTreeHash::of(&data);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.bin");

    let (connector, stats) = Scripted::new([("AAAA", Peer::Garbage(data.clone()))]);
    let mut dispatcher = DownloadDispatcher::new(DownloadConfig::new(&path).with_hash(tth), connector)
        .await
        .unwrap();
    let done = dispatcher.final_channel().unwrap();
    let tx = dispatcher.result_channel();
    tx.send(offer("AAAA", "/share/out.bin", data.len(), Some(tth)))
        .await
        .unwrap();

    let started = Instant::now();
    let size = dispatcher.run(Duration::from_millis(500)).await;
    assert_eq!(size, 0);
    assert_eq!(done.await.unwrap(), 0);
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(stats.opened.load(Ordering::SeqCst), 1);
    assert_eq!(file_len(&path), 0);
    drop(tx);
}

#[tokio::test]
async fn test_corrupt_only_leaves_empty_file() {
    let data = content(3000);
    let tth = TigerTreeHash::of(&data);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.bin");

    let (connector, stats) = Scripted::new([
        ("AAAA", Peer::Garbage(data.clone())),
        ("AAAB", Peer::Short(data.clone(), 1000)),
    ]);
    let results = vec![
        offer("AAAA", "/a", data.len(), Some(tth)),
        offer("AAAB", "/b", data.len(), Some(tth)),
    ];

    let size = download(
        DownloadConfig::new(&path).with_hash(tth),
        connector,
        results,
        Duration::from_secs(1),
    )
    .await;

    assert_eq!(size, 0);
    assert_eq!(file_len(&path), 0);
    assert_eq!(stats.opened.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_short_transfer_falls_back_to_next_peer() {
    let data = content(4096);
    let tth = TigerTreeHash::of(&data);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.bin");

    let (connector, _stats) = Scripted::new([
        ("AAAA", Peer::Short(data.clone(), 2048)),
        ("AAAB", Peer::Serve(data.clone())),
    ]);
    let results = vec![
        offer("AAAA", "/a", data.len(), Some(tth)),
        offer("AAAB", "/b", data.len(), Some(tth)),
    ];

    let size = download(
        DownloadConfig::new(&path).with_hash(tth),
        connector,
        results,
        Duration::from_secs(5),
    )
    .await;

    assert_eq!(size, 4096);
    assert_eq!(std::fs::read(&path).unwrap(), data);
}

#[tokio::test]
async fn test_unwanted_results_never_connect() {
    let tth = TigerTreeHash::of(b"wanted");
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.bin");

    let (connector, stats) = Scripted::new([("AAAA", Peer::Serve(b"other".to_vec()))]);
    let mut dispatcher = DownloadDispatcher::new(DownloadConfig::new(&path).with_hash(tth), connector)
        .await
        .unwrap();
    let tx = dispatcher.result_channel();
    for _ in 0..5 {
        tx.send(offer("AAAA", "/other", 5, Some(TigerTreeHash::of(b"other"))))
            .await
            .unwrap();
    }
    tx.send(offer("AAAA", "/no-hash", 5, None)).await.unwrap();

    // The sender stays alive, so only the deadline can end the run.
    let started = Instant::now();
    let size = dispatcher.run(Duration::from_millis(300)).await;
    assert_eq!(size, 0);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(stats.opened.load(Ordering::SeqCst), 0);
    assert_eq!(file_len(&path), 0);
    drop(tx);
}

#[tokio::test]
async fn test_closed_channel_waits_for_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.bin");
    let (connector, _stats) = Scripted::new(Vec::<(&'static str, Peer)>::new());

    let started = Instant::now();
    let size = download(
        DownloadConfig::new(&path).with_file_name("out.bin"),
        connector,
        Vec::new(),
        Duration::from_millis(400),
    )
    .await;
    assert_eq!(size, 0);
    assert!(started.elapsed() >= Duration::from_millis(400));
}

#[tokio::test]
async fn test_no_attempt_starts_after_deadline() {
    let tth = TigerTreeHash::of(b"wanted");
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.bin");

    let opened = Arc::new(AtomicUsize::new(0));
    let connector = Stalling {
        delay: Duration::from_millis(300),
        opened: opened.clone(),
    };
    let mut dispatcher = DownloadDispatcher::new(DownloadConfig::new(&path).with_hash(tth), connector)
        .await
        .unwrap();
    let tx = dispatcher.result_channel();
    for sid in ["AAAA", "AAAB", "AAAC", "AAAD", "AAAE"] {
        tx.send(offer(sid, "/wanted", 6, Some(tth))).await.unwrap();
    }

    // The first attempt outlives the deadline; the queued offers must not
    // be tried after it.
    let started = Instant::now();
    let size = dispatcher.run(Duration::from_millis(100)).await;
    assert_eq!(size, 0);
    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_millis(900));
    drop(tx);
}

#[tokio::test]
async fn test_compressed_transfer() {
    let data = vec![b'z'; 20_000];
    let tth = TigerTreeHash::of(&data);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.bin");

    let (connector, stats) = Scripted::new([("AAAA", Peer::Zlib(data.clone()))]);
    let size = download(
        DownloadConfig::new(&path).with_hash(tth).with_compression(true),
        connector,
        vec![offer("AAAA", "/z", data.len(), Some(tth))],
        Duration::from_secs(5),
    )
    .await;

    assert_eq!(size, 20_000);
    assert_eq!(stats.compressed.load(Ordering::SeqCst), 1);
    assert_eq!(std::fs::read(&path).unwrap(), data);
}

#[tokio::test]
async fn test_uncompressed_unless_asked() {
    let data = content(2000);
    let tth = TigerTreeHash::of(&data);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.bin");

    let (connector, stats) = Scripted::new([("AAAA", Peer::Zlib(data.clone()))]);
    let size = download(
        DownloadConfig::new(&path).with_hash(tth),
        connector,
        vec![offer("AAAA", "/z", data.len(), Some(tth))],
        Duration::from_secs(5),
    )
    .await;

    assert_eq!(size, 2000);
    assert_eq!(stats.compressed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_large_files_fetch_leaves() {
    let data = content(96 * 1024);
    let tth = TigerTreeHash::of(&data);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.bin");

    let (connector, stats) = Scripted::new([("AAAA", Peer::Leaves(data.clone(), 32 * 1024))]);
    let size = download(
        DownloadConfig::new(&path).with_hash(tth),
        connector,
        vec![offer("AAAA", "/big", data.len(), Some(tth))],
        Duration::from_secs(10),
    )
    .await;

    assert_eq!(size, data.len() as u64);
    assert_eq!(stats.leaves.load(Ordering::SeqCst), 1);
    assert_eq!(std::fs::read(&path).unwrap(), data);
}

#[tokio::test]
async fn test_missing_leaves_fall_back_to_root() {
    let data = content(80 * 1024);
    let tth = TigerTreeHash::of(&data);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.bin");

    // Refuses tthl, serves the file.
    let (connector, stats) = Scripted::new([("AAAA", Peer::Serve(data.clone()))]);
    let size = download(
        DownloadConfig::new(&path).with_hash(tth),
        connector,
        vec![offer("AAAA", "/big", data.len(), Some(tth))],
        Duration::from_secs(10),
    )
    .await;

    assert_eq!(size, data.len() as u64);
    assert_eq!(stats.leaves.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_download_by_name_checks_size() {
    let data = content(1500);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");

    let (connector, _stats) = Scripted::new([
        ("AAAA", Peer::Serve(data.clone())),
        ("AAAB", Peer::Serve(data.clone())),
    ]);
    let results = vec![
        offer("AAAA", "/docs/notes.txt.bak", data.len(), None),
        // Advertises the wrong size, so the transfer cannot be trusted.
        offer("AAAA", "/docs/notes.txt", data.len() + 1, None),
        offer("AAAB", "/share/notes.txt", data.len(), None),
    ];

    let size = download(
        DownloadConfig::new(&path).with_file_name("notes.txt"),
        connector,
        results,
        Duration::from_secs(5),
    )
    .await;

    assert_eq!(size, 1500);
    assert_eq!(std::fs::read(&path).unwrap(), data);
}

#[tokio::test]
async fn test_dispatcher_truncates_stale_output() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.bin");
    std::fs::write(&path, b"left over from last time").unwrap();

    let (connector, _stats) = Scripted::new(Vec::<(&'static str, Peer)>::new());
    let _dispatcher = DownloadDispatcher::new(
        DownloadConfig::new(&path).with_file_name("out.bin"),
        connector,
    )
    .await
    .unwrap();
    assert_eq!(file_len(&path), 0);
}
