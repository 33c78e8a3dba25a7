// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! 端到端场景：真实的 `ProxyServer` 监听临时端口，背后是内存桩源站。

mod support;

use std::{fs, sync::Arc, time::Duration};

use mediacache::{
    disk_usage::LruDiskUsage, param::REQUEST_HEAD_TIMEOUT, CacheCallback, ReconnectPolicy,
};
use support::*;
use tokio::{io::AsyncWriteExt, net::TcpStream};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_full_play_empty_cache() {
    let proxy = start_proxy(StubOrigin::new(LENGTH, Duration::ZERO), ReconnectPolicy::Replace).await;

    let (head, body) = fetch(proxy.addr, URL, None).await;

    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Accept-Ranges: bytes\r\n"));
    assert!(head.contains("Content-Length: 100000\r\n"));
    assert!(head.contains("Content-Type: video/mp4\r\n"));
    assert!(!head.contains("Content-Range"));
    assert_eq!(body, origin_bytes(LENGTH));

    let cached = fs::read(proxy.cache_file()).unwrap();
    assert_eq!(cached.len(), LENGTH);
    assert_eq!(cached, origin_bytes(LENGTH));
    assert!(!proxy.partial_file().exists());
    assert_eq!(proxy.origin.offsets(), vec![0]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_seek_into_complete_cache() {
    let proxy = start_proxy(StubOrigin::new(LENGTH, Duration::ZERO), ReconnectPolicy::Replace).await;
    fs::write(proxy.cache_file(), origin_bytes(LENGTH)).unwrap();

    let (head, body) = fetch(proxy.addr, URL, Some(50_000)).await;

    assert_eq!(
        head,
        "HTTP/1.1 206 PARTIAL CONTENT\r\nAccept-Ranges: bytes\r\nContent-Length: 50000\r\nContent-Range: bytes 50000-99999/100000\r\nContent-Type: video/mp4\r\n\r\n"
    );
    assert_eq!(body, origin_bytes(LENGTH)[50_000..].to_vec());
    assert!(proxy.origin.offsets().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resume_after_abort() {
    let proxy = start_proxy(StubOrigin::new(LENGTH, Duration::ZERO), ReconnectPolicy::Replace).await;
    fs::write(proxy.partial_file(), &origin_bytes(LENGTH)[..30_000]).unwrap();

    let (head, body) = fetch(proxy.addr, URL, None).await;

    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-Length: 100000\r\n"));
    assert_eq!(body, origin_bytes(LENGTH));
    assert_eq!(proxy.origin.offsets(), vec![30_000]);
    assert_eq!(fs::read(proxy.cache_file()).unwrap(), origin_bytes(LENGTH));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_clients_share_one_writer() {
    let proxy = start_proxy(
        StubOrigin::new(LENGTH, Duration::from_millis(2)),
        ReconnectPolicy::Multiplex,
    )
    .await;

    let (a, b) = tokio::join!(
        fetch(proxy.addr, URL, None),
        fetch(proxy.addr, URL, None)
    );

    assert_eq!(a.1, origin_bytes(LENGTH));
    assert_eq!(b.1, origin_bytes(LENGTH));
    assert_eq!(proxy.origin.max_active(), 1);
    wait_until(|| proxy.engine.tracked_requests() == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reconnect_replaces_previous_client() {
    let proxy = start_proxy(
        StubOrigin::new(LENGTH, Duration::from_millis(5)),
        ReconnectPolicy::Replace,
    )
    .await;

    let mut first = TcpStream::connect(proxy.addr).await.unwrap();
    first
        .write_all(get_request(URL, None).as_bytes())
        .await
        .unwrap();
    let partial = proxy.partial_file();
    wait_until(|| fs::metadata(&partial).map(|m| m.len() > 0).unwrap_or(false)).await;

    let (_, second) = fetch(proxy.addr, URL, None).await;
    let (_, first_body) = split_response(&read_until_closed(&mut first).await);

    assert_eq!(second, origin_bytes(LENGTH));
    assert!(first_body.len() < LENGTH);
    assert_eq!(first_body, origin_bytes(LENGTH)[..first_body.len()].to_vec());
    assert_eq!(proxy.origin.max_active(), 1);
    // 第二个写入任务从已增长的缓存末尾继续
    let offsets = proxy.origin.offsets();
    assert_eq!(offsets[0], 0);
    assert!(offsets.iter().skip(1).all(|o| *o > 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_far_seek_bypasses_cache() {
    let proxy = start_proxy(StubOrigin::new(LENGTH, Duration::ZERO), ReconnectPolicy::Replace).await;

    let (head, body) = fetch(proxy.addr, URL, Some(90_000)).await;

    assert!(head.starts_with("HTTP/1.1 206 PARTIAL CONTENT\r\n"));
    assert!(head.contains("Content-Length: 10000\r\n"));
    assert!(head.contains("Content-Range: bytes 90000-99999/100000\r\n"));
    assert_eq!(body, origin_bytes(LENGTH)[90_000..].to_vec());
    assert!(!proxy.cache_file().exists());
    assert!(!proxy.partial_file().exists());
    assert_eq!(proxy.engine.cache_usage(), (0, 0));
    assert_eq!(proxy.origin.offsets(), vec![90_000]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_near_seek_is_cached() {
    let proxy = start_proxy(StubOrigin::new(LENGTH, Duration::ZERO), ReconnectPolicy::Replace).await;

    let (head, body) = fetch(proxy.addr, URL, Some(15_000)).await;

    assert!(head.contains("Content-Range: bytes 15000-99999/100000\r\n"));
    assert_eq!(body, origin_bytes(LENGTH)[15_000..].to_vec());
    assert_eq!(fs::read(proxy.cache_file()).unwrap(), origin_bytes(LENGTH));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_range_past_end_is_not_satisfiable() {
    let proxy = start_proxy(StubOrigin::new(LENGTH, Duration::ZERO), ReconnectPolicy::Replace).await;
    fs::write(proxy.cache_file(), origin_bytes(LENGTH)).unwrap();

    let (head, body) = fetch(proxy.addr, URL, Some(100_000)).await;

    assert_eq!(
        head,
        "HTTP/1.1 416 RANGE NOT SATISFIABLE\r\nContent-Range: bytes */100000\r\n\r\n"
    );
    assert!(body.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_proxy_url_switches_to_file_uri() {
    let proxy = start_proxy(StubOrigin::new(LENGTH, Duration::ZERO), ReconnectPolicy::Replace).await;

    let before = proxy.engine.get_proxy_url(URL, true);
    assert_eq!(
        before,
        format!("http://127.0.0.1:{}/{}", proxy.addr.port(), mediacache::util::encode(URL))
    );

    let (_, body) = fetch(proxy.addr, URL, None).await;
    assert_eq!(body.len(), LENGTH);

    let after = proxy.engine.get_proxy_url(URL, true);
    assert!(after.starts_with("file://"));
    assert!(proxy.engine.get_proxy_url(URL, false).starts_with("http://"));
}

#[derive(Default)]
struct Progress {
    seen: std::sync::Mutex<Vec<i32>>,
}

impl CacheCallback for Progress {
    fn on_cache_progress(&self, _file: &std::path::Path, url: &str, percents: i32) {
        assert_eq!(url, URL);
        self.seen.lock().unwrap().push(percents);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_progress_callbacks() {
    let proxy = start_proxy(StubOrigin::new(LENGTH, Duration::ZERO), ReconnectPolicy::Replace).await;
    let progress = Arc::new(Progress::default());
    proxy.engine.register_cache_callback(progress.clone());

    fetch(proxy.addr, URL, None).await;

    let seen = progress.seen.lock().unwrap().clone();
    assert_eq!(seen.last(), Some(&100));
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_engine_shutdown_stops_server() {
    let proxy = start_proxy(
        StubOrigin::new(LENGTH, Duration::from_millis(20)),
        ReconnectPolicy::Replace,
    )
    .await;

    let mut client = TcpStream::connect(proxy.addr).await.unwrap();
    client
        .write_all(get_request(URL, None).as_bytes())
        .await
        .unwrap();
    let partial = proxy.partial_file();
    wait_until(|| fs::metadata(&partial).map(|m| m.len() > 0).unwrap_or(false)).await;

    proxy.engine.shutdown();
    let (_, body) = split_response(&read_until_closed(&mut client).await);
    assert!(body.len() < LENGTH);

    tokio::time::timeout(Duration::from_secs(5), proxy.server)
        .await
        .unwrap()
        .unwrap();
    // 未完成的缓存文件被保留，供下次续传
    assert!(partial.exists());
    let active = Arc::clone(&proxy.origin.active);
    wait_until(move || active.load(std::sync::atomic::Ordering::SeqCst) == 0).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_finished_play_releases_request() {
    let proxy = start_proxy(StubOrigin::new(LENGTH, Duration::ZERO), ReconnectPolicy::Replace).await;

    let (_, body) = fetch(proxy.addr, URL, None).await;
    assert_eq!(body, origin_bytes(LENGTH));
    wait_until(|| proxy.engine.tracked_requests() == 0).await;

    // 条目释放后再次播放直接读取已完成的缓存
    let (_, body) = fetch(proxy.addr, URL, Some(50_000)).await;
    assert_eq!(body, origin_bytes(LENGTH)[50_000..].to_vec());
    assert_eq!(proxy.origin.offsets(), vec![0]);
}

#[cfg(target_os = "linux")]
fn open_files() -> Vec<std::path::PathBuf> {
    fs::read_dir("/proc/self/fd")
        .map(|dir| {
            dir.filter_map(|e| e.ok())
                .filter_map(|e| fs::read_link(e.path()).ok())
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_evicted_file_is_not_held_open() {
    let proxy = start_proxy_with(
        StubOrigin::new(LENGTH, Duration::ZERO),
        ReconnectPolicy::Replace,
        Arc::new(LruDiskUsage::total_size(150_000)),
        REQUEST_HEAD_TIMEOUT,
    )
    .await;
    let other = "http://origin.test/media/BigBuckBunny.mp4";

    fetch(proxy.addr, URL, None).await;
    fetch(proxy.addr, other, None).await;
    wait_until(|| proxy.engine.tracked_requests() == 0).await;

    assert!(!proxy.cache_file().exists());
    assert!(proxy.engine.cache_file(other).exists());

    #[cfg(target_os = "linux")]
    {
        let evicted = fs::canonicalize(proxy.dir.path())
            .unwrap()
            .join("cache")
            .join(proxy.cache_file().file_name().unwrap());
        wait_until(|| {
            !open_files()
                .iter()
                .any(|p| p.to_string_lossy().starts_with(&*evicted.to_string_lossy()))
        })
        .await;
    }
}
