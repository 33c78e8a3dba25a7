// Copyright (c) 2026 shaneyale (shaneyale86@gmail.com)
// All rights reserved.

//! # 媒体缓存代理
//!
//! 程序入口：初始化日志、载入配置、构建引擎并启动接受循环，
//! 同时在后台运行一个从标准输入读取指令的管理控制台。

use mediacache::{
    config::Config,
    engine::{Engine, EngineBuilder},
    server::ProxyServer,
    util::format_file_size,
};

use chrono::{DateTime, Local};
use log::{error, info};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    runtime::Builder,
};

use std::{
    process,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

const CONFIG_FILE: &str = "config/development.toml";
const LOG_CONFIG_FILE: &str = "config/log4rs.yaml";

fn main() {
    // 1. 日志系统：通过外部 YAML 配置级别与输出目的地
    if let Err(e) = log4rs::init_file(LOG_CONFIG_FILE, Default::default()) {
        eprintln!("无法从{}初始化日志系统：{}", LOG_CONFIG_FILE, e);
    }

    // 2. 配置
    let config = match Config::from_toml(CONFIG_FILE) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            eprintln!("{}", e);
            process::exit(1);
        }
    };
    info!("配置文件已载入");

    // 3. 运行时：工作线程数来自配置
    let runtime = match Builder::new_multi_thread()
        .worker_threads(config.worker_threads())
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("无法创建异步运行时：{}", e);
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(serve(config)) {
        error!("{}", e);
        process::exit(1);
    }
}

async fn serve(config: Config) -> Result<(), mediacache::Exception> {
    let engine = Arc::new(EngineBuilder::from_config(&config)?.build()?);
    let server = ProxyServer::bind(Arc::clone(&engine)).await?;
    let start_time = Local::now();

    tokio::spawn(console(
        Arc::clone(&engine),
        server.active_connection(),
        start_time,
    ));

    server.run().await;
    engine.shutdown();
    info!("代理服务器已停止");
    Ok(())
}

/// 管理控制台
async fn console(engine: Arc<Engine>, active_connection: Arc<AtomicUsize>, start_time: DateTime<Local>) {
    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin);
    let mut input = String::new();
    loop {
        input.clear();
        match reader.read_line(&mut input).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let mut parts = input.trim().splitn(2, ' ');
        let cmd = parts.next().unwrap_or("");
        let arg = parts.next().map(str::trim).unwrap_or("");
        match cmd {
            "" => {}
            "stop" => {
                println!("停机指令已激活，正在关闭所有请求...");
                engine.shutdown();
                break;
            }
            "help" => {
                println!("== MediaCache Help ==");
                println!("stop        - 关闭引擎并退出");
                println!("status      - 查看当前代理运行状态");
                println!("proxy <url> - 显示播放器应使用的地址");
                println!("help        - 显示此帮助信息");
                println!("=====================");
            }
            "status" => {
                let (size, files) = engine.cache_usage();
                println!("== MediaCache 状态 ==");
                println!("监听地址: {}:{}", engine.host(), engine.port());
                println!("启动时间: {}", start_time.format("%Y-%m-%d %H:%M:%S"));
                println!("当前活跃连接数: {}", active_connection.load(Ordering::SeqCst));
                println!("跟踪中的URL数: {}", engine.tracked_requests());
                println!(
                    "缓存目录: {}（{}个文件，共{}）",
                    engine.cache_root().display(),
                    files,
                    format_file_size(size)
                );
                println!("=====================");
            }
            "proxy" if !arg.is_empty() => {
                println!("{}", engine.get_proxy_url(arg, true));
            }
            _ => {
                println!("无效的命令：{}", input.trim());
            }
        }
    }
}
