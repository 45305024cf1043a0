//! MDP 서버 (송신자)
//!
//! 디렉터리 하나를 스캔해서 멀티캐스트 그룹에 방송한다.
//!
//! 사용법:
//!   cargo run --release --bin mdp-server -- --root <DIR> [OPTIONS]
//!
//! 예시:
//!   # 기본 그룹으로 배포
//!   cargo run --release --bin mdp-server -- --root ./dist
//!
//!   # 점보 프레임 LAN
//!   cargo run --release --bin mdp-server -- -r ./dist --preset local

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use mdp::message::transfer_id_hex;
use mdp::{scan_dir, Config, Multicast, MulticastAddr, Server, VirtualTarballReader};

/// 서버 설정
struct ServerConfig {
    root: Option<PathBuf>,
    addr: MulticastAddr,
    config: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root: None,
            addr: MulticastAddr::default(),
            config: Config::default(),
        }
    }
}

fn parse_args() -> ServerConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ServerConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--root" | "-r" => {
                if i + 1 < args.len() {
                    config.root = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--group" | "-g" => {
                if i + 1 < args.len() {
                    config.addr.group = args[i + 1].parse().expect("유효한 그룹 주소 필요");
                    i += 1;
                }
            }
            "--interface" => {
                if i + 1 < args.len() {
                    config.addr.interface =
                        args[i + 1].parse::<Ipv4Addr>().expect("유효한 주소 필요");
                    i += 1;
                }
            }
            "--capacity" | "-c" => {
                if i + 1 < args.len() {
                    config.config.datagram_capacity =
                        args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--ttl" => {
                if i + 1 < args.len() {
                    config.addr.ttl = args[i + 1].parse().expect("유효한 숫자 필요");
                    i += 1;
                }
            }
            "--preset" => {
                if i + 1 < args.len() {
                    config.config = match args[i + 1].as_str() {
                        "local" => Config::local_network(),
                        "lossy" => Config::lossy_network(),
                        "default" => Config::default(),
                        other => panic!("알 수 없는 프리셋: {}", other),
                    };
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!(
                    r#"MDP Server - Multicast Distribution Protocol 송신자

디렉터리 하나를 멀티캐스트 그룹에 방송하고, 수신자의 메타데이터/데이터
요청에 응답한다. 수신자는 NAK로 누락 리전만 요청한다.

사용법:
  cargo run --release --bin mdp-server -- --root <DIR> [OPTIONS]

옵션:
  -r, --root <DIR>        배포할 디렉터리 (필수)
  -g, --group <ADDR>      멀티캐스트 그룹 (기본: 239.255.77.77)
  --interface <ADDR>      송신/가입 인터페이스 (기본: OS 선택)
  -c, --capacity <BYTES>  데이터그램 용량 (기본: 1452)
  --ttl <N>               멀티캐스트 TTL (기본: 1)
  --preset <NAME>         설정 프리셋: default | local | lossy
  -h, --help              이 도움말 출력

예시:
  # 기본 설정으로 배포
  cargo run --release --bin mdp-server -- --root ./dist

  # 점보 프레임 LAN에서 배포
  cargo run --release --bin mdp-server -- -r ./dist --preset local
"#
                );
                std::process::exit(0);
            }
            _ => {}
        }
        i += 1;
    }

    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let server_config = parse_args();
    let root = server_config.root.unwrap_or_else(|| {
        eprintln!("--root <DIR> 필요 (--help 참고)");
        std::process::exit(1);
    });

    info!("MDP Server starting...");
    info!("Root: {:?}", root);
    info!("Group: {}", server_config.addr.group);
    info!(
        "Datagram capacity: {} bytes",
        server_config.config.datagram_capacity
    );

    // 매니페스트 스캔 + 해시
    let entries = scan_dir(&root)?;
    let total_bytes: u64 = entries.iter().map(|e| e.size).sum();
    info!("Manifest: {} files, {} bytes", entries.len(), total_bytes);

    let tarball = VirtualTarballReader::new(entries, &root)?;
    info!("Transfer id: {}", transfer_id_hex(&tarball.transfer_id()));

    let transport = Multicast::server(
        &server_config.addr,
        server_config.config.datagram_capacity,
        server_config.config.channel_capacity,
    )
    .await?;

    let server = Server::new(server_config.config, transport, tarball)?;
    let handle = server.handle();

    // Ctrl-C로 정지
    let stop_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("정지 신호 수신");
            stop_handle.stop();
        }
    });

    // 주기적 통계 출력
    let stats_handle = handle.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(5)).await;
            if !stats_handle.is_running() {
                break;
            }
            info!("{}", stats_handle.stats().summary());
        }
    });

    server.run().await?;
    info!("{}", handle.stats().summary());
    Ok(())
}
