//! MDP 클라이언트 (수신자)
//!
//! 멀티캐스트 그룹에서 전송을 발견하고 파일 집합을 재구성한다.
//!
//! 사용법:
//!   cargo run --release --bin mdp-client -- --output <DIR> [OPTIONS]
//!
//! 예시:
//!   # 처음 발견한 전송 수신
//!   cargo run --release --bin mdp-client -- --output ./recv
//!
//!   # 특정 전송만 수신
//!   cargo run --release --bin mdp-client -- -o ./recv --transfer <HEX_ID>

use std::net::Ipv4Addr;
use std::path::PathBuf;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use mdp::message::parse_transfer_id;
use mdp::{Client, Config, Multicast, MulticastAddr, TransferId};

/// 클라이언트 설정
struct ClientConfig {
    output: Option<PathBuf>,
    target: Option<TransferId>,
    addr: MulticastAddr,
    config: Config,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            output: None,
            target: None,
            addr: MulticastAddr::default(),
            config: Config::default(),
        }
    }
}

fn parse_args() -> ClientConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut config = ClientConfig::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--output" | "-o" => {
                if i + 1 < args.len() {
                    config.output = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--transfer" | "-t" => {
                if i + 1 < args.len() {
                    config.target =
                        Some(parse_transfer_id(&args[i + 1]).expect("유효한 64자리 16진수 필요"));
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
                    r#"MDP Client - Multicast Distribution Protocol 수신자

멀티캐스트 그룹의 알림을 듣고 전송 하나를 끝까지 수신해서 파일 집합을
재구성한다. 완료 후 모든 파일의 BLAKE3 해시를 검증한다.

사용법:
  cargo run --release --bin mdp-client -- --output <DIR> [OPTIONS]

옵션:
  -o, --output <DIR>      재구성 대상 디렉터리 (필수)
  -t, --transfer <HEX>    수신할 전송 식별자 (기본: 처음 발견한 전송)
  -g, --group <ADDR>      멀티캐스트 그룹 (기본: 239.255.77.77)
  --interface <ADDR>      가입 인터페이스 (기본: OS 선택)
  -c, --capacity <BYTES>  데이터그램 용량 (서버와 같아야 함, 기본: 1452)
  --preset <NAME>         설정 프리셋: default | local | lossy
  -h, --help              이 도움말 출력
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

    let client_config = parse_args();
    let output = client_config.output.unwrap_or_else(|| {
        eprintln!("--output <DIR> 필요 (--help 참고)");
        std::process::exit(1);
    });

    info!("MDP Client starting...");
    info!("Output: {:?}", output);
    info!("Group: {}", client_config.addr.group);

    let transport = Multicast::client(
        &client_config.addr,
        client_config.config.datagram_capacity,
        client_config.config.channel_capacity,
    )
    .await?;

    let client = Client::new(
        client_config.config,
        transport,
        &output,
        client_config.target,
    )?;
    let handle = client.handle();

    // Ctrl-C로 정지
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("정지 신호 수신");
            handle.stop();
        }
    });

    let stats = client.run().await?;
    info!("수신 완료, 해시 검증 통과");
    info!("{}", stats.summary());
    Ok(())
}
