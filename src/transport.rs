//! 멀티캐스트 전송 계층
//!
//! 논리 채널 세 개를 제공한다: "서버→클라이언트 컨트롤", "클라이언트→서버
//! 컨트롤", "데이터". UDP 멀티캐스트 구현은 채널마다 포트 하나를 쓰고,
//! 소켓 펌프 태스크가 mpsc 큐로 프레임을 나른다. 수신 에러는 인밴드로
//! (`Err` 항목) 전달되어 소유 루프가 중단을 결정한다.
//!
//! 테스트용으로 소켓 없는 `loopback()` 쌍도 제공한다.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::{Error, Result};

/// 전송 프레임 (데이터그램 하나)
pub type Frame = Bytes;

/// 멀티캐스트 그룹 주소 설정
#[derive(Debug, Clone)]
pub struct MulticastAddr {
    /// 멀티캐스트 그룹
    pub group: Ipv4Addr,

    /// 가입/송신 인터페이스 (UNSPECIFIED면 OS 기본)
    pub interface: Ipv4Addr,

    /// 서버→클라이언트 컨트롤 포트
    pub control_to_client_port: u16,

    /// 클라이언트→서버 컨트롤 포트
    pub control_to_server_port: u16,

    /// 데이터 포트
    pub data_port: u16,

    /// 멀티캐스트 TTL
    pub ttl: u32,
}

impl Default for MulticastAddr {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(239, 255, 77, 77),
            interface: Ipv4Addr::UNSPECIFIED,
            control_to_client_port: 7701,
            control_to_server_port: 7702,
            data_port: 7703,
            ttl: 1,
        }
    }
}

/// 멀티캐스트 전송 핸들 (역할별 채널 구성)
///
/// 서버 역할: 컨트롤 송신 + 데이터 송신 + 클라이언트→서버 컨트롤 수신.
/// 클라이언트 역할: 컨트롤 송신 + 서버→클라이언트 컨트롤 수신 + 데이터 수신.
pub struct Multicast {
    datagram_capacity: usize,
    control_out: mpsc::Sender<Result<Frame>>,
    data_out: Option<mpsc::Sender<Result<Frame>>>,
    control_in: Option<mpsc::Receiver<Result<Frame>>>,
    data_in: Option<mpsc::Receiver<Result<Frame>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Multicast {
    /// 서버 역할로 UDP 멀티캐스트에 연결
    pub async fn server(
        addr: &MulticastAddr,
        datagram_capacity: usize,
        channel_capacity: usize,
    ) -> Result<Self> {
        let send_socket = send_socket(addr).await?;
        let send_socket = std::sync::Arc::new(send_socket);

        let (control_out, control_out_rx) = mpsc::channel(channel_capacity);
        let (data_out, data_out_rx) = mpsc::channel(channel_capacity);
        let (control_in_tx, control_in) = mpsc::channel(channel_capacity);

        let listen = listen_socket(addr, addr.control_to_server_port)?;

        let tasks = vec![
            spawn_send_pump(
                send_socket.clone(),
                SocketAddrV4::new(addr.group, addr.control_to_client_port),
                control_out_rx,
            ),
            spawn_send_pump(
                send_socket,
                SocketAddrV4::new(addr.group, addr.data_port),
                data_out_rx,
            ),
            spawn_recv_pump(listen, control_in_tx, datagram_capacity),
        ];

        Ok(Self {
            datagram_capacity,
            control_out,
            data_out: Some(data_out),
            control_in: Some(control_in),
            data_in: None,
            tasks,
        })
    }

    /// 클라이언트 역할로 UDP 멀티캐스트에 연결
    pub async fn client(
        addr: &MulticastAddr,
        datagram_capacity: usize,
        channel_capacity: usize,
    ) -> Result<Self> {
        let send_socket = send_socket(addr).await?;
        let send_socket = std::sync::Arc::new(send_socket);

        let (control_out, control_out_rx) = mpsc::channel(channel_capacity);
        let (control_in_tx, control_in) = mpsc::channel(channel_capacity);
        let (data_in_tx, data_in) = mpsc::channel(channel_capacity);

        let control_listen = listen_socket(addr, addr.control_to_client_port)?;
        let data_listen = listen_socket(addr, addr.data_port)?;

        let tasks = vec![
            spawn_send_pump(
                send_socket,
                SocketAddrV4::new(addr.group, addr.control_to_server_port),
                control_out_rx,
            ),
            spawn_recv_pump(control_listen, control_in_tx, datagram_capacity),
            spawn_recv_pump(data_listen, data_in_tx, datagram_capacity),
        ];

        Ok(Self {
            datagram_capacity,
            control_out,
            data_out: None,
            control_in: Some(control_in),
            data_in: Some(data_in),
            tasks,
        })
    }

    /// 테스트용 인메모리 루프백 쌍 (서버 역할, 클라이언트 역할)
    pub fn loopback(datagram_capacity: usize, channel_capacity: usize) -> (Self, Self) {
        let (to_server_tx, to_server_rx) = mpsc::channel(channel_capacity);
        let (to_client_tx, to_client_rx) = mpsc::channel(channel_capacity);
        let (data_tx, data_rx) = mpsc::channel(channel_capacity);

        let server = Self {
            datagram_capacity,
            control_out: to_client_tx,
            data_out: Some(data_tx),
            control_in: Some(to_server_rx),
            data_in: None,
            tasks: Vec::new(),
        };
        let client = Self {
            datagram_capacity,
            control_out: to_server_tx,
            data_out: None,
            control_in: Some(to_client_rx),
            data_in: Some(data_rx),
            tasks: Vec::new(),
        };
        (server, client)
    }

    /// 데이터그램 용량 (바이트)
    pub fn datagram_capacity(&self) -> usize {
        self.datagram_capacity
    }

    /// 컨트롤 프레임 송신 (역할에 따라 상대 컨트롤 채널로)
    pub async fn send_control(&self, frame: Frame) -> Result<()> {
        self.control_out
            .send(Ok(frame))
            .await
            .map_err(|_| Error::ChannelClosed)
    }

    /// 데이터 프레임 송신 (서버 역할 전용)
    pub async fn send_data(&self, frame: Frame) -> Result<()> {
        match &self.data_out {
            Some(sender) => sender.send(Ok(frame)).await.map_err(|_| Error::ChannelClosed),
            None => Err(Error::ChannelClosed),
        }
    }

    /// 컨트롤 수신 채널 가져오기 (한 번만 가능)
    pub fn take_control_in(&mut self) -> Option<mpsc::Receiver<Result<Frame>>> {
        self.control_in.take()
    }

    /// 데이터 수신 채널 가져오기 (클라이언트 역할, 한 번만 가능)
    pub fn take_data_in(&mut self) -> Option<mpsc::Receiver<Result<Frame>>> {
        self.data_in.take()
    }

    /// 전송 종료. 펌프 태스크를 중단한다.
    pub fn close(self) -> Result<()> {
        for task in &self.tasks {
            task.abort();
        }
        Ok(())
    }
}

async fn send_socket(addr: &MulticastAddr) -> Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_multicast_ttl_v4(addr.ttl)?;
    socket.set_multicast_loop_v4(true)?;
    if addr.interface != Ipv4Addr::UNSPECIFIED {
        // 송신 인터페이스는 socket2 경유로만 지정 가능
        let sock_ref = socket2::SockRef::from(&socket);
        sock_ref.set_multicast_if_v4(&addr.interface)?;
    }
    Ok(socket)
}

fn listen_socket(addr: &MulticastAddr, port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    // 한 호스트에서 여러 수신자가 같은 포트를 공유할 수 있게
    socket.set_reuse_address(true)?;
    let bind_addr: SocketAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into();
    socket.bind(&bind_addr.into())?;
    socket.join_multicast_v4(&addr.group, &addr.interface)?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket.into())?)
}

fn spawn_send_pump(
    socket: std::sync::Arc<UdpSocket>,
    target: SocketAddrV4,
    mut queue: mpsc::Receiver<Result<Frame>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = queue.recv().await {
            if let Ok(frame) = item {
                if let Err(err) = socket.send_to(&frame, SocketAddr::from(target)).await {
                    warn!("송신 실패 ({}): {}", target, err);
                }
            }
        }
    })
}

fn spawn_recv_pump(
    socket: UdpSocket,
    out: mpsc::Sender<Result<Frame>>,
    datagram_capacity: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; datagram_capacity.max(2048)];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, _addr)) => {
                    let frame = Bytes::copy_from_slice(&buf[..len]);
                    if out.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    // 소켓 에러는 인밴드로 전달하고 펌프 종료
                    let _ = out.send(Err(err.into())).await;
                    break;
                }
            }
        }
    })
}
